//! Leader state machine - drives one round at a time
//!
//! ```text
//! AwaitingStart -> Observing -> Grace -> AwaitingReports -> Done
//!       ^                                                    |
//!       +------------------ round timer ---------------------+
//! ```
//!
//! The round timer restarts the round from any phase. Once the round counter
//! passes `max_round` the leader retires and requests a leader change.

use crate::collector::{ObservationCollector, ReportCollector};
use crate::crypto::{observation_digest, Signature};
use crate::error::{log_rejection, Rejection};
use crate::event::{Action, TimerId};
use crate::keys::KeyStore;
use crate::message::{Envelope, Message};
use crate::report::{AttestedReport, Report};
use crate::types::{
    Epoch, LeaderStats, NodeIndex, NodeRole, Observation, ProtocolParams, Round, Value,
};
use std::sync::Arc;

/// Leader round phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderPhase {
    AwaitingStart,
    Observing,
    Grace,
    AwaitingReports,
    Done,
    /// Round limit reached; no further rounds are started
    Retired,
}

impl LeaderPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaderPhase::AwaitingStart => "awaiting-start",
            LeaderPhase::Observing => "observing",
            LeaderPhase::Grace => "grace",
            LeaderPhase::AwaitingReports => "awaiting-reports",
            LeaderPhase::Done => "done",
            LeaderPhase::Retired => "retired",
        }
    }
}

/// Leader side of the protocol
pub struct LeaderStateMachine {
    /// Epoch every digest and bundle is bound to
    epoch: Epoch,
    /// Network parameters
    params: ProtocolParams,
    /// This node's keys and the public key table
    keys: Arc<KeyStore>,
    /// Current round; 0 before the first start
    round: Round,
    /// Phase of the current round
    phase: LeaderPhase,
    /// Verified observations of the current round
    observations: ObservationCollector,
    /// Report sent for signing, set once the grace period ends
    report: Option<Report>,
    /// Report signatures matching `report`
    reports: ReportCollector,
    /// Counters
    stats: LeaderStats,
}

impl LeaderStateMachine {
    pub fn new(epoch: Epoch, params: ProtocolParams, keys: Arc<KeyStore>) -> Self {
        Self {
            epoch,
            observations: ObservationCollector::new(params.num_nodes, params.quorum()),
            reports: ReportCollector::new(params.num_nodes, params.faults),
            params,
            keys,
            round: 0,
            phase: LeaderPhase::AwaitingStart,
            report: None,
            stats: LeaderStats::default(),
        }
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn phase(&self) -> LeaderPhase {
        self.phase
    }

    /// Report being attested this round, once assembled
    pub fn current_report(&self) -> Option<&Report> {
        self.report.as_ref()
    }

    pub fn observation_count(&self) -> usize {
        self.observations.count()
    }

    pub fn report_signature_count(&self) -> usize {
        self.reports.count()
    }

    pub fn stats(&self) -> LeaderStats {
        let mut stats = self.stats.clone();
        stats.current_round = self.round;
        stats
    }

    /// Start the next round, abandoning the current one if unfinished
    pub fn start_round(&mut self) -> Vec<Action> {
        if self.phase == LeaderPhase::Retired {
            tracing::debug!(round = self.round, "Leader retired, ignoring round start");
            return Vec::new();
        }

        if !matches!(self.phase, LeaderPhase::AwaitingStart | LeaderPhase::Done) {
            self.stats.rounds_abandoned += 1;
            tracing::warn!(
                "Round {} abandoned in phase {} with {} observations, {} report signatures",
                self.round,
                self.phase.as_str(),
                self.observations.count(),
                self.reports.count()
            );
        }

        self.round += 1;
        self.observations.reset();
        self.reports.reset(None);
        self.report = None;

        if self.round > self.params.max_round {
            self.phase = LeaderPhase::Retired;
            tracing::info!(
                "Round {} exceeds max round {}, requesting leader change",
                self.round,
                self.params.max_round
            );
            return vec![
                Action::CancelTimer(TimerId::Round),
                Action::CancelTimer(TimerId::Grace),
                Action::RequestLeaderChange {
                    epoch: self.epoch,
                    last_round: self.round - 1,
                },
            ];
        }

        self.phase = LeaderPhase::Observing;
        self.stats.rounds_started += 1;
        tracing::info!(round = self.round, epoch = self.epoch, "Starting round");

        vec![
            Action::CancelTimer(TimerId::Grace),
            Action::SetTimer {
                id: TimerId::Round,
                round: self.round,
                duration: self.params.round_timeout(),
            },
            Action::Broadcast(Message::ObserveRequest { round: self.round }),
        ]
    }

    /// Handle a timer armed for `round`; stale alarms are ignored
    pub fn on_timer(&mut self, id: TimerId, round: Round) -> Vec<Action> {
        if round != self.round {
            tracing::trace!(?id, round, current = self.round, "Ignoring stale timer");
            return Vec::new();
        }
        match id {
            TimerId::Round => self.start_round(),
            TimerId::Grace => self.on_grace_elapsed(),
        }
    }

    /// Dispatch an inbound message addressed to the leader role
    pub fn on_message(&mut self, envelope: &Envelope) -> Vec<Action> {
        let result = match &envelope.message {
            Message::Observe {
                round,
                value,
                signature,
            } => self.on_observation(envelope.sender, *round, *value, *signature),
            Message::Report {
                round,
                report,
                signature,
            } => self.on_report(envelope.sender, *round, report, *signature),
            _ => return Vec::new(),
        };

        result.unwrap_or_else(|rejection| {
            self.stats.messages_rejected += 1;
            log_rejection(
                NodeRole::Leader,
                self.round,
                envelope.sender,
                envelope.message.topic(),
                &rejection,
            );
            Vec::new()
        })
    }

    /// Validate and record a follower's observation
    pub fn on_observation(
        &mut self,
        sender: NodeIndex,
        round: Round,
        value: Value,
        signature: Signature,
    ) -> Result<Vec<Action>, Rejection> {
        if round != self.round {
            return Err(Rejection::RoundMismatch {
                current: self.round,
                got: round,
            });
        }
        if !matches!(self.phase, LeaderPhase::Observing | LeaderPhase::Grace) {
            return Err(Rejection::WrongPhase {
                phase: self.phase.as_str(),
            });
        }
        if !self.keys.is_known(sender) {
            return Err(Rejection::UnknownNode(sender));
        }
        if self.observations.has_observation(sender) {
            return Err(Rejection::DuplicateObservation(sender));
        }

        let digest = observation_digest(self.epoch, round, value);
        if !self.keys.verify(sender, &digest, &signature) {
            return Err(Rejection::BadSignature { signer: sender });
        }

        let reached_quorum = self.observations.record(Observation {
            value,
            signature,
            node: sender,
        })?;
        self.stats.observations_accepted += 1;
        tracing::debug!(
            round,
            sender,
            value,
            count = self.observations.count(),
            "Observation recorded"
        );

        if reached_quorum && self.phase == LeaderPhase::Observing {
            self.phase = LeaderPhase::Grace;
            tracing::debug!(round, "Observation quorum reached, grace period started");
            return Ok(vec![Action::SetTimer {
                id: TimerId::Grace,
                round,
                duration: self.params.grace_period(),
            }]);
        }
        Ok(Vec::new())
    }

    /// Validate and record a follower's signature over the current report
    pub fn on_report(
        &mut self,
        sender: NodeIndex,
        round: Round,
        report: &Report,
        signature: Signature,
    ) -> Result<Vec<Action>, Rejection> {
        if round != self.round {
            return Err(Rejection::RoundMismatch {
                current: self.round,
                got: round,
            });
        }
        if self.phase != LeaderPhase::AwaitingReports {
            return Err(Rejection::WrongPhase {
                phase: self.phase.as_str(),
            });
        }
        let current = *self.reports.digest().ok_or(Rejection::NoActiveReport)?;
        if report.digest(self.epoch, round) != current {
            return Err(Rejection::ReportMismatch);
        }
        if !self.keys.is_known(sender) {
            return Err(Rejection::UnknownNode(sender));
        }
        if self.reports.has_signed(sender) {
            return Err(Rejection::DuplicateReport(sender));
        }
        if !self.keys.verify(sender, &current, &signature) {
            return Err(Rejection::BadSignature { signer: sender });
        }

        let complete = self.reports.record(sender, &current, signature)?;
        self.stats.report_signatures_accepted += 1;
        tracing::debug!(
            round,
            sender,
            count = self.reports.count(),
            "Report signature recorded"
        );

        if complete {
            return Ok(self.finalize());
        }
        Ok(Vec::new())
    }

    fn on_grace_elapsed(&mut self) -> Vec<Action> {
        if self.phase != LeaderPhase::Grace {
            tracing::trace!(phase = self.phase.as_str(), "Grace timer outside grace phase");
            return Vec::new();
        }

        let observations = self.observations.observations().cloned();
        let Some(report) = Report::assemble(observations, self.params.quorum()) else {
            tracing::warn!(
                round = self.round,
                count = self.observations.count(),
                "Grace elapsed without a quorum of observations"
            );
            return Vec::new();
        };

        let digest = report.digest(self.epoch, self.round);
        self.reports.reset(Some(digest));
        self.report = Some(report.clone());
        self.phase = LeaderPhase::AwaitingReports;

        tracing::info!(
            "Round {} report assembled from {} observations (median {:?})",
            self.round,
            self.observations.count(),
            report.median()
        );

        vec![Action::Broadcast(Message::ReportRequest {
            round: self.round,
            report,
        })]
    }

    fn finalize(&mut self) -> Vec<Action> {
        let Some(report) = self.report.clone() else {
            return Vec::new();
        };
        let attested =
            AttestedReport::build(self.epoch, self.round, report, self.reports.collected());
        self.phase = LeaderPhase::Done;
        self.stats.rounds_finalized += 1;

        tracing::info!(
            "Round {} finalized with {} signatures",
            self.round,
            attested.signatures().len()
        );

        vec![Action::Broadcast(Message::Final {
            round: self.round,
            attested,
        })]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{key_stores, params, signed_observation};
    use std::time::Duration;

    const EPOCH: Epoch = 12345;

    fn leader(num_nodes: usize, faults: usize) -> (LeaderStateMachine, Vec<Arc<KeyStore>>) {
        let keys: Vec<Arc<KeyStore>> = key_stores(num_nodes).into_iter().map(Arc::new).collect();
        let leader = LeaderStateMachine::new(EPOCH, params(num_nodes, faults), keys[0].clone());
        (leader, keys)
    }

    fn observe(leader: &mut LeaderStateMachine, keys: &KeyStore, value: Value) -> Vec<Action> {
        let obs = signed_observation(keys, EPOCH, leader.round(), value);
        leader
            .on_observation(obs.node, leader.round(), value, obs.signature)
            .unwrap()
    }

    fn sign_report(
        leader: &mut LeaderStateMachine,
        keys: &KeyStore,
    ) -> Result<Vec<Action>, Rejection> {
        let report = leader.current_report().unwrap().clone();
        let round = leader.round();
        let signature = keys.sign(&report.digest(EPOCH, round));
        leader.on_report(keys.index(), round, &report, signature)
    }

    /// Drive a leader to `AwaitingReports` with the given observations
    fn drive_to_reports(leader: &mut LeaderStateMachine, keys: &[Arc<KeyStore>], values: &[Value]) {
        leader.start_round();
        for (i, value) in values.iter().enumerate() {
            observe(leader, &keys[i], *value);
        }
        let round = leader.round();
        leader.on_timer(TimerId::Grace, round);
        assert_eq!(leader.phase(), LeaderPhase::AwaitingReports);
    }

    #[test]
    fn test_start_round_arms_timer_and_requests_observations() {
        let (mut leader, _) = leader(5, 1);
        let actions = leader.start_round();

        assert_eq!(leader.round(), 1);
        assert_eq!(leader.phase(), LeaderPhase::Observing);
        assert!(actions.contains(&Action::SetTimer {
            id: TimerId::Round,
            round: 1,
            duration: Duration::from_millis(2_000),
        }));
        assert!(actions.contains(&Action::Broadcast(Message::ObserveRequest { round: 1 })));
    }

    #[test]
    fn test_single_observation_quorum_with_no_faults() {
        let (mut leader, keys) = leader(5, 0);
        leader.start_round();

        let actions = observe(&mut leader, &keys[3], 4200);
        assert_eq!(leader.phase(), LeaderPhase::Grace);
        assert_eq!(
            actions,
            vec![Action::SetTimer {
                id: TimerId::Grace,
                round: 1,
                duration: Duration::from_millis(50),
            }]
        );

        let actions = leader.on_timer(TimerId::Grace, 1);
        let Action::Broadcast(Message::ReportRequest { round, report }) = &actions[0] else {
            panic!("expected report request, got {actions:?}");
        };
        assert_eq!(*round, 1);
        assert_eq!(report.len(), 1);
        assert_eq!(report.observations()[0].node, 3);
        assert_eq!(report.observations()[0].value, 4200);
    }

    #[test]
    fn test_late_observations_recorded_during_grace() {
        let (mut leader, keys) = leader(5, 1);
        leader.start_round();
        observe(&mut leader, &keys[1], 30);
        observe(&mut leader, &keys[2], 10);
        assert!(!observe(&mut leader, &keys[3], 20).is_empty());
        assert_eq!(leader.phase(), LeaderPhase::Grace);

        // fourth observation is kept but does not re-arm the grace timer
        assert!(observe(&mut leader, &keys[4], 25).is_empty());
        assert_eq!(leader.observation_count(), 4);

        leader.on_timer(TimerId::Grace, 1);
        let report = leader.current_report().unwrap();
        assert_eq!(report.len(), 3);
        assert!(report.check_canonical(3, 5).is_ok());
    }

    #[test]
    fn test_observation_validation() {
        let (mut leader, keys) = leader(5, 1);

        let obs = signed_observation(&keys[1], EPOCH, 1, 10);
        assert!(matches!(
            leader.on_observation(1, 1, 10, obs.signature),
            Err(Rejection::RoundMismatch { current: 0, got: 1 })
        ));

        leader.start_round();
        observe(&mut leader, &keys[1], 10);
        assert_eq!(
            leader.on_observation(1, 1, 10, obs.signature),
            Err(Rejection::DuplicateObservation(1))
        );

        // signature by node 2 claimed as node 3
        let forged = signed_observation(&keys[2], EPOCH, 1, 11);
        assert_eq!(
            leader.on_observation(3, 1, 11, forged.signature),
            Err(Rejection::BadSignature { signer: 3 })
        );
        // signed for a different value
        let obs = signed_observation(&keys[4], EPOCH, 1, 11);
        assert_eq!(
            leader.on_observation(4, 1, 12, obs.signature),
            Err(Rejection::BadSignature { signer: 4 })
        );
        assert_eq!(
            leader.on_observation(9, 1, 11, obs.signature),
            Err(Rejection::UnknownNode(9))
        );
        assert_eq!(leader.observation_count(), 1);
    }

    #[test]
    fn test_finalizes_once_after_more_than_f_signatures() {
        let (mut leader, keys) = leader(5, 1);
        drive_to_reports(&mut leader, &keys, &[5, 6, 7]);

        assert!(sign_report(&mut leader, &keys[1]).unwrap().is_empty());
        assert_eq!(
            sign_report(&mut leader, &keys[1]),
            Err(Rejection::DuplicateReport(1))
        );
        assert_eq!(leader.report_signature_count(), 1);

        let actions = sign_report(&mut leader, &keys[2]).unwrap();
        let Action::Broadcast(Message::Final { round, attested }) = &actions[0] else {
            panic!("expected final, got {actions:?}");
        };
        assert_eq!(*round, 1);
        assert_eq!(attested.signers(), &[1, 2]);
        assert_eq!(leader.phase(), LeaderPhase::Done);

        // further signatures never produce a second bundle
        assert!(matches!(
            sign_report(&mut leader, &keys[3]),
            Err(Rejection::WrongPhase { .. })
        ));
        assert_eq!(leader.stats().rounds_finalized, 1);
    }

    #[test]
    fn test_report_for_other_digest_rejected() {
        let (mut leader, keys) = leader(5, 1);
        drive_to_reports(&mut leader, &keys, &[5, 6, 7]);

        let other = Report::assemble(
            (0..3).map(|i| signed_observation(&keys[i], EPOCH, 1, 100 + i as u64)),
            3,
        )
        .unwrap();
        let signature = keys[1].sign(&other.digest(EPOCH, 1));
        assert_eq!(
            leader.on_report(1, 1, &other, signature),
            Err(Rejection::ReportMismatch)
        );

        // right report, signature over something else
        let report = leader.current_report().unwrap().clone();
        assert_eq!(
            leader.on_report(1, 1, &report, signature),
            Err(Rejection::BadSignature { signer: 1 })
        );
        assert_eq!(leader.report_signature_count(), 0);
    }

    #[test]
    fn test_report_from_previous_round_dropped() {
        let (mut leader, keys) = leader(5, 1);
        leader.start_round();
        leader.start_round();
        drive_to_reports(&mut leader, &keys, &[5, 6, 7]);
        assert_eq!(leader.round(), 3);

        let report = leader.current_report().unwrap().clone();
        let signature = keys[1].sign(&report.digest(EPOCH, 2));
        let envelope = Envelope::new(
            1,
            Message::Report {
                round: 2,
                report,
                signature,
            },
        );
        assert!(leader.on_message(&envelope).is_empty());
        assert_eq!(leader.report_signature_count(), 0);
        assert_eq!(leader.stats().messages_rejected, 1);
    }

    #[test]
    fn test_round_timer_abandons_round() {
        let (mut leader, keys) = leader(5, 1);
        leader.start_round();
        observe(&mut leader, &keys[1], 1);

        let actions = leader.on_timer(TimerId::Round, 1);
        assert!(actions.contains(&Action::Broadcast(Message::ObserveRequest { round: 2 })));
        assert_eq!(leader.round(), 2);
        assert_eq!(leader.phase(), LeaderPhase::Observing);
        assert_eq!(leader.observation_count(), 0);
        assert_eq!(leader.stats().rounds_abandoned, 1);
    }

    #[test]
    fn test_stale_timers_ignored() {
        let (mut leader, keys) = leader(5, 1);
        leader.start_round();
        leader.start_round();

        assert!(leader.on_timer(TimerId::Round, 1).is_empty());
        assert_eq!(leader.round(), 2);

        for i in 1..4 {
            observe(&mut leader, &keys[i], i as u64);
        }
        assert!(leader.on_timer(TimerId::Grace, 1).is_empty());
        assert_eq!(leader.phase(), LeaderPhase::Grace);
    }

    #[test]
    fn test_leader_change_after_max_round() {
        let (mut leader, _) = leader(5, 1);
        for _ in 0..3 {
            let actions = leader.start_round();
            assert!(!actions
                .iter()
                .any(|a| matches!(a, Action::RequestLeaderChange { .. })));
        }

        let actions = leader.start_round();
        assert!(actions.contains(&Action::RequestLeaderChange {
            epoch: EPOCH,
            last_round: 3,
        }));
        assert_eq!(leader.phase(), LeaderPhase::Retired);
        assert!(leader.start_round().is_empty());
        assert!(leader.on_timer(TimerId::Round, 4).is_empty());
    }
}
