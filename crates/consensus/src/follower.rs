//! Follower state machine - reacts to leader prompts and peer echoes
//!
//! Per-round progress is one ordered phase:
//! `Idle < AwaitingValue < Observed < Reported < Echoed < Completed`.
//! Each handler checks the phase once and only ever moves it forward, so a
//! follower never signs two reports or seeds two echoes in one round.

use crate::crypto::observation_digest;
use crate::echo::EchoDisseminator;
use crate::error::{log_rejection, Rejection};
use crate::event::Action;
use crate::keys::KeyStore;
use crate::message::{Envelope, Message};
use crate::report::{AttestedReport, Report};
use crate::types::{Epoch, FollowerStats, NodeIndex, NodeRole, ProtocolParams, Round, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FollowerPhase {
    /// No round joined yet
    Idle,
    /// Observation requested, waiting on the value source
    AwaitingValue,
    /// Signed observation sent to the leader
    Observed,
    /// Report signature sent to the leader
    Reported,
    /// Verified bundle echoed to peers
    Echoed,
    /// Echo threshold reached and bundle delivered
    Completed,
}

impl FollowerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FollowerPhase::Idle => "idle",
            FollowerPhase::AwaitingValue => "awaiting-value",
            FollowerPhase::Observed => "observed",
            FollowerPhase::Reported => "reported",
            FollowerPhase::Echoed => "echoed",
            FollowerPhase::Completed => "completed",
        }
    }
}

/// Follower side of the protocol
pub struct FollowerStateMachine {
    /// Epoch every digest and bundle is bound to
    epoch: Epoch,
    /// Only this node's requests and bundles are accepted
    leader: NodeIndex,
    /// Network parameters
    params: ProtocolParams,
    /// This node's keys and the public key table
    keys: Arc<KeyStore>,
    /// Highest round seen from the leader
    round: Round,
    /// Progress within `round`
    phase: FollowerPhase,
    /// Echo state of the current round
    echo: EchoDisseminator,
    /// Counters
    stats: FollowerStats,
}

impl FollowerStateMachine {
    pub fn new(
        epoch: Epoch,
        leader: NodeIndex,
        params: ProtocolParams,
        keys: Arc<KeyStore>,
    ) -> Self {
        Self {
            epoch,
            leader,
            echo: EchoDisseminator::new(params.echo_threshold),
            params,
            keys,
            round: 0,
            phase: FollowerPhase::Idle,
            stats: FollowerStats::default(),
        }
    }

    pub fn index(&self) -> NodeIndex {
        self.keys.index()
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn phase(&self) -> FollowerPhase {
        self.phase
    }

    /// Nodes whose echo was accepted this round
    pub fn received_echoes(&self) -> usize {
        self.echo.received_count()
    }

    /// Bundle this follower echoed this round
    pub fn sent_echo(&self) -> Option<&AttestedReport> {
        self.echo.sent()
    }

    pub fn stats(&self) -> FollowerStats {
        let mut stats = self.stats.clone();
        stats.current_round = self.round;
        stats
    }

    /// Dispatch an inbound message addressed to the follower role
    pub fn on_message(&mut self, envelope: &Envelope) -> Vec<Action> {
        let sender = envelope.sender;
        let result = match &envelope.message {
            Message::ObserveRequest { round } => self.on_observe_request(sender, *round),
            Message::ReportRequest { round, report } => {
                self.on_report_request(sender, *round, report)
            }
            Message::Final { round, attested } => self.on_final(sender, *round, attested),
            Message::Echo { round, attested } => self.on_echo(sender, *round, attested),
            _ => return Vec::new(),
        };

        result.unwrap_or_else(|rejection| {
            self.stats.messages_rejected += 1;
            log_rejection(
                NodeRole::Follower,
                self.round,
                sender,
                envelope.message.topic(),
                &rejection,
            );
            Vec::new()
        })
    }

    /// Join a new round and ask the value source for an observation
    pub fn on_observe_request(
        &mut self,
        sender: NodeIndex,
        round: Round,
    ) -> Result<Vec<Action>, Rejection> {
        self.check_leader(sender)?;
        if round <= self.round {
            return Err(Rejection::StaleRound {
                current: self.round,
                got: round,
            });
        }

        self.round = round;
        self.phase = FollowerPhase::AwaitingValue;
        self.echo.reset();
        tracing::debug!(round, node = self.index(), "Joined round");

        let mut actions = Vec::with_capacity(2);
        if round > self.params.max_round {
            tracing::info!(
                "Round {} exceeds max round {}, requesting leader change",
                round,
                self.params.max_round
            );
            actions.push(Action::RequestLeaderChange {
                epoch: self.epoch,
                last_round: round - 1,
            });
        }
        actions.push(Action::FetchValue { round });
        Ok(actions)
    }

    /// Sign and send the observed value for the current round
    pub fn on_value_observed(&mut self, round: Round, value: Value) -> Vec<Action> {
        if round != self.round || self.phase != FollowerPhase::AwaitingValue {
            tracing::trace!(
                round,
                current = self.round,
                phase = self.phase.as_str(),
                "Discarding late observation value"
            );
            return Vec::new();
        }

        let signature = self.keys.sign(&observation_digest(self.epoch, round, value));
        self.phase = FollowerPhase::Observed;
        self.stats.observations_sent += 1;
        tracing::debug!(round, value, "Sending observation");

        vec![Action::BroadcastJittered(Message::Observe {
            round,
            value,
            signature,
        })]
    }

    /// Check the leader's report and sign its digest
    pub fn on_report_request(
        &mut self,
        sender: NodeIndex,
        round: Round,
        report: &Report,
    ) -> Result<Vec<Action>, Rejection> {
        self.check_leader(sender)?;
        self.check_round(round)?;
        match self.phase {
            FollowerPhase::Completed => return Err(Rejection::RoundCompleted),
            FollowerPhase::Echoed => return Err(Rejection::AlreadyEchoed),
            FollowerPhase::Reported => return Err(Rejection::AlreadyReported),
            _ => {}
        }

        report.check_canonical(self.params.quorum(), self.params.num_nodes)?;
        report.verify_observations(&self.keys, self.epoch, round)?;

        let signature = self.keys.sign(&report.digest(self.epoch, round));
        self.phase = FollowerPhase::Reported;
        self.stats.reports_signed += 1;
        tracing::debug!(round, "Signed report");

        Ok(vec![Action::Broadcast(Message::Report {
            round,
            report: report.clone(),
            signature,
        })])
    }

    /// Verify the leader's bundle and seed this node's echo
    pub fn on_final(
        &mut self,
        sender: NodeIndex,
        round: Round,
        attested: &AttestedReport,
    ) -> Result<Vec<Action>, Rejection> {
        self.check_leader(sender)?;
        self.check_round(round)?;
        self.check_round(attested.round())?;
        if self.phase == FollowerPhase::Completed {
            return Err(Rejection::RoundCompleted);
        }
        if self.echo.has_echoed() {
            return Err(Rejection::AlreadyEchoed);
        }

        attested.verify(&self.keys, &self.params, self.epoch)?;
        Ok(self.seed_echo(attested))
    }

    /// Count a peer's echo, amplify it if needed, complete at threshold
    pub fn on_echo(
        &mut self,
        sender: NodeIndex,
        round: Round,
        attested: &AttestedReport,
    ) -> Result<Vec<Action>, Rejection> {
        self.check_round(round)?;
        self.check_round(attested.round())?;
        if self.echo.has_received(sender) {
            return Err(Rejection::DuplicateEcho(sender));
        }
        if self.phase == FollowerPhase::Completed {
            return Err(Rejection::RoundCompleted);
        }
        if !self.keys.is_known(sender) {
            return Err(Rejection::UnknownNode(sender));
        }

        attested.verify(&self.keys, &self.params, self.epoch)?;
        self.echo.record(sender);
        tracing::trace!(
            round,
            sender,
            received = self.echo.received_count(),
            "Echo recorded"
        );

        let mut actions = Vec::new();
        if !self.echo.has_echoed() {
            actions.extend(self.seed_echo(attested));
        }

        if self.echo.threshold_reached() {
            self.phase = FollowerPhase::Completed;
            self.stats.rounds_completed += 1;
            let delivered = self.echo.sent().cloned().unwrap_or_else(|| attested.clone());
            tracing::info!(
                "Round {} completed with {} echoes, median {:?}",
                round,
                self.echo.received_count(),
                delivered.report().median()
            );
            actions.push(Action::Deliver(delivered));
        }
        Ok(actions)
    }

    fn seed_echo(&mut self, attested: &AttestedReport) -> Vec<Action> {
        if !self.echo.adopt(attested.clone()) {
            return Vec::new();
        }
        self.phase = self.phase.max(FollowerPhase::Echoed);
        self.stats.echoes_sent += 1;
        tracing::debug!(round = self.round, "Echoing attested report");
        vec![Action::Broadcast(Message::Echo {
            round: self.round,
            attested: attested.clone(),
        })]
    }

    fn check_leader(&self, sender: NodeIndex) -> Result<(), Rejection> {
        if sender != self.leader {
            return Err(Rejection::NotLeader { sender });
        }
        Ok(())
    }

    fn check_round(&self, round: Round) -> Result<(), Rejection> {
        if round != self.round {
            return Err(Rejection::RoundMismatch {
                current: self.round,
                got: round,
            });
        }
        Ok(())
    }
}
