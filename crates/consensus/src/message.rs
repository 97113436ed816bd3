//! Protocol messages and their wire encoding

use crate::crypto::Signature;
use crate::report::{AttestedReport, Report};
use crate::types::{Epoch, NodeIndex, Round, Value};
use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt;

/// Message types exchanged between oracle nodes
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Message {
    /// Leader asks every follower for an observation
    ObserveRequest { round: Round },

    /// Follower's signed observation, sent to the leader
    Observe {
        round: Round,
        value: Value,
        signature: Signature,
    },

    /// Leader asks followers to sign the assembled report
    ReportRequest { round: Round, report: Report },

    /// Follower's signature over the report digest
    Report {
        round: Round,
        report: Report,
        signature: Signature,
    },

    /// Leader's attested bundle for the round
    Final {
        round: Round,
        attested: AttestedReport,
    },

    /// Follower re-affirming a verified bundle to its peers
    Echo {
        round: Round,
        attested: AttestedReport,
    },

    /// Signal for the external election collaborator
    LeaderChange { epoch: Epoch, last_round: Round },
}

impl Message {
    pub fn topic(&self) -> Topic {
        match self {
            Message::ObserveRequest { .. } => Topic::ObserveRequest,
            Message::Observe { .. } => Topic::Observe,
            Message::ReportRequest { .. } => Topic::ReportRequest,
            Message::Report { .. } => Topic::Report,
            Message::Final { .. } => Topic::Final,
            Message::Echo { .. } => Topic::Echo,
            Message::LeaderChange { .. } => Topic::LeaderChange,
        }
    }

    /// Round the message belongs to
    pub fn round(&self) -> Round {
        match self {
            Message::ObserveRequest { round }
            | Message::Observe { round, .. }
            | Message::ReportRequest { round, .. }
            | Message::Report { round, .. }
            | Message::Final { round, .. }
            | Message::Echo { round, .. } => *round,
            Message::LeaderChange { last_round, .. } => *last_round,
        }
    }

    /// Serialize for network transmission
    pub fn to_bytes(&self) -> borsh::io::Result<Vec<u8>> {
        borsh::to_vec(self)
    }

    /// Deserialize from network
    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

/// Pub/sub topic of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    ObserveRequest,
    Observe,
    ReportRequest,
    Report,
    Final,
    Echo,
    LeaderChange,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ObserveRequest => "observe-request",
            Topic::Observe => "observe",
            Topic::ReportRequest => "report-request",
            Topic::Report => "report",
            Topic::Final => "final",
            Topic::Echo => "echo",
            Topic::LeaderChange => "leader-change",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message together with the node the transport received it from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: NodeIndex,
    pub message: Message,
}

impl Envelope {
    pub fn new(sender: NodeIndex, message: Message) -> Self {
        Self { sender, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{key_stores, signed_observation};

    #[test]
    fn test_final_survives_wire_encoding() {
        let keys = key_stores(3);
        let report = Report::assemble(
            (0..3).map(|i| signed_observation(&keys[i], 4, 2, 7 * i as u64)),
            3,
        )
        .unwrap();
        let digest = report.digest(4, 2);
        let attested = AttestedReport::build(4, 2, report, vec![(1, keys[1].sign(&digest))]);
        let msg = Message::Final { round: 2, attested };

        let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.topic(), Topic::Final);
        assert_eq!(decoded.round(), 2);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Message::from_bytes(&[0xff, 0x00, 0x01]).is_err());
        assert_eq!(Topic::ReportRequest.to_string(), "report-request");
    }
}
