//! Consensus errors

use crate::types::{NodeIndex, Round};
use thiserror::Error;

/// Why an inbound message was dropped without touching round state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("round mismatch: current {current}, message {got}")]
    RoundMismatch { current: Round, got: Round },

    #[error("stale round: current {current}, message {got}")]
    StaleRound { current: Round, got: Round },

    #[error("epoch mismatch: expected {expected}, got {got}")]
    EpochMismatch { expected: u64, got: u64 },

    #[error("message not accepted in phase {phase}")]
    WrongPhase { phase: &'static str },

    #[error("node {sender} is not the leader")]
    NotLeader { sender: NodeIndex },

    #[error("unknown node {0}")]
    UnknownNode(NodeIndex),

    #[error("observation already recorded for node {0}")]
    DuplicateObservation(NodeIndex),

    #[error("report signature already recorded for node {0}")]
    DuplicateReport(NodeIndex),

    #[error("echo already received from node {0}")]
    DuplicateEcho(NodeIndex),

    #[error("report already signed this round")]
    AlreadyReported,

    #[error("echo already sent this round")]
    AlreadyEchoed,

    #[error("round already completed")]
    RoundCompleted,

    #[error("no report is being attested")]
    NoActiveReport,

    #[error("report digest does not match the current report")]
    ReportMismatch,

    #[error("report is not canonical: {0}")]
    MalformedReport(&'static str),

    #[error("invalid signature from node {signer}")]
    BadSignature { signer: NodeIndex },

    #[error("bundle carries {got} signatures, more than {faults} required")]
    InsufficientSignatures { got: usize, faults: usize },

    #[error("bundle lists signer {0} more than once")]
    DuplicateSigner(NodeIndex),

    #[error("bundle has {signatures} signatures for {signers} signers")]
    SignerCountMismatch { signatures: usize, signers: usize },
}

impl Rejection {
    /// True for cryptographic or structural failures, false for plain
    /// protocol violations (stale rounds, wrong phase, duplicates).
    pub fn is_validation_failure(&self) -> bool {
        matches!(
            self,
            Rejection::MalformedReport(_)
                | Rejection::BadSignature { .. }
                | Rejection::InsufficientSignatures { .. }
                | Rejection::DuplicateSigner(_)
                | Rejection::SignerCountMismatch { .. }
                | Rejection::ReportMismatch
                | Rejection::EpochMismatch { .. }
        )
    }
}

/// Invalid protocol parameters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("network must have at least one node")]
    NoNodes,

    #[error("quorum {quorum} exceeds network size {num_nodes}")]
    QuorumTooLarge { quorum: usize, num_nodes: usize },

    #[error("echo threshold {threshold} must be within 1..={num_nodes}")]
    EchoThreshold { threshold: usize, num_nodes: usize },

    #[error("max_round must be positive")]
    NoRounds,

    #[error("round timeout must be positive")]
    ZeroRoundTimeout,

    #[error("grace period {grace_ms}ms must be shorter than round timeout {round_ms}ms")]
    GraceTooLong { grace_ms: u64, round_ms: u64 },

    #[error("leader {leader} is outside a network of {num_nodes}")]
    LeaderOutOfRange { leader: NodeIndex, num_nodes: usize },

    #[error("key store holds {keys} public keys for a network of {num_nodes}")]
    KeyCountMismatch { keys: usize, num_nodes: usize },
}

/// Key material errors
#[derive(Error, Debug)]
pub enum KeyStoreError {
    #[error("node index {index} outside key table of {len}")]
    IndexOutOfRange { index: NodeIndex, len: usize },

    #[error("private key does not match public key for node {0}")]
    KeyMismatch(NodeIndex),

    #[error("public and private key lists differ in length")]
    LengthMismatch,

    #[error("invalid key encoding: {0}")]
    Encoding(String),

    #[error("key file io: {0}")]
    Io(#[from] std::io::Error),

    #[error("key file format: {0}")]
    Format(#[from] serde_json::Error),
}

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no peer address for node {0}")]
    NoAddress(NodeIndex),

    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("encode: {0}")]
    Encode(#[from] std::io::Error),
}

/// Log a dropped message at a level matching its kind
pub(crate) fn log_rejection(
    role: crate::types::NodeRole,
    round: Round,
    sender: NodeIndex,
    topic: crate::message::Topic,
    rejection: &Rejection,
) {
    if rejection.is_validation_failure() {
        tracing::warn!(?role, round, sender, %topic, %rejection, "Message failed validation");
    } else {
        tracing::debug!(?role, round, sender, %topic, %rejection, "Message dropped");
    }
}
