//! Core types for oracle rounds

use crate::crypto::Signature;
use crate::error::ConfigError;
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Position of a node in the key table
pub type NodeIndex = u32;

/// Long-lived session identifier
pub type Epoch = u64;

/// Round number within an epoch (0 = no round started yet)
pub type Round = u64;

/// Observed quantity, e.g. a fixed-point price
pub type Value = u64;

/// A single signed observation
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Observation {
    /// Observed value
    pub value: Value,
    /// Observer's signature over `observation_digest(epoch, round, value)`
    pub signature: Signature,
    /// Observer's node index
    pub node: NodeIndex,
}

impl Observation {
    /// Canonical ordering key: value first, node index breaks ties
    pub fn sort_key(&self) -> (Value, NodeIndex) {
        (self.value, self.node)
    }
}

/// Node role in the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Drives rounds and collects observations and report signatures
    Leader,
    /// Observes, signs reports, echoes final bundles
    Follower,
}

/// Network size assumed when a config leaves `num_nodes` out
const DEFAULT_NUM_NODES: usize = 5;

/// Protocol parameters shared by every node of a network.
///
/// Fields missing from a config are derived from `num_nodes` as
/// [`ProtocolParams::for_network`] does, so `faults` and `echo_threshold`
/// always describe the configured network size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PartialParams")]
pub struct ProtocolParams {
    /// Number of nodes in the network
    pub num_nodes: usize,
    /// Maximum number of Byzantine nodes tolerated (F)
    pub faults: usize,
    /// Distinct echoes needed before a follower completes a round
    pub echo_threshold: usize,
    /// Rounds a leader may run before a leader change is requested
    pub max_round: Round,
    /// Round liveness timeout in milliseconds (T_ROUND)
    pub round_timeout_ms: u64,
    /// Grace period after observation quorum in milliseconds (T_GRACE)
    pub grace_period_ms: u64,
    /// Upper bound of the random delay before sending an observation
    pub max_observe_jitter_ms: u64,
}

impl ProtocolParams {
    /// Parameters for a network of `num_nodes`, tolerating `(n - 1) / 3` faults
    pub fn for_network(num_nodes: usize) -> Self {
        let faults = num_nodes.saturating_sub(1) / 3;
        Self {
            num_nodes,
            faults,
            echo_threshold: num_nodes - faults,
            max_round: 20,
            round_timeout_ms: 30_000,
            grace_period_ms: 3_000,
            max_observe_jitter_ms: 1_000,
        }
    }

    /// Observations needed to proceed past the observation phase (2F+1)
    pub fn quorum(&self) -> usize {
        2 * self.faults + 1
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn max_observe_jitter(&self) -> Duration {
        Duration::from_millis(self.max_observe_jitter_ms)
    }

    /// Check that the parameters describe a reachable protocol
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_nodes == 0 {
            return Err(ConfigError::NoNodes);
        }
        if self.quorum() > self.num_nodes {
            return Err(ConfigError::QuorumTooLarge {
                quorum: self.quorum(),
                num_nodes: self.num_nodes,
            });
        }
        if self.echo_threshold == 0 || self.echo_threshold > self.num_nodes {
            return Err(ConfigError::EchoThreshold {
                threshold: self.echo_threshold,
                num_nodes: self.num_nodes,
            });
        }
        if self.max_round == 0 {
            return Err(ConfigError::NoRounds);
        }
        if self.round_timeout_ms == 0 {
            return Err(ConfigError::ZeroRoundTimeout);
        }
        if self.grace_period_ms >= self.round_timeout_ms {
            return Err(ConfigError::GraceTooLong {
                grace_ms: self.grace_period_ms,
                round_ms: self.round_timeout_ms,
            });
        }
        Ok(())
    }
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self::for_network(DEFAULT_NUM_NODES)
    }
}

/// Config form of [`ProtocolParams`] with every field optional
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialParams {
    num_nodes: Option<usize>,
    faults: Option<usize>,
    echo_threshold: Option<usize>,
    max_round: Option<Round>,
    round_timeout_ms: Option<u64>,
    grace_period_ms: Option<u64>,
    max_observe_jitter_ms: Option<u64>,
}

impl From<PartialParams> for ProtocolParams {
    fn from(partial: PartialParams) -> Self {
        let num_nodes = partial.num_nodes.unwrap_or(DEFAULT_NUM_NODES);
        let base = Self::for_network(num_nodes);
        let faults = partial.faults.unwrap_or(base.faults);
        Self {
            num_nodes,
            faults,
            echo_threshold: partial
                .echo_threshold
                .unwrap_or_else(|| num_nodes.saturating_sub(faults)),
            max_round: partial.max_round.unwrap_or(base.max_round),
            round_timeout_ms: partial.round_timeout_ms.unwrap_or(base.round_timeout_ms),
            grace_period_ms: partial.grace_period_ms.unwrap_or(base.grace_period_ms),
            max_observe_jitter_ms: partial
                .max_observe_jitter_ms
                .unwrap_or(base.max_observe_jitter_ms),
        }
    }
}

/// Leader-side counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct LeaderStats {
    /// Round the leader is driving
    pub current_round: Round,
    /// Rounds opened with an observe request
    pub rounds_started: u64,
    /// Rounds that ended with an attested bundle
    pub rounds_finalized: u64,
    /// Rounds cut short by the round timer
    pub rounds_abandoned: u64,
    /// Valid observations collected
    pub observations_accepted: u64,
    /// Valid report signatures collected
    pub report_signatures_accepted: u64,
    /// Messages dropped by validation
    pub messages_rejected: u64,
}

/// Follower-side counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct FollowerStats {
    /// Highest round seen from the leader
    pub current_round: Round,
    /// Signed observations sent to the leader
    pub observations_sent: u64,
    /// Reports signed on the leader's request
    pub reports_signed: u64,
    /// Bundles echoed to the network
    pub echoes_sent: u64,
    /// Rounds that ended with a delivered bundle
    pub rounds_completed: u64,
    /// Messages dropped by validation
    pub messages_rejected: u64,
}

/// Stats about one node
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStats {
    /// Present only on the leader
    pub leader: Option<LeaderStats>,
    /// Every node runs a follower, the leader included
    pub follower: FollowerStats,
}
