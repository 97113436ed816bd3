//! Oracle Consensus - leader-driven report rounds with echo dissemination
//!
//! Architecture:
//! - One leader per epoch asks every node for a signed observation
//! - After 2F+1 observations and a short grace period the leader assembles
//!   a sorted report and collects more than F follower signatures on it
//! - The attested bundle is echoed between followers; a follower delivers
//!   the round once it has seen echoes from enough distinct nodes
//! - Past `max_round` the leader retires and a leader change is signalled
//!
//! The leader and follower are sans-IO state machines driven by
//! [`node::OracleNode`], which owns the transport, timers and value source.

pub mod broadcast;
pub mod collector;
pub mod crypto;
pub mod echo;
pub mod error;
pub mod event;
pub mod follower;
pub mod keys;
pub mod leader;
pub mod message;
pub mod node;
pub mod report;
pub mod source;
pub mod timer;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_helpers;

pub use broadcast::WsTransport;
pub use crypto::{Digest, Signature};
pub use error::{ConfigError, KeyStoreError, Rejection, TransportError};
pub use follower::{FollowerPhase, FollowerStateMachine};
pub use keys::{KeyFile, KeyStore};
pub use leader::{LeaderPhase, LeaderStateMachine};
pub use message::{Envelope, Message, Topic};
pub use node::{NodeHandle, NodeOutput, OracleNode, OracleNodeBuilder};
pub use report::{AttestedReport, Report};
pub use source::{FixedValue, RandomWalk, ValueSource};
pub use transport::{MemoryNetwork, MemoryTransport, Transport};
pub use types::*;
