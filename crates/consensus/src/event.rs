//! Events fed into the state machines and the actions they emit.
//!
//! State machines never touch the network, clock or value source directly.
//! The node runner turns actions into IO and feeds the results back as
//! events through one queue.

use crate::message::{Envelope, Message};
use crate::report::AttestedReport;
use crate::types::{Epoch, Round, Value};
use std::time::Duration;

/// Leader alarms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Liveness timer: restarts the round when it fires (T_ROUND)
    Round,
    /// Late-observation window after quorum (T_GRACE)
    Grace,
}

/// Inputs to the node
#[derive(Debug, Clone)]
pub enum Event {
    /// External kickoff of the first round
    StartRound,
    /// A timer armed for `round` fired
    Timer { id: TimerId, round: Round },
    /// The value source answered a fetch for `round`
    ValueObserved { round: Round, value: Value },
    /// A jittered broadcast is due
    PublishDue(Message),
    /// A message arrived from the transport (or from this node's other role)
    Inbound(Envelope),
}

/// Outputs of a state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send to every peer now
    Broadcast(Message),
    /// Send to every peer after a random delay bounded by the observe jitter
    BroadcastJittered(Message),
    /// Arm (or re-arm) a timer for `round`
    SetTimer {
        id: TimerId,
        round: Round,
        duration: Duration,
    },
    CancelTimer(TimerId),
    /// Ask the value source for this round's observation
    FetchValue { round: Round },
    /// Hand a completed round's bundle to the consumer
    Deliver(AttestedReport),
    /// Round counter passed `max_round`; the election collaborator takes over
    RequestLeaderChange { epoch: Epoch, last_round: Round },
}
