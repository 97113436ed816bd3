//! Oracle node runner
//!
//! Owns the follower state machine, the leader state machine when this node
//! leads the epoch, the transport, timers and value source. Every input
//! becomes an [`Event`] on one queue; the state machines turn events into
//! [`Action`]s and the runner executes them. Broadcasts are also looped back
//! onto the queue so the node's own roles see its messages like any peer.

use crate::error::ConfigError;
use crate::event::{Action, Event};
use crate::follower::FollowerStateMachine;
use crate::keys::KeyStore;
use crate::leader::LeaderStateMachine;
use crate::message::{Envelope, Message};
use crate::report::AttestedReport;
use crate::source::ValueSource;
use crate::timer::TimerManager;
use crate::transport::Transport;
use crate::types::{Epoch, NodeIndex, NodeRole, NodeStats, ProtocolParams, Round};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// What a node hands to its consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutput {
    /// Echo threshold reached for a round
    Finalized(AttestedReport),
    /// Round limit passed; the election collaborator should pick a new leader
    LeaderChange { epoch: Epoch, last_round: Round },
}

/// Builder for OracleNode
pub struct OracleNodeBuilder {
    keys: Arc<KeyStore>,
    epoch: Epoch,
    leader: NodeIndex,
    params: ProtocolParams,
}

impl OracleNodeBuilder {
    pub fn new(keys: Arc<KeyStore>) -> Self {
        let params = ProtocolParams::for_network(keys.num_nodes());
        Self {
            keys,
            epoch: 0,
            leader: 0,
            params,
        }
    }

    pub fn epoch(mut self, epoch: Epoch) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn leader(mut self, leader: NodeIndex) -> Self {
        self.leader = leader;
        self
    }

    pub fn params(mut self, params: ProtocolParams) -> Self {
        self.params = params;
        self
    }

    pub fn build<T, V>(self, transport: T, source: V) -> Result<OracleNode<T, V>, ConfigError>
    where
        T: Transport,
        V: ValueSource,
    {
        self.params.validate()?;
        if self.keys.num_nodes() != self.params.num_nodes {
            return Err(ConfigError::KeyCountMismatch {
                keys: self.keys.num_nodes(),
                num_nodes: self.params.num_nodes,
            });
        }
        if self.leader as usize >= self.params.num_nodes {
            return Err(ConfigError::LeaderOutOfRange {
                leader: self.leader,
                num_nodes: self.params.num_nodes,
            });
        }

        let index = self.keys.index();
        let leader = (index == self.leader).then(|| {
            LeaderStateMachine::new(self.epoch, self.params.clone(), self.keys.clone())
        });
        let follower = FollowerStateMachine::new(
            self.epoch,
            self.leader,
            self.params.clone(),
            self.keys.clone(),
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Ok(OracleNode {
            index,
            epoch: self.epoch,
            params: self.params,
            leader,
            follower,
            transport,
            source: Arc::new(source),
            timers: TimerManager::new(event_tx.clone()),
            event_tx,
            event_rx,
            output_tx: None,
            stats: Arc::new(RwLock::new(NodeStats::default())),
        })
    }
}

/// A single oracle node
pub struct OracleNode<T, V> {
    index: NodeIndex,
    epoch: Epoch,
    params: ProtocolParams,
    leader: Option<LeaderStateMachine>,
    follower: FollowerStateMachine,
    transport: T,
    source: Arc<V>,
    timers: TimerManager,
    event_tx: mpsc::UnboundedSender<Event>,
    event_rx: mpsc::UnboundedReceiver<Event>,
    output_tx: Option<mpsc::UnboundedSender<NodeOutput>>,
    stats: Arc<RwLock<NodeStats>>,
}

impl<T, V> OracleNode<T, V>
where
    T: Transport + 'static,
    V: ValueSource + 'static,
{
    pub fn index(&self) -> NodeIndex {
        self.index
    }

    pub fn role(&self) -> NodeRole {
        if self.leader.is_some() {
            NodeRole::Leader
        } else {
            NodeRole::Follower
        }
    }

    /// Run the node on the current tokio runtime
    pub fn spawn(mut self) -> NodeHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (output_tx, outputs) = mpsc::unbounded_channel();
        self.output_tx = Some(output_tx);

        let index = self.index;
        let stats = self.stats.clone();
        let task = tokio::spawn(self.run(shutdown_rx));

        NodeHandle {
            index,
            shutdown_tx,
            outputs,
            stats,
            task,
        }
    }

    async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(
            "Oracle node {} running as {:?} for epoch {} ({} nodes, F={})",
            self.index,
            self.role(),
            self.epoch,
            self.params.num_nodes,
            self.params.faults
        );

        if self.leader.is_some() {
            self.enqueue(Event::StartRound);
        }

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    tracing::info!("Oracle node {} shutting down", self.index);
                    break;
                }

                Some(event) = self.event_rx.recv() => {
                    self.dispatch_event(event);
                }

                envelope = self.transport.recv() => match envelope {
                    Some(envelope) => self.dispatch_event(Event::Inbound(envelope)),
                    None => {
                        tracing::warn!("Transport closed, stopping node {}", self.index);
                        break;
                    }
                },
            }
        }

        self.timers.cancel_all();
    }

    fn dispatch_event(&mut self, event: Event) {
        let actions = match event {
            Event::StartRound => match self.leader.as_mut() {
                Some(leader) => leader.start_round(),
                None => Vec::new(),
            },
            Event::Timer { id, round } => match self.leader.as_mut() {
                Some(leader) => leader.on_timer(id, round),
                None => Vec::new(),
            },
            Event::ValueObserved { round, value } => self.follower.on_value_observed(round, value),
            Event::PublishDue(message) => vec![Action::Broadcast(message)],
            Event::Inbound(envelope) => self.route(&envelope),
        };

        for action in actions {
            self.process_action(action);
        }
        self.refresh_stats();
    }

    /// Hand an inbound message to the role it is addressed to
    fn route(&mut self, envelope: &Envelope) -> Vec<Action> {
        match &envelope.message {
            Message::Observe { .. } | Message::Report { .. } => match self.leader.as_mut() {
                Some(leader) => leader.on_message(envelope),
                None => Vec::new(),
            },
            Message::ObserveRequest { .. }
            | Message::ReportRequest { .. }
            | Message::Final { .. }
            | Message::Echo { .. } => self.follower.on_message(envelope),
            Message::LeaderChange { epoch, last_round } => {
                tracing::info!(
                    "Node {} signalled leader change for epoch {} after round {}",
                    envelope.sender,
                    epoch,
                    last_round
                );
                Vec::new()
            }
        }
    }

    fn process_action(&mut self, action: Action) {
        match action {
            Action::Broadcast(message) => self.broadcast(message),
            Action::BroadcastJittered(message) => {
                let Some(delay) = observe_delay(self.params.max_observe_jitter()) else {
                    self.broadcast(message);
                    return;
                };
                let event_tx = self.event_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = event_tx.send(Event::PublishDue(message));
                });
            }
            Action::SetTimer {
                id,
                round,
                duration,
            } => self.timers.set_timer(id, round, duration),
            Action::CancelTimer(id) => self.timers.cancel_timer(id),
            Action::FetchValue { round } => {
                let source = self.source.clone();
                let event_tx = self.event_tx.clone();
                tokio::spawn(async move {
                    match source.get_value(round).await {
                        Ok(value) => {
                            let _ = event_tx.send(Event::ValueObserved { round, value });
                        }
                        Err(e) => tracing::warn!("Value source failed for round {}: {}", round, e),
                    }
                });
            }
            Action::Deliver(attested) => {
                tracing::info!(
                    "Node {} finalized round {} with median {:?} ({} signers)",
                    self.index,
                    attested.round(),
                    attested.report().median(),
                    attested.signers().len()
                );
                self.emit(NodeOutput::Finalized(attested));
            }
            Action::RequestLeaderChange { epoch, last_round } => {
                self.broadcast(Message::LeaderChange { epoch, last_round });
                self.emit(NodeOutput::LeaderChange { epoch, last_round });
            }
        }
    }

    /// Send to peers and loop back to this node's own roles
    fn broadcast(&mut self, message: Message) {
        if let Err(e) = self.transport.broadcast(&message) {
            tracing::warn!("Broadcast of {} failed: {}", message.topic(), e);
        }
        self.enqueue(Event::Inbound(Envelope::new(self.index, message)));
    }

    fn enqueue(&self, event: Event) {
        // the receiver lives in `self`, so this only fails during teardown
        let _ = self.event_tx.send(event);
    }

    fn emit(&self, output: NodeOutput) {
        if let Some(tx) = &self.output_tx {
            if tx.send(output).is_err() {
                tracing::trace!("Output receiver dropped");
            }
        }
    }

    fn refresh_stats(&self) {
        *self.stats.write() = NodeStats {
            leader: self.leader.as_ref().map(|l| l.stats()),
            follower: self.follower.stats(),
        };
    }
}

/// Random send delay in `0..=max`; `None` when jitter is disabled
fn observe_delay(max: Duration) -> Option<Duration> {
    if max.is_zero() {
        return None;
    }
    Some(rand::thread_rng().gen_range(Duration::ZERO..=max))
}

/// Control handle for a spawned node
pub struct NodeHandle {
    index: NodeIndex,
    shutdown_tx: watch::Sender<bool>,
    outputs: mpsc::UnboundedReceiver<NodeOutput>,
    stats: Arc<RwLock<NodeStats>>,
    task: JoinHandle<()>,
}

impl NodeHandle {
    pub fn index(&self) -> NodeIndex {
        self.index
    }

    /// Next finalized bundle or leader-change signal
    pub async fn next_output(&mut self) -> Option<NodeOutput> {
        self.outputs.recv().await
    }

    pub fn stats(&self) -> NodeStats {
        self.stats.read().clone()
    }

    /// Stop the node and wait for its task to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!("Node {} task ended abnormally: {}", self.index, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FixedValue;
    use crate::test_helpers::{key_stores, params};
    use crate::transport::MemoryNetwork;

    #[test]
    fn test_build_rejects_bad_leader() {
        let keys = Arc::new(key_stores(4).remove(0));
        let (_network, mut transports) = MemoryNetwork::new(4);
        let result = OracleNodeBuilder::new(keys)
            .params(params(4, 1))
            .leader(4)
            .build(transports.remove(0), FixedValue(1));
        assert!(matches!(
            result,
            Err(ConfigError::LeaderOutOfRange { leader: 4, num_nodes: 4 })
        ));
    }

    #[test]
    fn test_build_rejects_key_count_mismatch() {
        let keys = Arc::new(key_stores(4).remove(1));
        let (_network, mut transports) = MemoryNetwork::new(5);
        let result = OracleNodeBuilder::new(keys)
            .params(params(5, 1))
            .build(transports.remove(1), FixedValue(1));
        assert!(matches!(
            result,
            Err(ConfigError::KeyCountMismatch { keys: 4, num_nodes: 5 })
        ));
    }

    #[test]
    fn test_roles_follow_leader_index() {
        let mut keys: Vec<Arc<KeyStore>> = key_stores(4).into_iter().map(Arc::new).collect();
        let (_network, mut transports) = MemoryNetwork::new(4);
        let follower = OracleNodeBuilder::new(keys.remove(2))
            .params(params(4, 1))
            .leader(1)
            .build(transports.remove(2), FixedValue(1))
            .unwrap();
        let leader = OracleNodeBuilder::new(keys.remove(1))
            .params(params(4, 1))
            .leader(1)
            .build(transports.remove(1), FixedValue(1))
            .unwrap();

        assert_eq!(follower.role(), NodeRole::Follower);
        assert_eq!(leader.role(), NodeRole::Leader);
        assert_eq!(leader.index(), 1);
    }

    #[test]
    fn test_observe_delay_within_jitter_bound() {
        assert_eq!(observe_delay(Duration::ZERO), None);

        let max = Duration::from_millis(25);
        for _ in 0..200 {
            let delay = observe_delay(max).unwrap();
            assert!(delay <= max, "{delay:?} exceeds {max:?}");
        }
    }

    #[tokio::test]
    async fn test_single_node_finalizes_alone() {
        let keys = Arc::new(key_stores(1).remove(0));
        let (_network, mut transports) = MemoryNetwork::new(1);
        let node = OracleNodeBuilder::new(keys)
            .epoch(9)
            .params(params(1, 0))
            .build(transports.remove(0), FixedValue(55))
            .unwrap();

        let mut handle = node.spawn();
        let output = tokio::time::timeout(Duration::from_secs(5), handle.next_output())
            .await
            .expect("no output")
            .expect("node stopped");
        let NodeOutput::Finalized(attested) = output else {
            panic!("expected finalized round, got {output:?}");
        };
        assert_eq!(attested.epoch(), 9);
        assert_eq!(attested.round(), 1);
        assert_eq!(attested.report().median(), Some(55));

        let stats = handle.stats();
        assert_eq!(stats.follower.rounds_completed, 1);
        assert_eq!(stats.leader.map(|l| l.rounds_finalized), Some(1));
        handle.shutdown().await;
    }
}
