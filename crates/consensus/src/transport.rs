//! Transport abstraction and an in-process network
//!
//! A transport broadcasts to every other node and yields inbound messages
//! tagged with the sending node. Delivery to the local node's own roles is
//! handled by the node runner, not by the transport.

use crate::error::TransportError;
use crate::message::{Envelope, Message};
use crate::types::NodeIndex;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

#[async_trait]
pub trait Transport: Send {
    /// Send `message` to every other node. Best effort: unreachable peers
    /// are skipped silently.
    fn broadcast(&self, message: &Message) -> Result<(), TransportError>;

    /// Next inbound message; `None` once the transport is shut down
    async fn recv(&mut self) -> Option<Envelope>;
}

struct Hub {
    inboxes: Vec<mpsc::UnboundedSender<(NodeIndex, Vec<u8>)>>,
    disconnected: RwLock<HashSet<NodeIndex>>,
}

/// Handle for cutting links of an in-process network
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: Arc<Hub>,
}

impl MemoryNetwork {
    /// Create a fully connected network of `num_nodes` transports
    pub fn new(num_nodes: usize) -> (Self, Vec<MemoryTransport>) {
        let (inboxes, receivers): (Vec<_>, Vec<_>) =
            (0..num_nodes).map(|_| mpsc::unbounded_channel()).unzip();
        let hub = Arc::new(Hub {
            inboxes,
            disconnected: RwLock::new(HashSet::new()),
        });

        let transports = receivers
            .into_iter()
            .enumerate()
            .map(|(i, inbox)| MemoryTransport {
                index: i as NodeIndex,
                hub: hub.clone(),
                inbox,
            })
            .collect();

        (Self { hub }, transports)
    }

    /// Drop all traffic to and from `node`
    pub fn disconnect(&self, node: NodeIndex) {
        self.hub.disconnected.write().insert(node);
        tracing::debug!(node, "Memory link down");
    }

    pub fn reconnect(&self, node: NodeIndex) {
        self.hub.disconnected.write().remove(&node);
        tracing::debug!(node, "Memory link up");
    }

    pub fn is_connected(&self, node: NodeIndex) -> bool {
        !self.hub.disconnected.read().contains(&node)
    }
}

/// One node's endpoint on a [`MemoryNetwork`]. Messages go through the
/// wire codec so tests exercise the same bytes a socket would carry.
pub struct MemoryTransport {
    index: NodeIndex,
    hub: Arc<Hub>,
    inbox: mpsc::UnboundedReceiver<(NodeIndex, Vec<u8>)>,
}

impl MemoryTransport {
    pub fn index(&self) -> NodeIndex {
        self.index
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn broadcast(&self, message: &Message) -> Result<(), TransportError> {
        let disconnected = self.hub.disconnected.read();
        if disconnected.contains(&self.index) {
            tracing::trace!(
                node = self.index,
                topic = %message.topic(),
                "Link down, dropping broadcast"
            );
            return Ok(());
        }

        let data = message.to_bytes()?;
        for (peer, inbox) in self.hub.inboxes.iter().enumerate() {
            let peer = peer as NodeIndex;
            if peer == self.index || disconnected.contains(&peer) {
                continue;
            }
            // a dropped inbox is a node that already stopped
            let _ = inbox.send((self.index, data.clone()));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let (sender, data) = self.inbox.recv().await?;
            match Message::from_bytes(&data) {
                Ok(message) => return Some(Envelope::new(sender, message)),
                Err(e) => tracing::warn!(sender, "Undecodable message: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_broadcast_reaches_every_other_node() {
        let (_network, mut transports) = MemoryNetwork::new(3);

        transports[0]
            .broadcast(&Message::ObserveRequest { round: 4 })
            .unwrap();

        for transport in transports.iter_mut().skip(1) {
            let envelope = transport.recv().await.unwrap();
            assert_eq!(envelope.sender, 0);
            assert_eq!(envelope.message, Message::ObserveRequest { round: 4 });
        }

        let own = tokio::time::timeout(Duration::from_millis(50), transports[0].recv()).await;
        assert!(own.is_err(), "sender received its own broadcast");
    }

    #[tokio::test]
    async fn test_disconnected_node_is_isolated() {
        let (network, mut transports) = MemoryNetwork::new(3);
        network.disconnect(2);
        assert!(!network.is_connected(2));

        transports[0]
            .broadcast(&Message::ObserveRequest { round: 1 })
            .unwrap();
        transports[2]
            .broadcast(&Message::ObserveRequest { round: 9 })
            .unwrap();

        let envelope = transports[1].recv().await.unwrap();
        assert_eq!(envelope.message.round(), 1);

        let isolated = tokio::time::timeout(Duration::from_millis(50), transports[2].recv()).await;
        assert!(isolated.is_err());

        network.reconnect(2);
        transports[0]
            .broadcast(&Message::ObserveRequest { round: 2 })
            .unwrap();
        assert_eq!(transports[2].recv().await.unwrap().message.round(), 2);
        // round 9 was dropped while the link was down
        assert_eq!(transports[1].recv().await.unwrap().message.round(), 2);
    }
}
