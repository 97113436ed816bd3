//! WebSocket transport for oracle nodes
//!
//! Every node runs a broadcast server on its own peer address and keeps a
//! client connection to every other node's server. A node only ever writes
//! its own messages to its server, so the sender of anything read from the
//! connection to peer `j` is `j`.

use crate::error::TransportError;
use crate::message::{Envelope, Message};
use crate::transport::Transport;
use crate::types::NodeIndex;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message as WsMessage};

/// Delay between attempts to reach an unreachable peer
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Outbound messages buffered per subscriber before it starts lagging
const BROADCAST_CAPACITY: usize = 1000;

const INBOUND_CAPACITY: usize = 1000;

/// Counters of a [`WsTransport`]
#[derive(Debug, Default, Clone)]
pub struct TransportStats {
    /// Messages handed to the local server for fan-out
    pub messages_broadcast: u64,
    /// Messages decoded from peer servers
    pub messages_received: u64,
    /// Peers currently reading from our server
    pub subscribers: usize,
    /// Peer servers we are currently reading from
    pub upstreams: usize,
}

/// WebSocket transport: one server per node, one reconnecting client per peer
pub struct WsTransport {
    /// This node's index in the peer table
    index: NodeIndex,
    /// Encoded outbound messages, fanned out to every subscriber
    tx: broadcast::Sender<Vec<u8>>,
    /// Decoded messages from all upstream peers
    inbound_rx: mpsc::Receiver<Envelope>,
    /// Shared with the server and client tasks
    stats: Arc<RwLock<TransportStats>>,
    /// Server and client tasks, aborted on drop
    tasks: Vec<JoinHandle<()>>,
}

impl WsTransport {
    /// Listen on `peers[index]` and start connecting to every other peer
    pub async fn start(index: NodeIndex, peers: &[String]) -> Result<Self, TransportError> {
        let addr = peers
            .get(index as usize)
            .ok_or(TransportError::NoAddress(index))?
            .clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.clone(),
                source,
            })?;
        tracing::info!("Oracle node {} listening on {}", index, addr);

        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let stats = Arc::new(RwLock::new(TransportStats::default()));

        let mut tasks = Vec::with_capacity(peers.len());
        tasks.push(tokio::spawn(accept_loop(listener, tx.clone(), stats.clone())));

        for (peer, peer_addr) in peers.iter().enumerate() {
            let peer = peer as NodeIndex;
            if peer == index {
                continue;
            }
            tasks.push(tokio::spawn(peer_loop(
                peer,
                peer_addr.clone(),
                inbound_tx.clone(),
                stats.clone(),
            )));
        }

        Ok(Self {
            index,
            tx,
            inbound_rx,
            stats,
            tasks,
        })
    }

    pub fn index(&self) -> NodeIndex {
        self.index
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.read().clone()
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn broadcast(&self, message: &Message) -> Result<(), TransportError> {
        let data = message.to_bytes()?;
        match self.tx.send(data) {
            Ok(n) => {
                self.stats.write().messages_broadcast += 1;
                tracing::trace!(
                    "Broadcast {} for round {} to {} peers",
                    message.topic(),
                    message.round(),
                    n
                );
            }
            Err(_) => {
                // No peers connected
                tracing::trace!("No peers connected, dropped {}", message.topic());
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Envelope> {
        self.inbound_rx.recv().await
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: broadcast::Sender<Vec<u8>>,
    stats: Arc<RwLock<TransportStats>>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                tracing::debug!("Peer connected from {}", peer_addr);
                let rx = tx.subscribe();
                let stats = stats.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_subscriber(stream, rx, stats).await {
                        tracing::debug!("Subscriber {} error: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                tracing::error!("Accept error: {}", e);
            }
        }
    }
}

/// Push this node's broadcasts to one connected peer until either side closes
async fn serve_subscriber(
    stream: TcpStream,
    mut rx: broadcast::Receiver<Vec<u8>>,
    stats: Arc<RwLock<TransportStats>>,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    stats.write().subscribers += 1;

    let result = loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Ok(data) => {
                    if let Err(e) = ws_sender.send(WsMessage::Binary(data)).await {
                        break Err(e.into());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Subscriber lagged {} messages", n);
                }
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
            inbound = ws_receiver.next() => match inbound {
                Some(Ok(WsMessage::Close(_))) | None => break Ok(()),
                Some(Err(e)) => break Err(e.into()),
                // peers never write to our server
                Some(Ok(_)) => {}
            },
        }
    };

    stats.write().subscribers -= 1;
    result
}

/// Keep a connection to `peer`'s server, forwarding its messages inbound
async fn peer_loop(
    peer: NodeIndex,
    addr: String,
    inbound_tx: mpsc::Sender<Envelope>,
    stats: Arc<RwLock<TransportStats>>,
) {
    let url = format!("ws://{}", addr);
    loop {
        match connect_async(&url).await {
            Ok((mut ws_stream, _)) => {
                tracing::info!("Connected to peer {} at {}", peer, addr);
                stats.write().upstreams += 1;

                while let Some(msg) = ws_stream.next().await {
                    match msg {
                        Ok(WsMessage::Binary(data)) => match Message::from_bytes(&data) {
                            Ok(message) => {
                                stats.write().messages_received += 1;
                                if inbound_tx.send(Envelope::new(peer, message)).await.is_err() {
                                    // transport dropped
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Undecodable message from peer {}: {}", peer, e)
                            }
                        },
                        Ok(WsMessage::Close(_)) => break,
                        Err(e) => {
                            tracing::debug!("Peer {} connection error: {}", peer, e);
                            break;
                        }
                        _ => {}
                    }
                }

                stats.write().upstreams -= 1;
                tracing::warn!("Lost connection to peer {}", peer);
            }
            Err(e) => {
                tracing::trace!("Peer {} unreachable: {}", peer, e);
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
