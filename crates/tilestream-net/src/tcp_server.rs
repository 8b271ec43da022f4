//! TCP server for accepting and managing client connections.
//!
//! Each connection gets a reader task that decodes frames into
//! [`ServerEvent`]s on a bounded channel, and a writer task draining an
//! unbounded per-connection queue. Anything holding the [`ConnectionMap`]
//! can send to a client without touching the socket, including plain
//! OS threads.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};

use crate::messages::Message;
use crate::wire::{WireConfig, WireError, recv_message, send_message};

/// Unique identifier for a TCP connection within a server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Error returned when the connection map is at capacity.
#[derive(Debug)]
pub struct ConnectionLimitReached;

/// Why a message could not be queued for a connection.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("connection {0:?} is not registered")]
    UnknownConnection(ConnectionId),
    #[error("connection {0:?} is closing")]
    Closed(ConnectionId),
}

/// Events delivered from connection tasks to the server's main loop.
#[derive(Debug)]
pub enum ServerEvent {
    Connected { id: ConnectionId, peer: SocketAddr },
    Message { id: ConnectionId, message: Message },
    Disconnected { id: ConnectionId },
}

/// Outbound queues of all live connections, keyed by [`ConnectionId`].
pub struct ConnectionMap {
    inner: DashMap<ConnectionId, mpsc::UnboundedSender<Message>>,
    max_connections: usize,
}

impl ConnectionMap {
    /// Create a new map with the given capacity limit.
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: DashMap::new(),
            max_connections,
        }
    }

    /// Register a connection's outbound queue. Fails at capacity.
    pub fn insert(
        &self,
        id: ConnectionId,
        tx: mpsc::UnboundedSender<Message>,
    ) -> Result<(), ConnectionLimitReached> {
        if self.inner.len() >= self.max_connections {
            return Err(ConnectionLimitReached);
        }
        self.inner.insert(id, tx);
        Ok(())
    }

    /// Remove a connection. Its writer task exits once the queue drains.
    pub fn remove(&self, id: &ConnectionId) -> bool {
        self.inner.remove(id).is_some()
    }

    /// Queue a message for one connection.
    pub fn send(&self, id: ConnectionId, message: Message) -> Result<(), SendError> {
        let tx = self.inner.get(&id).ok_or(SendError::UnknownConnection(id))?;
        tx.send(message).map_err(|_| SendError::Closed(id))
    }

    /// Queue a copy of `message` for every connection. Returns how many
    /// queues accepted it.
    pub fn broadcast(&self, message: &Message) -> usize {
        self.inner
            .iter()
            .filter(|entry| entry.value().send(message.clone()).is_ok())
            .count()
    }

    /// Ids of all live connections.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.inner.iter().map(|entry| *entry.key()).collect()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.contains_key(id)
    }

    /// Return the number of active connections.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Return whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Configuration for [`GameServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to. Default: `0.0.0.0:7777`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections. Default: 256.
    pub max_connections: usize,
    /// Framing and compression.
    pub wire: WireConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7777)),
            max_connections: 256,
            wire: WireConfig::default(),
        }
    }
}

/// TCP game server that accepts connections and manages their lifecycle.
pub struct GameServer {
    config: ServerConfig,
    /// Active connection map, shared with anything that sends to clients.
    pub connections: Arc<ConnectionMap>,
    id_gen: Arc<IdGenerator>,
    events: mpsc::Sender<ServerEvent>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GameServer {
    /// Create a new server that reports connection events on `events`.
    pub fn new(config: ServerConfig, events: mpsc::Sender<ServerEvent>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            connections: Arc::new(ConnectionMap::new(config.max_connections)),
            id_gen: Arc::new(IdGenerator::new()),
            config,
            events,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("Server listening on {}", listener.local_addr()?);
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener (useful for tests).
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    stream.set_nodelay(true)?;

                    let id = self.id_gen.next_id();
                    let (out_tx, out_rx) = mpsc::unbounded_channel();
                    if self.connections.insert(id, out_tx).is_err() {
                        tracing::warn!("Connection limit reached, rejecting {peer}");
                        continue;
                    }

                    tracing::info!("Accepted connection {id:?} from {peer}");
                    let (reader, writer) = stream.into_split();
                    self.spawn_connection(id, peer, reader, writer, out_rx);
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Signal the server and all connection tasks to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn spawn_connection(
        &self,
        id: ConnectionId,
        peer: SocketAddr,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        out_rx: mpsc::UnboundedReceiver<Message>,
    ) {
        let wire = self.config.wire.clone();
        let mut writer_shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = Self::write_loop(id, writer, out_rx, &wire, &mut writer_shutdown).await {
                tracing::debug!("Connection {id:?} writer stopped: {e}");
            }
        });

        let wire = self.config.wire.clone();
        let connections = Arc::clone(&self.connections);
        let events = self.events.clone();
        let mut reader_shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            if events.send(ServerEvent::Connected { id, peer }).await.is_ok() {
                Self::read_loop(id, reader, &wire, &events, &mut reader_shutdown).await;
            }
            connections.remove(&id);
            let _ = events.send(ServerEvent::Disconnected { id }).await;
            tracing::info!("Connection {id:?} closed");
        });
    }

    /// Decode frames and forward them until EOF, a framing error, or shutdown.
    async fn read_loop(
        id: ConnectionId,
        mut reader: OwnedReadHalf,
        wire: &WireConfig,
        events: &mpsc::Sender<ServerEvent>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                result = recv_message(&mut reader, wire) => {
                    match result {
                        Ok(Some(message)) => {
                            if events.send(ServerEvent::Message { id, message }).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(WireError::Frame(e)) => {
                            tracing::warn!("Connection {id:?} framing error: {e}");
                            break;
                        }
                        Err(e) => {
                            // Frame boundaries are intact, so the stream is still usable.
                            tracing::warn!("Connection {id:?} sent an undecodable message: {e}");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn write_loop(
        id: ConnectionId,
        mut writer: OwnedWriteHalf,
        mut out_rx: mpsc::UnboundedReceiver<Message>,
        wire: &WireConfig,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), WireError> {
        loop {
            tokio::select! {
                next = out_rx.recv() => {
                    let Some(message) = next else { break };
                    send_message(&mut writer, &message, wire).await?;
                    tracing::trace!("Connection {id:?} sent {message:?}");
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ChunkRequest, ChunkRequestAck};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    /// Helper: start a server on an ephemeral port and return the bound address.
    async fn start_test_server(
        max_connections: usize,
    ) -> (SocketAddr, Arc<GameServer>, mpsc::Receiver<ServerEvent>) {
        let config = ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_connections,
            wire: WireConfig::default(),
        };
        let (events_tx, events_rx) = mpsc::channel(64);
        let server = Arc::new(GameServer::new(config, events_tx));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = Arc::clone(&server);
        tokio::spawn(async move {
            srv.run_with_listener(listener).await.unwrap();
        });
        (addr, server, events_rx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for server event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_connect_message_disconnect_events() {
        let (addr, _server, mut events) = start_test_server(16).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let ServerEvent::Connected { id, .. } = next_event(&mut events).await else {
            panic!("expected Connected");
        };

        let request = Message::ChunkRequest(ChunkRequest {
            x: 1,
            y: -1,
            timestamp_ms: 10,
        });
        send_message(&mut stream, &request, &WireConfig::default())
            .await
            .unwrap();
        match next_event(&mut events).await {
            ServerEvent::Message { id: from, message } => {
                assert_eq!(from, id);
                assert_eq!(message, request);
            }
            other => panic!("unexpected event {other:?}"),
        }

        drop(stream);
        assert!(matches!(
            next_event(&mut events).await,
            ServerEvent::Disconnected { id: gone } if gone == id
        ));
    }

    #[tokio::test]
    async fn test_connection_map_send_reaches_client() {
        let (addr, server, mut events) = start_test_server(16).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let ServerEvent::Connected { id, .. } = next_event(&mut events).await else {
            panic!("expected Connected");
        };

        let ack = Message::ChunkRequestAck(ChunkRequestAck { x: 4, y: 5 });
        server.connections.send(id, ack.clone()).unwrap();

        let received = recv_message(&mut stream, &WireConfig::default())
            .await
            .unwrap();
        assert_eq!(received, Some(ack));
    }

    #[tokio::test]
    async fn test_send_to_unknown_connection() {
        let map = ConnectionMap::new(4);
        let result = map.send(
            ConnectionId(99),
            Message::ChunkRequestAck(ChunkRequestAck { x: 0, y: 0 }),
        );
        assert_eq!(result, Err(SendError::UnknownConnection(ConnectionId(99))));
    }

    #[tokio::test]
    async fn test_broadcast_counts_live_queues() {
        let map = ConnectionMap::new(4);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        map.insert(ConnectionId(1), tx1).unwrap();
        map.insert(ConnectionId(2), tx2).unwrap();
        drop(rx2);

        let msg = Message::ChunkRequestAck(ChunkRequestAck { x: 0, y: 0 });
        assert_eq!(map.broadcast(&msg), 1);
        assert_eq!(rx1.recv().await, Some(msg));
    }

    #[tokio::test]
    async fn test_max_connections_enforced() {
        let max = 2;
        let (addr, server, mut events) = start_test_server(max).await;

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();
        next_event(&mut events).await;
        next_event(&mut events).await;
        assert_eq!(server.connections.len(), 2);

        let mut c3 = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), c3.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0, "rejected client should see the socket close");
        assert_eq!(server.connections.len(), max);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_closes_connections() {
        let (addr, server, mut events) = start_test_server(16).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        next_event(&mut events).await;

        server.shutdown();

        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0, "Client should receive EOF after server shutdown");
    }

    #[test]
    fn test_connection_id_uniqueness() {
        let id_gen = IdGenerator::new();
        let id1 = id_gen.next_id();
        let id2 = id_gen.next_id();
        assert_eq!(id1, ConnectionId(1));
        assert_eq!(id2, ConnectionId(2));
    }
}
