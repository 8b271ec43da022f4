//! TCP client for connecting to a Tilestream server.
//!
//! Manages the full connection lifecycle: connecting, heartbeat keepalive,
//! and clean disconnect. State changes are broadcast via a [`watch`] channel
//! so any number of consumers can react without polling. Decoded inbound
//! messages are delivered on a bounded channel; when it closes the
//! connection is gone.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::messages::{Message, Ping};
use crate::wire::{WireConfig, recv_message, send_message};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Attempting to establish a TCP connection.
    Connecting,
    /// TCP connection established, ready for communication.
    Connected,
    /// Connection lost or intentionally closed.
    Disconnected,
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current connection state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        let _ = self.tx.send(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub wire: WireConfig,
    /// How often to send a [`Ping`]. Default: 5 s.
    pub heartbeat_interval: Duration,
    /// Disconnect if no pong arrives for this long. Default: 15 s.
    pub heartbeat_timeout: Duration,
    /// Capacity of the inbound message channel. Default: 1024.
    pub inbound_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            wire: WireConfig::default(),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            inbound_capacity: 1024,
        }
    }
}

/// The client has disconnected; nothing more can be sent.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("client is disconnected")]
pub struct ClientClosed;

/// Handle to a connected game server session.
pub struct GameClient {
    outbound: mpsc::UnboundedSender<Message>,
    state: Arc<ConnectionStateWatch>,
    /// Sending `true` causes all background tasks to exit.
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl GameClient {
    /// Connect to the server at `addr`.
    ///
    /// Spawns reader, writer and heartbeat tasks and returns the handle along
    /// with the receiver of decoded inbound messages.
    pub async fn connect(
        addr: SocketAddr,
        config: ClientConfig,
    ) -> std::io::Result<(Self, mpsc::Receiver<Message>)> {
        let state = Arc::new(ConnectionStateWatch::new());
        state.set(ConnectionState::Connecting);

        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                state.set(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        stream.set_nodelay(true)?;
        state.set(ConnectionState::Connected);
        tracing::info!("Connected to {addr}");

        let (reader, writer) = stream.into_split();
        let (outbound, out_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let epoch = Instant::now();
        let last_pong_ms = Arc::new(AtomicU64::new(0));

        {
            let state = Arc::clone(&state);
            let wire = config.wire.clone();
            let last_pong_ms = Arc::clone(&last_pong_ms);
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                Self::read_loop(reader, &wire, inbound_tx, &state, &last_pong_ms, epoch, &mut shutdown)
                    .await;
            });
        }
        {
            let state = Arc::clone(&state);
            let wire = config.wire.clone();
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                Self::write_loop(writer, out_rx, &wire, &state, &mut shutdown).await;
            });
        }
        {
            let state = Arc::clone(&state);
            let outbound = outbound.clone();
            let shutdown_tx = Arc::clone(&shutdown_tx);
            let mut shutdown = shutdown_rx;
            tokio::spawn(async move {
                Self::heartbeat_loop(&config, &outbound, &state, &last_pong_ms, epoch, &shutdown_tx, &mut shutdown)
                    .await;
            });
        }

        Ok((
            Self {
                outbound,
                state,
                shutdown_tx,
            },
            inbound_rx,
        ))
    }

    /// Return the connection state watch.
    pub fn state(&self) -> &Arc<ConnectionStateWatch> {
        &self.state
    }

    /// Queue a message for the server.
    pub fn send(&self, message: Message) -> Result<(), ClientClosed> {
        if self.state.current() == ConnectionState::Disconnected {
            return Err(ClientClosed);
        }
        self.outbound.send(message).map_err(|_| ClientClosed)
    }

    /// Disconnect from the server.
    ///
    /// Signals background tasks to exit and transitions state to
    /// [`ConnectionState::Disconnected`] immediately.
    pub fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        self.state.set(ConnectionState::Disconnected);
    }

    async fn read_loop(
        mut reader: OwnedReadHalf,
        wire: &WireConfig,
        inbound: mpsc::Sender<Message>,
        state: &ConnectionStateWatch,
        last_pong_ms: &AtomicU64,
        epoch: Instant,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                result = recv_message(&mut reader, wire) => {
                    match result {
                        Ok(Some(Message::Pong(_))) => {
                            last_pong_ms.store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
                        }
                        Ok(Some(message)) => {
                            if inbound.send(message).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            tracing::info!("Server closed the connection");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!("Dropping connection after read error: {e}");
                            break;
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
        state.set(ConnectionState::Disconnected);
    }

    async fn write_loop(
        mut writer: OwnedWriteHalf,
        mut out_rx: mpsc::UnboundedReceiver<Message>,
        wire: &WireConfig,
        state: &ConnectionStateWatch,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                next = out_rx.recv() => {
                    let Some(message) = next else { break };
                    if let Err(e) = send_message(&mut writer, &message, wire).await {
                        tracing::warn!("Send failed: {e}");
                        state.set(ConnectionState::Disconnected);
                        break;
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

    /// Send a ping every `heartbeat_interval`. If no pong has been seen for
    /// `heartbeat_timeout`, shut the connection down.
    async fn heartbeat_loop(
        config: &ClientConfig,
        outbound: &mpsc::UnboundedSender<Message>,
        state: &ConnectionStateWatch,
        last_pong_ms: &AtomicU64,
        epoch: Instant,
        shutdown_tx: &watch::Sender<bool>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(config.heartbeat_interval);
        interval.tick().await;
        let mut sequence = 0u32;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if state.current() != ConnectionState::Connected {
                        break;
                    }

                    let since_pong = epoch.elapsed().saturating_sub(Duration::from_millis(
                        last_pong_ms.load(Ordering::Relaxed),
                    ));
                    if since_pong > config.heartbeat_timeout {
                        tracing::warn!(
                            "Heartbeat timeout, no response in {:?}",
                            config.heartbeat_timeout
                        );
                        state.set(ConnectionState::Disconnected);
                        let _ = shutdown_tx.send(true);
                        break;
                    }

                    sequence = sequence.wrapping_add(1);
                    let ping = Message::Ping(Ping {
                        timestamp_ms: unix_millis(),
                        sequence,
                    });
                    if outbound.send(ping).is_err() {
                        break;
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
}

/// Milliseconds since the Unix epoch, or 0 if the clock is before it.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ChunkRequest, Pong};
    use tokio::net::TcpListener;

    fn fast_config() -> ClientConfig {
        ClientConfig {
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(300),
            ..ClientConfig::default()
        }
    }

    /// Minimal server that answers every Ping with a Pong and echoes any
    /// other message back.
    async fn pong_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let wire = WireConfig::default();
            while let Ok(Some(msg)) = recv_message(&mut stream, &wire).await {
                let reply = match msg {
                    Message::Ping(ping) => Message::Pong(Pong::from(ping)),
                    other => other,
                };
                if send_message(&mut stream, &reply, &wire).await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_client_connects_to_server() {
        let addr = pong_server().await;
        let (client, _rx) = GameClient::connect(addr, fast_config()).await.unwrap();
        assert_eq!(client.state().current(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connection_state_starts_disconnected() {
        let watch = ConnectionStateWatch::new();
        assert_eq!(watch.current(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_messages_reach_inbound_channel() {
        let addr = pong_server().await;
        let (client, mut rx) = GameClient::connect(addr, fast_config()).await.unwrap();
        let request = Message::ChunkRequest(ChunkRequest {
            x: 7,
            y: 8,
            timestamp_ms: 9,
        });
        client.send(request.clone()).unwrap();

        let echoed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(echoed, Some(request));
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_connection_alive() {
        let addr = pong_server().await;
        let (client, _rx) = GameClient::connect(addr, fast_config()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(
            client.state().current(),
            ConnectionState::Connected,
            "Pongs should keep the connection alive past the timeout"
        );
    }

    #[tokio::test]
    async fn test_timeout_after_no_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Hold the connection open but never answer.
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let (client, mut rx) = GameClient::connect(addr, fast_config()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(client.state().current(), ConnectionState::Disconnected);
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(closed.is_none(), "inbound channel should close on timeout");
    }

    #[tokio::test]
    async fn test_disconnect_is_clean() {
        let addr = pong_server().await;
        let (client, _rx) = GameClient::connect(addr, fast_config()).await.unwrap();
        let mut state_rx = client.state().subscribe();

        client.disconnect();
        assert_eq!(client.state().current(), ConnectionState::Disconnected);
        assert_eq!(*state_rx.borrow_and_update(), ConnectionState::Disconnected);
        assert_eq!(
            client.send(Message::Ping(Ping {
                timestamp_ms: 0,
                sequence: 0
            })),
            Err(ClientClosed)
        );
    }

    #[tokio::test]
    async fn test_connect_refused_is_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(GameClient::connect(addr, fast_config()).await.is_err());
    }
}
