//! Tilestream server: wires the TCP server, chunk dispatcher, delivery cache
//! and object delta broadcaster together and runs the event loop.

pub mod objects;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tilestream_config::Config;
use tilestream_net::{
    ChunkRequest, ChunkRequestAck, ConnectionId, ConnectionMap, GameServer, Message, Pong,
    ServerConfig, ServerEvent, WireConfig,
};
use tilestream_streaming::{
    ChunkCache, DispatcherConfig, MessageSink, ServerChunkDispatcher, WorldObjectDeltaBroadcaster,
};
use tilestream_world::{ChunkCoord, ObjectTypeRegistry, TerrainGenerator, WorldStore};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

pub use objects::{ObjectError, WorldObjects};

/// Build the socket-level server settings from a [`Config`].
pub fn server_config(config: &Config) -> io::Result<ServerConfig> {
    let addr = format!("{}:{}", config.network.bind_address, config.network.server_port);
    let bind_addr: SocketAddr = addr
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("bind address {addr}: {e}")))?;
    Ok(ServerConfig {
        bind_addr,
        max_connections: config.network.max_connections,
        wire: WireConfig::new(
            config.network.max_frame_bytes,
            config.network.compression_threshold,
        ),
    })
}

/// Stops a running [`ChunkServer`].
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// The server composition root.
pub struct ChunkServer {
    config: Config,
    net: Arc<GameServer>,
    events: mpsc::Receiver<ServerEvent>,
    cache: Arc<ChunkCache>,
    dispatcher: ServerChunkDispatcher,
    broadcaster: Arc<WorldObjectDeltaBroadcaster>,
    objects: Arc<WorldObjects>,
    shutdown_tx: watch::Sender<bool>,
}

impl ChunkServer {
    pub fn new(
        config: Config,
        store: Arc<dyn WorldStore>,
        generator: Arc<dyn TerrainGenerator>,
        registry: Arc<ObjectTypeRegistry>,
    ) -> io::Result<Self> {
        let (events_tx, events) = mpsc::channel(config.network.inbound_channel_capacity.max(1));
        let net = Arc::new(GameServer::new(server_config(&config)?, events_tx));

        let cache = Arc::new(ChunkCache::from_config(&config.streaming));
        let sink: Arc<dyn MessageSink> = Arc::clone(&net.connections) as Arc<dyn MessageSink>;
        let dispatcher = ServerChunkDispatcher::new(
            DispatcherConfig::from_config(&config),
            Arc::clone(&store),
            Arc::clone(&generator),
            Arc::clone(&cache),
            sink,
        )?;

        let broadcaster = Arc::new(WorldObjectDeltaBroadcaster::new());
        let objects = Arc::new(WorldObjects::new(
            config.world.world_id.clone(),
            config.world.seed,
            store,
            generator,
            registry,
            Arc::clone(&broadcaster),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            net,
            events,
            cache,
            dispatcher,
            broadcaster,
            objects,
            shutdown_tx,
        })
    }

    /// Object edits for gameplay code.
    pub fn objects(&self) -> Arc<WorldObjects> {
        Arc::clone(&self.objects)
    }

    pub fn connections(&self) -> Arc<ConnectionMap> {
        Arc::clone(&self.net.connections)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Bind the configured address and serve until shut down.
    pub async fn run(self) -> io::Result<()> {
        let addr = server_config(&self.config)?.bind_addr;
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Tilestream server listening on {}", listener.local_addr()?);
        self.run_with_listener(listener).await
    }

    /// Serve on a pre-bound listener until shut down.
    pub async fn run_with_listener(mut self, listener: TcpListener) -> io::Result<()> {
        let net = Arc::clone(&self.net);
        let accept = tokio::spawn(async move { net.run_with_listener(listener).await });

        self.event_loop().await;

        self.net.shutdown();
        // Joining the workers waits for queued jobs; keep that off the reactor.
        let Self { mut dispatcher, .. } = self;
        if tokio::task::spawn_blocking(move || dispatcher.shutdown()).await.is_err() {
            tracing::error!("chunk dispatcher shutdown panicked");
        }
        match accept.await {
            Ok(result) => result,
            Err(e) => Err(io::Error::other(e)),
        }
    }

    async fn event_loop(&mut self) {
        let streaming = &self.config.streaming;
        let mut flush = tokio::time::interval(streaming.tick_interval());
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(streaming.cache_sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event);
                }
                _ = flush.tick() => self.flush_deltas(),
                _ = sweep.tick() => {
                    self.cache.sweep(Instant::now());
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Tilestream server stopping");
                        break;
                    }
                }
            }
        }
        // Last batch goes out before the connections close.
        self.flush_deltas();
    }

    fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Connected { id, peer } => {
                tracing::info!("client {id:?} connected from {peer}");
            }
            ServerEvent::Message { id, message } => self.handle_message(id, message),
            ServerEvent::Disconnected { id } => {
                self.dispatcher.on_disconnect(id);
                self.cache.remove_client(id);
                tracing::info!("client {id:?} disconnected");
            }
        }
    }

    fn handle_message(&self, id: ConnectionId, message: Message) {
        match message {
            Message::ChunkRequest(request) => self.handle_request(id, &request),
            Message::ChunkRelease(release) => {
                self.cache.forget(id, ChunkCoord::new(release.x, release.y));
            }
            Message::Ping(ping) => {
                let _ = self.net.connections.send(id, Message::Pong(Pong::from(ping)));
            }
            other => {
                tracing::warn!("client {id:?} sent unexpected {other:?}");
            }
        }
    }

    fn handle_request(&self, id: ConnectionId, request: &ChunkRequest) {
        let coord = request.coord();
        if self.cache.is_cached(id, coord, Instant::now()) {
            // Already on the wire to this client; confirm without resending.
            tracing::debug!("chunk {coord} already delivered to {id:?}, acking only");
            let _ = self.net.connections.send(
                id,
                Message::ChunkRequestAck(ChunkRequestAck {
                    x: coord.x,
                    y: coord.y,
                }),
            );
            return;
        }
        self.dispatcher.on_request(id, coord);
    }

    fn flush_deltas(&self) {
        if let Some(update) = self.broadcaster.flush() {
            let entries = update.entries.len();
            let sent = self.net.connections.broadcast(&Message::WorldObjectsUpdate(update));
            tracing::trace!("broadcast {entries} object delta(s) to {sent} client(s)");
        }
    }
}
