//! Tilestream client runtime.
//!
//! One loop owns the [`LocalWorld`], the request coordinator and the part
//! reassembler, and applies everything the server sends in arrival order.
//! A separate preloader task watches the player position and asks the loop
//! to plan request rings on its own schedule; it never touches the world.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tilestream_config::Config;
use tilestream_net::{
    ChunkData, ChunkRelease, ChunkRequest, ClientConfig, GameClient, Message, WireConfig,
    WorldObjectsUpdate,
};
use tilestream_streaming::{
    ChunkReassembler, ChunkRequestCoordinator, CoordinatorConfig, HeldDeltas, LocalWorld,
    apply_updates,
};
use tilestream_world::{ChunkCoord, ObjectTypeRegistry};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

/// Ring plan request posted by the preloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PreloadTick {
    Urgent((i32, i32)),
    Full((i32, i32)),
}

/// Snapshot of the runtime for UIs and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub chunks_loaded: usize,
    pub objects: usize,
    pub in_flight: usize,
    pub queued: usize,
    pub deltas_applied: u64,
    pub last_loaded: Option<ChunkCoord>,
}

/// Controls a running [`ClientRuntime`] from outside its loop.
#[derive(Clone)]
pub struct ClientHandle {
    position: Arc<watch::Sender<(i32, i32)>>,
    stats: watch::Receiver<ClientStats>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ClientHandle {
    /// Move the player to a world tile.
    pub fn set_position(&self, tile_x: i32, tile_y: i32) {
        self.position.send_replace((tile_x, tile_y));
    }

    pub fn stats(&self) -> ClientStats {
        self.stats.borrow().clone()
    }

    /// Receiver that changes whenever the runtime publishes new stats.
    pub fn subscribe(&self) -> watch::Receiver<ClientStats> {
        self.stats.clone()
    }

    /// Stop the runtime loop and disconnect.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// The client composition root.
pub struct ClientRuntime {
    config: Config,
    client: GameClient,
    inbound: mpsc::Receiver<Message>,
    registry: Arc<ObjectTypeRegistry>,
    world: LocalWorld,
    coordinator: ChunkRequestCoordinator,
    reassembler: ChunkReassembler,
    held: HeldDeltas,
    position: watch::Receiver<(i32, i32)>,
    stats_tx: watch::Sender<ClientStats>,
    shutdown_rx: watch::Receiver<bool>,
    deltas_applied: u64,
    last_loaded: Option<ChunkCoord>,
}

impl ClientRuntime {
    /// Connect to the server named in `config` and build the runtime.
    pub async fn connect(
        config: Config,
        registry: Arc<ObjectTypeRegistry>,
        start_tile: (i32, i32),
    ) -> io::Result<(Self, ClientHandle)> {
        let host = format!("{}:{}", config.network.server_address, config.network.server_port);
        let addr: SocketAddr = tokio::net::lookup_host(&host)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}")))?;
        Self::connect_to(addr, config, registry, start_tile).await
    }

    /// Connect to an explicit address.
    pub async fn connect_to(
        addr: SocketAddr,
        config: Config,
        registry: Arc<ObjectTypeRegistry>,
        start_tile: (i32, i32),
    ) -> io::Result<(Self, ClientHandle)> {
        let client_config = ClientConfig {
            wire: WireConfig::new(
                config.network.max_frame_bytes,
                config.network.compression_threshold,
            ),
            inbound_capacity: config.network.inbound_channel_capacity.max(1),
            ..ClientConfig::default()
        };
        let (client, inbound) = GameClient::connect(addr, client_config).await?;

        let (position_tx, position) = watch::channel(start_tile);
        let (stats_tx, stats) = watch::channel(ClientStats::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let coordinator = ChunkRequestCoordinator::new(CoordinatorConfig::from_config(&config.streaming));

        let runtime = Self {
            config,
            client,
            inbound,
            registry,
            world: LocalWorld::new(),
            coordinator,
            reassembler: ChunkReassembler::new(),
            held: HeldDeltas::new(),
            position,
            stats_tx,
            shutdown_rx,
            deltas_applied: 0,
            last_loaded: None,
        };
        let handle = ClientHandle {
            position: Arc::new(position_tx),
            stats,
            shutdown: Arc::new(shutdown_tx),
        };
        Ok((runtime, handle))
    }

    /// Run until shut down or disconnected. Returns the local world as it
    /// stood when the loop stopped.
    pub async fn run(mut self) -> LocalWorld {
        let (preload_tx, mut preload_rx) = mpsc::channel(8);
        let preloader = tokio::spawn(preload_loop(
            self.position.clone(),
            preload_tx,
            self.config.streaming.urgent_poll(),
            self.config.streaming.preload_poll(),
            self.shutdown_rx.clone(),
        ));

        let mut sweep = tokio::time::interval(self.config.streaming.request_sweep());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                message = self.inbound.recv() => {
                    match message {
                        Some(message) => self.handle_message(message),
                        None => {
                            tracing::info!("connection lost, dropping streaming state");
                            self.coordinator.clear();
                            self.reassembler.clear();
                            self.held.clear();
                            self.world.clear();
                            break;
                        }
                    }
                }
                Some(tick) = preload_rx.recv() => self.handle_preload(tick),
                _ = sweep.tick() => {
                    let requests = self.coordinator.tick(Instant::now());
                    self.send_requests(requests);
                }
                changed = shutdown_rx.changed() => {
                    // Every handle dropped counts as a shutdown request.
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
            self.publish_stats();
        }

        self.client.disconnect();
        preloader.abort();
        self.publish_stats();
        self.world
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::ChunkData(part) => self.handle_part(part),
            Message::ChunkRequestAck(ack) => {
                let coord = ChunkCoord::new(ack.x, ack.y);
                if self.coordinator.on_ack(coord) {
                    // Acked without a usable payload; make the retry a full send.
                    tracing::debug!("chunk {coord} acked but not received");
                    self.release(coord);
                }
            }
            Message::ChunkFailed(failed) => {
                let coord = ChunkCoord::new(failed.x, failed.y);
                tracing::warn!("server failed chunk {coord}: {}", failed.reason);
                self.reassembler.discard(coord);
                self.held.discard(coord);
                let requests = self.coordinator.on_failed(coord, Instant::now());
                self.send_requests(requests);
            }
            Message::WorldObjectsUpdate(WorldObjectsUpdate { entries }) => {
                let (world, coordinator) = (&self.world, &self.coordinator);
                // The snapshot for a requested chunk may predate these edits.
                self.held
                    .hold(&entries, |c| !world.is_loaded(c) && coordinator.is_pending(c));
                let report = apply_updates(&mut self.world, &self.registry, &entries);
                self.deltas_applied += entries.len() as u64;
                tracing::trace!("applied {} object delta(s): {report:?}", entries.len());
            }
            other => tracing::warn!("unexpected message from server: {other:?}"),
        }
    }

    fn handle_part(&mut self, part: ChunkData) {
        let coord = part.coord();
        match self.reassembler.accept(part) {
            Ok(Some(payload)) => {
                let received = self.coordinator.on_received(coord, Instant::now());
                if received.wanted {
                    tracing::debug!("chunk {coord} loaded with {} object(s)", payload.objects.len());
                    self.world.insert_chunk(payload);
                    let replay = self.held.take(coord);
                    if !replay.is_empty() {
                        let report = apply_updates(&mut self.world, &self.registry, &replay);
                        tracing::debug!(
                            "replayed {} held delta(s) on chunk {coord}: {report:?}",
                            replay.len()
                        );
                    }
                    self.last_loaded = Some(coord);
                } else {
                    self.held.discard(coord);
                    self.release(coord);
                }
                self.send_requests(received.requests);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("dropping chunk {coord}: {e}");
                self.held.discard(coord);
                self.release(coord);
            }
        }
    }

    fn handle_preload(&mut self, tick: PreloadTick) {
        let now = Instant::now();
        let world = &self.world;
        let requests = match tick {
            PreloadTick::Urgent(center) => {
                self.coordinator
                    .preload_urgent(center, |c| world.is_loaded(c), now)
            }
            PreloadTick::Full(center) => {
                self.coordinator
                    .preload_around(center, |c| world.is_loaded(c), now)
            }
        };
        self.send_requests(requests);

        if let PreloadTick::Full((tile_x, tile_y)) = tick {
            // One ring of slack so chunks on the edge do not flap.
            let keep = self.coordinator.config().radii.preload + 1;
            let center = ChunkCoord::from_tile(tile_x, tile_y);
            for coord in self.world.unload_outside(center, keep) {
                self.reassembler.discard(coord);
                self.release(coord);
            }
            let coordinator = &self.coordinator;
            self.held
                .retain(|c| coordinator.is_pending(c) || coordinator.is_queued(c));
        }
    }

    fn send_requests(&self, requests: Vec<ChunkRequest>) {
        for request in requests {
            if self.client.send(Message::ChunkRequest(request)).is_err() {
                tracing::debug!("connection closed, request not sent");
                return;
            }
        }
    }

    fn release(&self, coord: ChunkCoord) {
        let _ = self.client.send(Message::ChunkRelease(ChunkRelease {
            x: coord.x,
            y: coord.y,
        }));
    }

    fn publish_stats(&self) {
        self.stats_tx.send_replace(ClientStats {
            chunks_loaded: self.world.chunk_count(),
            objects: self.world.object_count(),
            in_flight: self.coordinator.in_flight(),
            queued: self.coordinator.queued_len(),
            deltas_applied: self.deltas_applied,
            last_loaded: self.last_loaded,
        });
    }
}

/// Post an urgent ring plan every `urgent_every` and a full plan every
/// `full_every` or whenever the player moves to another chunk.
async fn preload_loop(
    mut position: watch::Receiver<(i32, i32)>,
    plans: mpsc::Sender<PreloadTick>,
    urgent_every: Duration,
    full_every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut urgent = tokio::time::interval(urgent_every);
    urgent.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut full = tokio::time::interval(full_every);
    full.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_chunk = None;

    loop {
        tokio::select! {
            _ = urgent.tick() => {
                let center = *position.borrow();
                // A busy loop just skips this round.
                let _ = plans.try_send(PreloadTick::Urgent(center));
            }
            _ = full.tick() => {
                let center = *position.borrow();
                if plans.send(PreloadTick::Full(center)).await.is_err() {
                    break;
                }
            }
            changed = position.changed() => {
                if changed.is_err() {
                    break;
                }
                let center = *position.borrow_and_update();
                let chunk = ChunkCoord::from_tile(center.0, center.1);
                if last_chunk != Some(chunk) {
                    last_chunk = Some(chunk);
                    if plans.send(PreloadTick::Full(center)).await.is_err() {
                        break;
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
