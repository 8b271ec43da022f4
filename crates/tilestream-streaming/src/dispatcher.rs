//! Server-side chunk dispatch with request coalescing.
//!
//! Requests for a chunk that is already being produced join the existing
//! job instead of starting another. Jobs run on a fixed pool of named OS
//! worker threads fed by a bounded crossbeam queue; each job loads the chunk
//! from the [`WorldStore`], or generates and saves it if it was never stored.
//! When a job finishes, every waiter receives all parts followed by an ack.
//! Jobs that do not fit the queue wait in an unbounded backlog that workers
//! drain before taking new work, so a request is never turned away. A job
//! that panics is reported to its waiters as failed and the worker lives on.
//!
//! Waiter registration and the completion broadcast share one mutex, so a
//! request either joins a job before its broadcast or starts a new one after.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tilestream_config::Config;
use tilestream_net::{
    ChunkFailed, ChunkRequestAck, ConnectionId, ConnectionMap, Message, SendError,
};
use tilestream_world::{
    ChunkCoord, ChunkPayload, GenerationError, StoreError, TerrainGenerator, WorldStore,
};

use crate::cache::ChunkCache;
use crate::codec::split_chunk;

// ---------------------------------------------------------------------------
// Outbound seam
// ---------------------------------------------------------------------------

/// Anything that can queue a message for a connection without blocking.
pub trait MessageSink: Send + Sync {
    fn send(&self, connection: ConnectionId, message: Message) -> Result<(), SendError>;
}

impl MessageSink for ConnectionMap {
    fn send(&self, connection: ConnectionId, message: Message) -> Result<(), SendError> {
        ConnectionMap::send(self, connection, message)
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Why a job produced no chunk.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("generation: {0}")]
    Generation(#[from] GenerationError),
    #[error("chunk producer panicked")]
    Panicked,
}

/// What [`ServerChunkDispatcher::on_request`] did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// First waiter; a job was queued.
    Submitted,
    /// A job for this chunk was already running; the requester was added.
    Joined,
    /// First waiter; the queue was full so the job waits in the backlog.
    Backlogged,
    /// The dispatcher is shut down; the requester was sent `ChunkFailed`.
    Rejected,
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub world_id: String,
    pub seed: u64,
    /// Number of worker threads. Default: 8.
    pub workers: usize,
    /// Object batch size passed to [`split_chunk`]. Default: 50.
    pub max_objects_per_part: usize,
    /// Jobs the channel holds before new ones spill into the backlog.
    pub queue_capacity: usize,
}

impl DispatcherConfig {
    pub fn from_config(config: &Config) -> Self {
        let workers = config.streaming.max_generation_workers.max(1);
        Self {
            world_id: config.world.world_id.clone(),
            seed: config.world.seed,
            workers,
            max_objects_per_part: config.streaming.max_objects_per_part,
            queue_capacity: workers * 32,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Connections waiting on one in-progress job.
struct PendingGeneration {
    waiters: FxHashSet<ConnectionId>,
    started_at: Instant,
}

struct Shared {
    config: DispatcherConfig,
    pending: Mutex<FxHashMap<ChunkCoord, PendingGeneration>>,
    backlog: Mutex<VecDeque<ChunkCoord>>,
    store: Arc<dyn WorldStore>,
    generator: Arc<dyn TerrainGenerator>,
    cache: Arc<ChunkCache>,
    sink: Arc<dyn MessageSink>,
    jobs_run: AtomicU64,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Coalescing chunk dispatcher backed by a worker pool.
pub struct ServerChunkDispatcher {
    shared: Arc<Shared>,
    job_tx: Option<Sender<ChunkCoord>>,
    workers: Vec<JoinHandle<()>>,
}

impl ServerChunkDispatcher {
    /// Spawn the worker pool.
    pub fn new(
        config: DispatcherConfig,
        store: Arc<dyn WorldStore>,
        generator: Arc<dyn TerrainGenerator>,
        cache: Arc<ChunkCache>,
        sink: Arc<dyn MessageSink>,
    ) -> std::io::Result<Self> {
        let (job_tx, job_rx) = bounded::<ChunkCoord>(config.queue_capacity.max(1));
        let worker_count = config.workers.max(1);
        let shared = Arc::new(Shared {
            config,
            pending: Mutex::new(FxHashMap::default()),
            backlog: Mutex::new(VecDeque::new()),
            store,
            generator,
            cache,
            sink,
            jobs_run: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let rx = job_rx.clone();
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name("chunk-gen-worker".into())
                .spawn(move || worker_loop(&shared, &rx))?;
            workers.push(handle);
        }
        tracing::info!("chunk dispatcher started with {worker_count} workers");

        Ok(Self {
            shared,
            job_tx: Some(job_tx),
            workers,
        })
    }

    /// Register `connection` as a waiter for `coord`, starting a job if none
    /// is running.
    pub fn on_request(&self, connection: ConnectionId, coord: ChunkCoord) -> RequestOutcome {
        let mut pending = self.shared.lock_pending();
        if let Some(entry) = pending.get_mut(&coord) {
            entry.waiters.insert(connection);
            tracing::debug!(
                "{connection:?} joined in-flight job for {coord} ({} waiters)",
                entry.waiters.len()
            );
            return RequestOutcome::Joined;
        }

        let outcome = match self.job_tx.as_ref().map(|tx| tx.try_send(coord)) {
            Some(Ok(())) => RequestOutcome::Submitted,
            Some(Err(TrySendError::Full(coord))) => {
                // Every worker is busy; one of them drains this before blocking again.
                self.shared.lock_backlog().push_back(coord);
                tracing::debug!("generation queue full, {coord} waits in the backlog");
                RequestOutcome::Backlogged
            }
            Some(Err(TrySendError::Disconnected(_))) | None => {
                drop(pending);
                let failed = Message::ChunkFailed(ChunkFailed {
                    x: coord.x,
                    y: coord.y,
                    reason: "server shutting down".into(),
                });
                let _ = self.shared.sink.send(connection, failed);
                return RequestOutcome::Rejected;
            }
        };

        let mut waiters = FxHashSet::default();
        waiters.insert(connection);
        pending.insert(
            coord,
            PendingGeneration {
                waiters,
                started_at: Instant::now(),
            },
        );
        tracing::debug!("{connection:?} started job for {coord}");
        outcome
    }

    /// Remove a disconnected connection from every waiter set. Jobs keep
    /// running; their result is delivered to whoever still waits.
    pub fn on_disconnect(&self, connection: ConnectionId) {
        let mut pending = self.shared.lock_pending();
        for entry in pending.values_mut() {
            entry.waiters.remove(&connection);
        }
    }

    /// Jobs waiting in the backlog behind a full queue.
    pub fn backlog_len(&self) -> usize {
        self.shared.lock_backlog().len()
    }

    /// Number of chunks with a job queued or running.
    pub fn pending_count(&self) -> usize {
        self.shared.lock_pending().len()
    }

    /// Whether a job for `coord` is queued or running.
    pub fn is_pending(&self, coord: ChunkCoord) -> bool {
        self.shared.lock_pending().contains_key(&coord)
    }

    /// Total jobs executed since start.
    pub fn generation_count(&self) -> u64 {
        self.shared.jobs_run.load(Ordering::Relaxed)
    }

    /// Stop accepting jobs, let queued jobs finish, and join the workers.
    pub fn shutdown(&mut self) {
        self.job_tx.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("chunk worker panicked");
            }
        }
    }
}

impl Drop for ServerChunkDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, FxHashMap<ChunkCoord, PendingGeneration>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_backlog(&self) -> std::sync::MutexGuard<'_, VecDeque<ChunkCoord>> {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the chunk, or generate and persist it.
    fn produce(&self, coord: ChunkCoord) -> Result<ChunkPayload, DispatchError> {
        if let Some(payload) = self.store.load_chunk(&self.config.world_id, coord)? {
            return Ok(payload);
        }
        let payload = self.generator.generate(self.config.seed, coord)?;
        match self.store.save_chunk_if_absent(&self.config.world_id, &payload) {
            Ok(true) => Ok(payload),
            // Someone saved an edited version while we generated; that one wins.
            Ok(false) => Ok(self
                .store
                .load_chunk(&self.config.world_id, coord)?
                .unwrap_or(payload)),
            Err(e) => {
                // Generation is deterministic, so an unsaved chunk can be rebuilt later.
                tracing::warn!("failed to save generated chunk {coord}: {e}");
                Ok(payload)
            }
        }
    }

    /// Deliver a job result to every waiter and retire the pending entry.
    fn complete(&self, coord: ChunkCoord, result: Result<ChunkPayload, DispatchError>) {
        let mut pending = self.lock_pending();
        let Some(entry) = pending.remove(&coord) else {
            return;
        };
        let elapsed = entry.started_at.elapsed();

        match result {
            Ok(payload) => {
                let parts = split_chunk(&payload, self.config.max_objects_per_part);
                let now = Instant::now();
                for &waiter in &entry.waiters {
                    let delivered = parts
                        .iter()
                        .all(|part| self.sink.send(waiter, Message::ChunkData(part.clone())).is_ok())
                        && self
                            .sink
                            .send(
                                waiter,
                                Message::ChunkRequestAck(ChunkRequestAck {
                                    x: coord.x,
                                    y: coord.y,
                                }),
                            )
                            .is_ok();
                    if delivered {
                        self.cache.mark_sent(waiter, coord, now);
                    } else {
                        tracing::debug!("{waiter:?} went away before {coord} was delivered");
                    }
                }
                tracing::debug!(
                    "chunk {coord} delivered in {} part(s) to {} waiter(s) after {elapsed:?}",
                    parts.len(),
                    entry.waiters.len()
                );
            }
            Err(e) => {
                tracing::error!("chunk {coord} failed after {elapsed:?}: {e}");
                let reason = e.to_string();
                for &waiter in &entry.waiters {
                    let _ = self.sink.send(
                        waiter,
                        Message::ChunkFailed(ChunkFailed {
                            x: coord.x,
                            y: coord.y,
                            reason: reason.clone(),
                        }),
                    );
                }
            }
        }
    }
}

fn worker_loop(shared: &Shared, jobs: &Receiver<ChunkCoord>) {
    loop {
        let backlogged = shared.lock_backlog().pop_front();
        let coord = match backlogged {
            Some(coord) => coord,
            None => match jobs.recv() {
                Ok(coord) => coord,
                Err(_) => break,
            },
        };
        run_job(shared, coord);
    }
}

/// Produce one chunk and always retire its pending entry.
fn run_job(shared: &Shared, coord: ChunkCoord) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| shared.produce(coord)))
        .unwrap_or_else(|_| {
            tracing::error!("chunk job for {coord} panicked");
            Err(DispatchError::Panicked)
        });
    shared.jobs_run.fetch_add(1, Ordering::Relaxed);
    shared.complete(coord, result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tilestream_world::{MemoryWorldStore, NoiseTerrainGenerator, TileGrid, TileId};

    /// Records every message instead of sending it.
    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(ConnectionId, Message)>>,
    }

    impl RecordingSink {
        fn for_client(&self, id: ConnectionId) -> Vec<Message> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(to, _)| *to == id)
                .map(|(_, m)| m.clone())
                .collect()
        }

        fn len(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl MessageSink for RecordingSink {
        fn send(&self, connection: ConnectionId, message: Message) -> Result<(), SendError> {
            self.sent.lock().unwrap().push((connection, message));
            Ok(())
        }
    }

    /// Generator that blocks until the test opens the gate, counting calls.
    struct GatedGenerator {
        gate: Receiver<()>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl GatedGenerator {
        fn new(fail: bool) -> (Arc<Self>, Sender<()>) {
            let (tx, rx) = crossbeam_channel::unbounded();
            (
                Arc::new(Self {
                    gate: rx,
                    calls: AtomicUsize::new(0),
                    fail,
                }),
                tx,
            )
        }
    }

    impl TerrainGenerator for GatedGenerator {
        fn generate(&self, _seed: u64, coord: ChunkCoord) -> Result<ChunkPayload, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.gate.recv_timeout(Duration::from_secs(5));
            if self.fail {
                return Err(GenerationError::Failed {
                    coord,
                    reason: "boom".into(),
                });
            }
            Ok(ChunkPayload::new(coord, TileGrid::filled(TileId::GRASS), vec![]))
        }
    }

    struct Harness {
        dispatcher: ServerChunkDispatcher,
        sink: Arc<RecordingSink>,
        store: Arc<MemoryWorldStore>,
        cache: Arc<ChunkCache>,
    }

    fn harness(generator: Arc<dyn TerrainGenerator>, workers: usize, queue: usize) -> Harness {
        let sink = Arc::new(RecordingSink::default());
        let store = Arc::new(MemoryWorldStore::new());
        let cache = Arc::new(ChunkCache::new(256, Duration::from_secs(300)));
        let config = DispatcherConfig {
            world_id: "test".into(),
            seed: 42,
            workers,
            max_objects_per_part: 50,
            queue_capacity: queue,
        };
        let dispatcher = ServerChunkDispatcher::new(
            config,
            store.clone(),
            generator,
            cache.clone(),
            sink.clone(),
        )
        .unwrap();
        Harness {
            dispatcher,
            sink,
            store,
            cache,
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    const A: ConnectionId = ConnectionId(1);
    const B: ConnectionId = ConnectionId(2);

    #[test]
    fn test_concurrent_requests_share_one_generation() {
        let (generator, gate) = GatedGenerator::new(false);
        let h = harness(generator.clone(), 4, 64);
        let coord = ChunkCoord::new(10, 10);

        assert_eq!(h.dispatcher.on_request(A, coord), RequestOutcome::Submitted);
        assert_eq!(h.dispatcher.on_request(B, coord), RequestOutcome::Joined);
        assert_eq!(h.dispatcher.pending_count(), 1);

        gate.send(()).unwrap();
        wait_until(|| h.sink.len() == 4);

        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.dispatcher.generation_count(), 1);
        for client in [A, B] {
            let msgs = h.sink.for_client(client);
            assert!(matches!(&msgs[0], Message::ChunkData(d) if d.coord() == coord && !d.partial));
            assert!(matches!(&msgs[1], Message::ChunkRequestAck(a) if a.x == 10 && a.y == 10));
            assert!(h.cache.is_cached(client, coord, Instant::now()));
        }
        assert_eq!(h.dispatcher.pending_count(), 0);
        assert_eq!(h.store.save_count(), 1);
    }

    #[test]
    fn test_stored_chunk_is_loaded_not_generated() {
        let (generator, _gate) = GatedGenerator::new(false);
        let h = harness(generator.clone(), 2, 8);
        let coord = ChunkCoord::new(-1, 3);
        h.store
            .save_chunk(
                "test",
                &ChunkPayload::new(coord, TileGrid::filled(TileId::SAND), vec![]),
            )
            .unwrap();

        h.dispatcher.on_request(A, coord);
        wait_until(|| h.sink.len() == 2);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
        match &h.sink.for_client(A)[0] {
            Message::ChunkData(d) => {
                assert_eq!(d.tiles.as_ref().unwrap().get(0, 0), Some(TileId::SAND));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_large_chunk_sent_as_parts_then_ack() {
        let h = harness(Arc::new(NoiseTerrainGenerator::default()), 1, 8);
        let coord = ChunkCoord::new(0, 0);
        let mut payload = ChunkPayload::new(coord, TileGrid::filled(TileId::GRASS), vec![]);
        for i in 0..120 {
            payload.objects.push(tilestream_world::WorldObject {
                id: tilestream_world::ObjectId(i),
                tile_x: (i % 16) as i32,
                tile_y: (i / 16) as i32,
                object_type: "bush".into(),
                collidable: false,
                spawned_at_ms: 0,
            });
        }
        h.store.save_chunk("test", &payload).unwrap();

        h.dispatcher.on_request(A, coord);
        wait_until(|| h.sink.len() == 4);
        let msgs = h.sink.for_client(A);
        let indices: Vec<u32> = msgs[..3]
            .iter()
            .map(|m| match m {
                Message::ChunkData(d) => d.part_index,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(matches!(msgs[3], Message::ChunkRequestAck(_)));
    }

    #[test]
    fn test_failure_notifies_every_waiter() {
        let (generator, gate) = GatedGenerator::new(true);
        let h = harness(generator, 2, 8);
        let coord = ChunkCoord::new(7, 7);
        h.dispatcher.on_request(A, coord);
        h.dispatcher.on_request(B, coord);
        gate.send(()).unwrap();

        wait_until(|| h.sink.len() == 2);
        for client in [A, B] {
            let msgs = h.sink.for_client(client);
            assert!(matches!(&msgs[0], Message::ChunkFailed(f) if f.reason.contains("boom")));
            assert!(!h.cache.is_cached(client, coord, Instant::now()));
        }
        assert_eq!(h.dispatcher.pending_count(), 0);
        assert_eq!(h.store.save_count(), 0);
    }

    #[test]
    fn test_disconnected_waiter_receives_nothing() {
        let (generator, gate) = GatedGenerator::new(false);
        let h = harness(generator, 2, 8);
        let coord = ChunkCoord::new(1, 1);
        h.dispatcher.on_request(A, coord);
        h.dispatcher.on_request(B, coord);
        h.dispatcher.on_disconnect(A);
        gate.send(()).unwrap();

        wait_until(|| h.sink.len() == 2);
        assert!(h.sink.for_client(A).is_empty());
        assert_eq!(h.sink.for_client(B).len(), 2);
    }

    #[test]
    fn test_request_after_completion_starts_new_job() {
        let (generator, gate) = GatedGenerator::new(false);
        let h = harness(generator.clone(), 1, 8);
        let coord = ChunkCoord::new(2, 2);
        gate.send(()).unwrap();
        assert_eq!(h.dispatcher.on_request(A, coord), RequestOutcome::Submitted);
        wait_until(|| h.sink.len() == 2);

        // Second job is served from the store saved by the first.
        assert_eq!(h.dispatcher.on_request(B, coord), RequestOutcome::Submitted);
        wait_until(|| h.sink.len() == 4);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.dispatcher.generation_count(), 2);
    }

    #[test]
    fn test_full_queue_spills_into_backlog() {
        let (generator, gate) = GatedGenerator::new(false);
        let h = harness(generator.clone(), 1, 1);

        h.dispatcher.on_request(A, ChunkCoord::new(0, 0));
        wait_until(|| generator.calls.load(Ordering::SeqCst) == 1);
        assert_eq!(
            h.dispatcher.on_request(A, ChunkCoord::new(0, 1)),
            RequestOutcome::Submitted
        );
        assert_eq!(
            h.dispatcher.on_request(A, ChunkCoord::new(0, 2)),
            RequestOutcome::Backlogged
        );
        assert_eq!(
            h.dispatcher.on_request(B, ChunkCoord::new(0, 2)),
            RequestOutcome::Joined
        );
        assert!(h.dispatcher.is_pending(ChunkCoord::new(0, 2)));
        assert_eq!(h.dispatcher.backlog_len(), 1);

        for _ in 0..3 {
            gate.send(()).unwrap();
        }
        wait_until(|| h.dispatcher.pending_count() == 0);
        assert_eq!(h.dispatcher.backlog_len(), 0);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
        let failures = h
            .sink
            .for_client(A)
            .iter()
            .filter(|m| matches!(m, Message::ChunkFailed(_)))
            .count();
        assert_eq!(failures, 0);
        assert!(matches!(
            h.sink.for_client(B).as_slice(),
            [Message::ChunkData(d), Message::ChunkRequestAck(_)] if d.coord() == ChunkCoord::new(0, 2)
        ));
    }

    #[test]
    fn test_chunk_beyond_tile_range_fails_and_worker_survives() {
        let h = harness(Arc::new(NoiseTerrainGenerator::default()), 1, 8);
        let far = ChunkCoord::new(200_000_000, 0);

        assert_eq!(h.dispatcher.on_request(A, far), RequestOutcome::Submitted);
        wait_until(|| h.sink.len() == 1);
        assert!(matches!(
            &h.sink.for_client(A)[0],
            Message::ChunkFailed(f) if f.x == far.x && f.y == far.y
        ));
        assert_eq!(h.dispatcher.pending_count(), 0);

        assert_eq!(
            h.dispatcher.on_request(A, ChunkCoord::new(0, 0)),
            RequestOutcome::Submitted
        );
        wait_until(|| h.sink.len() == 3);
        let msgs = h.sink.for_client(A);
        assert!(matches!(&msgs[1], Message::ChunkData(d) if d.coord() == ChunkCoord::new(0, 0)));
        assert!(matches!(&msgs[2], Message::ChunkRequestAck(_)));
        assert_eq!(h.dispatcher.pending_count(), 0);
    }

    /// Panics for one chunk, returns flat grass for the rest.
    struct PanickingGenerator {
        poisoned: ChunkCoord,
    }

    impl TerrainGenerator for PanickingGenerator {
        fn generate(&self, _seed: u64, coord: ChunkCoord) -> Result<ChunkPayload, GenerationError> {
            if coord == self.poisoned {
                panic!("generator bug at {coord}");
            }
            Ok(ChunkPayload::new(coord, TileGrid::filled(TileId::GRASS), vec![]))
        }
    }

    #[test]
    fn test_panicking_job_fails_waiters_and_keeps_worker() {
        let poisoned = ChunkCoord::new(4, 4);
        let h = harness(Arc::new(PanickingGenerator { poisoned }), 1, 8);

        h.dispatcher.on_request(A, poisoned);
        h.dispatcher.on_request(B, poisoned);
        wait_until(|| h.sink.len() == 2);
        for client in [A, B] {
            assert!(matches!(
                &h.sink.for_client(client)[0],
                Message::ChunkFailed(f) if f.reason.contains("panicked")
            ));
        }
        assert_eq!(h.dispatcher.pending_count(), 0);

        // Same worker, next job.
        assert_eq!(h.dispatcher.on_request(A, poisoned), RequestOutcome::Submitted);
        h.dispatcher.on_request(B, ChunkCoord::new(5, 5));
        wait_until(|| h.sink.for_client(B).len() == 3);
        assert!(matches!(&h.sink.for_client(B)[1], Message::ChunkData(_)));
        assert_eq!(h.dispatcher.generation_count(), 3);
    }

    #[test]
    fn test_shutdown_joins_workers() {
        let (generator, gate) = GatedGenerator::new(false);
        let mut h = harness(generator, 2, 8);
        h.dispatcher.on_request(A, ChunkCoord::new(0, 0));
        gate.send(()).unwrap();
        h.dispatcher.shutdown();
        assert_eq!(h.dispatcher.pending_count(), 0);
        assert_eq!(
            h.dispatcher.on_request(B, ChunkCoord::new(1, 0)),
            RequestOutcome::Rejected
        );
    }
}
