//! Client-side chunk request scheduling.
//!
//! Decides which chunk requests go on the wire and when. At most
//! `max_concurrent` requests are in flight; the rest wait in per-tier FIFO
//! queues. Urgent requests skip the queue and the cap. A request that gets
//! no answer within its timeout is requeued once at retry priority.
//!
//! The coordinator is pure state: every call that may emit requests returns
//! them and the caller sends them.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tilestream_config::StreamingConfig;
use tilestream_net::{ChunkRequest, unix_millis};
use tilestream_world::ChunkCoord;

use crate::preload::{RingRadii, plan_rings, plan_urgent};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Request tier. Declaration order is scheduling order, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// Speculative outer ring.
    Preload,
    /// Re-request after a timeout or failure.
    Retry,
    /// On-screen chunk.
    Normal,
    /// Chunk under or next to the player. Bypasses the concurrency cap.
    Urgent,
}

impl Priority {
    const COUNT: usize = 4;

    fn index(self) -> usize {
        self as usize
    }
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_concurrent: usize,
    pub request_timeout: Duration,
    pub urgent_timeout: Duration,
    pub radii: RingRadii,
}

impl CoordinatorConfig {
    pub fn from_config(config: &StreamingConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_requests.max(1),
            request_timeout: config.request_timeout(),
            urgent_timeout: config.urgent_request_timeout(),
            radii: RingRadii::from_config(config),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from_config(&StreamingConfig::default())
    }
}

/// A request on the wire awaiting its chunk.
#[derive(Debug, Clone)]
struct PendingRequest {
    priority: Priority,
    issued_at: Instant,
    timeout: Duration,
    acked: bool,
}

/// Result of [`ChunkRequestCoordinator::on_received`].
#[derive(Debug, Default)]
pub struct Received {
    /// Whether the chunk was asked for. Unwanted payloads are discarded.
    pub wanted: bool,
    /// Requests released by the freed slot.
    pub requests: Vec<ChunkRequest>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct ChunkRequestCoordinator {
    config: CoordinatorConfig,
    pending: FxHashMap<ChunkCoord, PendingRequest>,
    /// One FIFO per tier, indexed by [`Priority::index`].
    queues: [VecDeque<ChunkCoord>; Priority::COUNT],
    queued: FxHashMap<ChunkCoord, Priority>,
    /// Failed requests held back until their original timeout would expire.
    deferred: FxHashMap<ChunkCoord, Instant>,
}

impl ChunkRequestCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            pending: FxHashMap::default(),
            queues: Default::default(),
            queued: FxHashMap::default(),
            deferred: FxHashMap::default(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Ask for `coord` at `priority`.
    ///
    /// No-op if the chunk is pending, deferred after a failure, or already
    /// queued at the same or a higher tier. A queued chunk asked for at a
    /// higher tier moves up.
    pub fn enqueue(&mut self, coord: ChunkCoord, priority: Priority, now: Instant) -> Vec<ChunkRequest> {
        if self.pending.contains_key(&coord) || self.deferred.contains_key(&coord) {
            return Vec::new();
        }
        if let Some(&current) = self.queued.get(&coord) {
            if current >= priority {
                return Vec::new();
            }
            self.unqueue(coord, current);
            tracing::trace!("promoted {coord} from {current:?} to {priority:?}");
        }

        let mut out = Vec::new();
        if priority == Priority::Urgent || self.pending.len() < self.config.max_concurrent {
            out.push(self.issue(coord, priority, now));
        } else {
            self.push_queue(coord, priority);
        }
        out
    }

    /// A complete chunk arrived.
    pub fn on_received(&mut self, coord: ChunkCoord, now: Instant) -> Received {
        let was_pending = self.pending.remove(&coord).is_some();
        let was_queued = match self.queued.get(&coord).copied() {
            Some(tier) => {
                self.unqueue(coord, tier);
                true
            }
            None => false,
        };
        let was_deferred = self.deferred.remove(&coord).is_some();

        let wanted = was_pending || was_queued || was_deferred;
        if !wanted {
            tracing::debug!("discarding unrequested chunk {coord}");
        }
        Received {
            wanted,
            requests: self.pump(now),
        }
    }

    /// The server acknowledged `coord`.
    ///
    /// Returns `true` if the request is still pending, meaning the server
    /// considers the chunk delivered but no complete payload arrived.
    pub fn on_ack(&mut self, coord: ChunkCoord) -> bool {
        match self.pending.get_mut(&coord) {
            Some(req) => {
                req.acked = true;
                true
            }
            None => false,
        }
    }

    /// The server reported that `coord` could not be produced. The slot is
    /// freed and a retry is scheduled for when the original request would
    /// have timed out.
    pub fn on_failed(&mut self, coord: ChunkCoord, now: Instant) -> Vec<ChunkRequest> {
        if let Some(req) = self.pending.remove(&coord) {
            let retry_at = req.issued_at + req.timeout;
            self.deferred.insert(coord, retry_at);
            tracing::debug!("chunk {coord} failed, retrying in {:?}", retry_at.saturating_duration_since(now));
        }
        self.pump(now)
    }

    /// Requeue timed-out requests at retry priority, release due retries,
    /// and fill free slots.
    pub fn tick(&mut self, now: Instant) -> Vec<ChunkRequest> {
        let mut expired: Vec<ChunkCoord> = self
            .pending
            .iter()
            .filter(|(_, req)| now.saturating_duration_since(req.issued_at) >= req.timeout)
            .map(|(coord, _)| *coord)
            .collect();
        expired.sort();
        for coord in &expired {
            if let Some(req) = self.pending.remove(coord) {
                tracing::warn!(
                    "chunk request {coord} ({:?}{}) timed out, requeueing",
                    req.priority,
                    if req.acked { ", acked" } else { "" }
                );
            }
            self.push_queue(*coord, Priority::Retry);
        }

        let mut due: Vec<ChunkCoord> = self
            .deferred
            .iter()
            .filter(|(_, at)| now >= **at)
            .map(|(coord, _)| *coord)
            .collect();
        due.sort();
        for coord in due {
            self.deferred.remove(&coord);
            self.push_queue(coord, Priority::Retry);
        }

        self.pump(now)
    }

    /// Request every missing chunk in the rings around `center_tile`.
    ///
    /// Queued speculative requests that fell outside the outer ring are
    /// dropped first.
    pub fn preload_around(
        &mut self,
        center_tile: (i32, i32),
        is_loaded: impl Fn(ChunkCoord) -> bool,
        now: Instant,
    ) -> Vec<ChunkRequest> {
        let plan = plan_rings(center_tile, self.config.radii);
        self.retain_queued_within(plan.center, self.config.radii.preload);

        let mut out = Vec::new();
        let rings = [
            (plan.urgent, Priority::Urgent),
            (plan.visible, Priority::Normal),
            (plan.preload, Priority::Preload),
        ];
        for (coords, priority) in rings {
            for coord in coords {
                if !is_loaded(coord) {
                    out.extend(self.enqueue(coord, priority, now));
                }
            }
        }
        out
    }

    /// Request missing chunks of the urgent ring only.
    pub fn preload_urgent(
        &mut self,
        center_tile: (i32, i32),
        is_loaded: impl Fn(ChunkCoord) -> bool,
        now: Instant,
    ) -> Vec<ChunkRequest> {
        let mut out = Vec::new();
        for coord in plan_urgent(center_tile, self.config.radii.urgent) {
            if !is_loaded(coord) {
                out.extend(self.enqueue(coord, Priority::Urgent, now));
            }
        }
        out
    }

    /// Drop all state, e.g. on disconnect.
    pub fn clear(&mut self) {
        self.pending.clear();
        for queue in &mut self.queues {
            queue.clear();
        }
        self.queued.clear();
        self.deferred.clear();
    }

    pub fn is_pending(&self, coord: ChunkCoord) -> bool {
        self.pending.contains_key(&coord)
    }

    pub fn is_queued(&self, coord: ChunkCoord) -> bool {
        self.queued.contains_key(&coord)
    }

    /// Queued tier of `coord`, if any.
    pub fn queued_priority(&self, coord: ChunkCoord) -> Option<Priority> {
        self.queued.get(&coord).copied()
    }

    /// Requests currently on the wire.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    // -- internals ----------------------------------------------------------

    fn issue(&mut self, coord: ChunkCoord, priority: Priority, now: Instant) -> ChunkRequest {
        let timeout = if priority == Priority::Urgent {
            self.config.urgent_timeout
        } else {
            self.config.request_timeout
        };
        self.pending.insert(
            coord,
            PendingRequest {
                priority,
                issued_at: now,
                timeout,
                acked: false,
            },
        );
        ChunkRequest {
            x: coord.x,
            y: coord.y,
            timestamp_ms: unix_millis(),
        }
    }

    fn push_queue(&mut self, coord: ChunkCoord, priority: Priority) {
        self.queues[priority.index()].push_back(coord);
        self.queued.insert(coord, priority);
    }

    fn unqueue(&mut self, coord: ChunkCoord, priority: Priority) {
        self.queues[priority.index()].retain(|c| *c != coord);
        self.queued.remove(&coord);
    }

    /// Highest tier first, FIFO within a tier.
    fn pop_next(&mut self) -> Option<(ChunkCoord, Priority)> {
        for index in (0..Priority::COUNT).rev() {
            if let Some(coord) = self.queues[index].pop_front() {
                let priority = self.queued.remove(&coord).unwrap_or(Priority::Retry);
                return Some((coord, priority));
            }
        }
        None
    }

    fn pump(&mut self, now: Instant) -> Vec<ChunkRequest> {
        let mut out = Vec::new();
        while self.pending.len() < self.config.max_concurrent {
            let Some((coord, priority)) = self.pop_next() else {
                break;
            };
            out.push(self.issue(coord, priority, now));
        }
        out
    }

    fn retain_queued_within(&mut self, center: ChunkCoord, radius: u32) {
        let before = self.queued.len();
        self.queued.retain(|c, _| c.ring_distance(&center) <= radius);
        if self.queued.len() == before {
            return;
        }
        let queued = &self.queued;
        for queue in &mut self.queues {
            queue.retain(|c| queued.contains_key(c));
        }
        tracing::trace!("dropped {} out-of-range queued request(s)", before - self.queued.len());
    }
}

impl Default for ChunkRequestCoordinator {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const MS: Duration = Duration::from_millis(1);

    fn c(x: i32, y: i32) -> ChunkCoord {
        ChunkCoord::new(x, y)
    }

    fn coords(reqs: &[ChunkRequest]) -> Vec<ChunkCoord> {
        reqs.iter().map(ChunkRequest::coord).collect()
    }

    fn with_cap(max_concurrent: usize) -> ChunkRequestCoordinator {
        ChunkRequestCoordinator::new(CoordinatorConfig {
            max_concurrent,
            ..CoordinatorConfig::default()
        })
    }

    #[test]
    fn test_enqueue_sends_immediately_under_cap() {
        let mut coord = with_cap(2);
        let now = Instant::now();
        assert_eq!(coords(&coord.enqueue(c(1, 1), Priority::Normal, now)), vec![c(1, 1)]);
        assert!(coord.is_pending(c(1, 1)));
        assert_eq!(coord.in_flight(), 1);
    }

    #[test]
    fn test_duplicate_enqueue_is_noop() {
        let mut coord = with_cap(1);
        let now = Instant::now();
        assert_eq!(coord.enqueue(c(0, 0), Priority::Normal, now).len(), 1);
        assert!(coord.enqueue(c(0, 0), Priority::Normal, now).is_empty());
        assert!(coord.enqueue(c(0, 0), Priority::Urgent, now).is_empty());

        assert!(coord.enqueue(c(1, 0), Priority::Normal, now).is_empty());
        assert!(coord.enqueue(c(1, 0), Priority::Preload, now).is_empty());
        assert_eq!(coord.queued_len(), 1);
        assert_eq!(coord.queued_priority(c(1, 0)), Some(Priority::Normal));
    }

    #[test]
    fn test_cap_queues_excess_and_urgent_bypasses() {
        let mut coord = with_cap(2);
        let now = Instant::now();
        coord.enqueue(c(0, 0), Priority::Normal, now);
        coord.enqueue(c(1, 0), Priority::Normal, now);
        assert!(coord.enqueue(c(2, 0), Priority::Normal, now).is_empty());
        assert!(coord.is_queued(c(2, 0)));

        assert_eq!(coords(&coord.enqueue(c(9, 9), Priority::Urgent, now)), vec![c(9, 9)]);
        assert_eq!(coord.in_flight(), 3);
    }

    #[test]
    fn test_queue_order_by_tier_then_fifo() {
        let mut coord = with_cap(1);
        let now = Instant::now();
        coord.enqueue(c(0, 0), Priority::Normal, now);
        coord.enqueue(c(1, 0), Priority::Preload, now);
        coord.enqueue(c(2, 0), Priority::Retry, now);
        coord.enqueue(c(3, 0), Priority::Normal, now);
        coord.enqueue(c(4, 0), Priority::Normal, now);

        let mut order = Vec::new();
        let mut next = c(0, 0);
        for _ in 0..4 {
            let received = coord.on_received(next, now);
            assert!(received.wanted);
            assert_eq!(received.requests.len(), 1);
            next = received.requests[0].coord();
            order.push(next);
        }
        assert_eq!(order, vec![c(3, 0), c(4, 0), c(2, 0), c(1, 0)]);
    }

    #[test]
    fn test_promotion_moves_queued_entry_up() {
        let mut coord = with_cap(1);
        let now = Instant::now();
        coord.enqueue(c(0, 0), Priority::Normal, now);
        coord.enqueue(c(1, 0), Priority::Normal, now);
        coord.enqueue(c(2, 0), Priority::Preload, now);
        coord.enqueue(c(2, 0), Priority::Normal, now);
        assert_eq!(coord.queued_priority(c(2, 0)), Some(Priority::Normal));

        // Promoting to urgent sends right away.
        assert_eq!(coords(&coord.enqueue(c(1, 0), Priority::Urgent, now)), vec![c(1, 0)]);
        assert!(!coord.is_queued(c(1, 0)));
        assert_eq!(coord.queued_len(), 1);
    }

    #[test]
    fn test_unrequested_payload_is_unwanted() {
        let mut coord = with_cap(4);
        let received = coord.on_received(c(5, 5), Instant::now());
        assert!(!received.wanted);
        assert!(received.requests.is_empty());
    }

    #[test]
    fn test_no_response_retries_once_after_timeout() {
        let mut coord = ChunkRequestCoordinator::default();
        let t0 = Instant::now();
        assert_eq!(coords(&coord.enqueue(c(1, 1), Priority::Normal, t0)), vec![c(1, 1)]);

        assert!(coord.tick(t0 + 4999 * MS).is_empty());
        assert!(coord.is_pending(c(1, 1)));

        let retry = coord.tick(t0 + 5000 * MS);
        assert_eq!(coords(&retry), vec![c(1, 1)]);
        assert!(coord.is_pending(c(1, 1)));

        // The retry is pending with a fresh timeout; sweeping again is quiet.
        assert!(coord.tick(t0 + 5000 * MS).is_empty());
        assert!(coord.tick(t0 + 9999 * MS).is_empty());
        assert_eq!(coords(&coord.tick(t0 + 10_000 * MS)), vec![c(1, 1)]);
    }

    #[test]
    fn test_urgent_timeout_is_shorter() {
        let mut coord = ChunkRequestCoordinator::default();
        let t0 = Instant::now();
        coord.enqueue(c(0, 0), Priority::Urgent, t0);
        coord.enqueue(c(1, 0), Priority::Normal, t0);
        assert_eq!(coords(&coord.tick(t0 + 1000 * MS)), vec![c(0, 0)]);
    }

    #[test]
    fn test_expired_requests_never_double_in_flight() {
        let mut coord = with_cap(2);
        let t0 = Instant::now();
        for x in 0..5 {
            coord.enqueue(c(x, 0), Priority::Normal, t0);
        }
        assert_eq!(coord.in_flight(), 2);

        let mut now = t0;
        for _ in 0..6 {
            now += 5000 * MS;
            let sent = coord.tick(now);
            let unique: HashSet<_> = coords(&sent).into_iter().collect();
            assert_eq!(unique.len(), sent.len());
            assert!(coord.in_flight() <= 2);
            for coord_sent in &unique {
                assert!(!coord.is_queued(*coord_sent));
            }
            assert_eq!(coord.in_flight() + coord.queued_len(), 5);
        }
    }

    #[test]
    fn test_timed_out_request_ranks_below_normal() {
        let mut coord = with_cap(1);
        let t0 = Instant::now();
        coord.enqueue(c(0, 0), Priority::Normal, t0);
        coord.enqueue(c(1, 0), Priority::Normal, t0);

        // c(0,0) expires, goes to retry; the fresh normal request wins the slot.
        let sent = coord.tick(t0 + 5000 * MS);
        assert_eq!(coords(&sent), vec![c(1, 0)]);
        assert_eq!(coord.queued_priority(c(0, 0)), Some(Priority::Retry));
    }

    #[test]
    fn test_failure_defers_retry_until_timeout() {
        let mut coord = with_cap(1);
        let t0 = Instant::now();
        coord.enqueue(c(0, 0), Priority::Normal, t0);
        coord.enqueue(c(1, 0), Priority::Normal, t0);

        let freed = coord.on_failed(c(0, 0), t0 + 100 * MS);
        assert_eq!(coords(&freed), vec![c(1, 0)]);
        assert_eq!(coord.deferred_len(), 1);
        assert!(coord.enqueue(c(0, 0), Priority::Urgent, t0 + 200 * MS).is_empty());

        assert!(coord.tick(t0 + 4999 * MS).is_empty());
        coord.on_received(c(1, 0), t0 + 4999 * MS);
        assert_eq!(coords(&coord.tick(t0 + 5000 * MS)), vec![c(0, 0)]);
    }

    #[test]
    fn test_ack_reports_missing_payload() {
        let mut coord = with_cap(4);
        let now = Instant::now();
        coord.enqueue(c(0, 0), Priority::Normal, now);
        assert!(coord.on_ack(c(0, 0)));
        coord.on_received(c(0, 0), now);
        assert!(!coord.on_ack(c(0, 0)));
    }

    #[test]
    fn test_preload_skips_loaded_and_pending() {
        let mut coord = ChunkRequestCoordinator::new(CoordinatorConfig {
            max_concurrent: 100,
            radii: RingRadii {
                urgent: 0,
                visible: 1,
                preload: 2,
            },
            ..CoordinatorConfig::default()
        });
        let now = Instant::now();
        let loaded = [c(0, 0), c(1, 1)];
        let sent = coord.preload_around((5, 5), |p| loaded.contains(&p), now);
        assert_eq!(sent.len(), 25 - 2);
        assert!(coords(&sent).iter().all(|p| !loaded.contains(p)));

        assert!(coord.preload_around((5, 5), |p| loaded.contains(&p), now).is_empty());
    }

    #[test]
    fn test_preload_tiers_follow_rings() {
        let mut coord = ChunkRequestCoordinator::new(CoordinatorConfig {
            max_concurrent: 0,
            radii: RingRadii {
                urgent: 0,
                visible: 1,
                preload: 2,
            },
            ..CoordinatorConfig::default()
        });
        let now = Instant::now();
        let sent = coord.preload_around((0, 0), |_| false, now);
        // With no free slots only the urgent ring goes out.
        assert_eq!(coords(&sent), vec![c(0, 0)]);
        assert_eq!(coord.queued_priority(c(1, 0)), Some(Priority::Normal));
        assert_eq!(coord.queued_priority(c(2, 2)), Some(Priority::Preload));
    }

    #[test]
    fn test_moving_away_drops_stale_queued_requests() {
        let mut coord = ChunkRequestCoordinator::new(CoordinatorConfig {
            max_concurrent: 0,
            radii: RingRadii {
                urgent: 0,
                visible: 1,
                preload: 2,
            },
            ..CoordinatorConfig::default()
        });
        let now = Instant::now();
        coord.preload_around((0, 0), |_| false, now);
        assert_eq!(coord.queued_len(), 24);

        coord.preload_around((1000, 0), |_| false, now);
        assert!(!coord.is_queued(c(0, 1)));
        assert!(coord.queued_len() <= 24);
    }

    #[test]
    fn test_preload_urgent_only() {
        let mut coord = with_cap(0);
        let sent = coord.preload_urgent((0, 0), |_| false, Instant::now());
        assert_eq!(sent.len(), 25);
        assert_eq!(coord.queued_len(), 0);
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut coord = with_cap(1);
        let now = Instant::now();
        coord.enqueue(c(0, 0), Priority::Normal, now);
        coord.enqueue(c(1, 0), Priority::Normal, now);
        coord.on_failed(c(0, 0), now);
        coord.clear();
        assert_eq!(coord.in_flight() + coord.queued_len() + coord.deferred_len(), 0);
        assert!(!coord.on_received(c(1, 0), now).wanted);
    }
}
