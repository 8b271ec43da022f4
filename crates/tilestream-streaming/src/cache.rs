//! Per-client record of which chunks were recently delivered.
//!
//! Bounded per client: once a client holds more than `per_client_max`
//! entries the oldest by delivery time is evicted. Entries also expire after
//! a TTL, lazily on lookup and eagerly on [`ChunkCache::sweep`].

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tilestream_config::StreamingConfig;
use tilestream_net::ConnectionId;
use tilestream_world::ChunkCoord;

type ClientEntries = FxHashMap<ChunkCoord, Instant>;

/// Delivery cache shared by the dispatcher (worker threads) and the server loop.
pub struct ChunkCache {
    per_client_max: usize,
    ttl: Duration,
    clients: Mutex<FxHashMap<ConnectionId, ClientEntries>>,
}

impl ChunkCache {
    pub fn new(per_client_max: usize, ttl: Duration) -> Self {
        Self {
            per_client_max: per_client_max.max(1),
            ttl,
            clients: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn from_config(config: &StreamingConfig) -> Self {
        Self::new(config.per_client_cache_max, config.cache_ttl())
    }

    /// Record that `coord` was delivered to `client` at `now`.
    ///
    /// Returns the coordinates evicted to keep the client within bounds.
    pub fn mark_sent(&self, client: ConnectionId, coord: ChunkCoord, now: Instant) -> Vec<ChunkCoord> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        let entries = clients.entry(client).or_default();
        entries.insert(coord, now);

        let mut evicted = Vec::new();
        while entries.len() > self.per_client_max {
            // Ties broken by coordinate so eviction is deterministic.
            let Some(oldest) = entries
                .iter()
                .min_by_key(|(coord, at)| (**at, **coord))
                .map(|(coord, _)| *coord)
            else {
                break;
            };
            entries.remove(&oldest);
            evicted.push(oldest);
        }

        if !evicted.is_empty() {
            tracing::trace!("cache evicted {} chunk(s) for {client:?}: {evicted:?}", evicted.len());
        }
        evicted
    }

    /// Whether `coord` was delivered to `client` within the TTL.
    /// An expired entry is removed.
    pub fn is_cached(&self, client: ConnectionId, coord: ChunkCoord, now: Instant) -> bool {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = clients.get_mut(&client) else {
            return false;
        };
        match entries.get(&coord) {
            Some(at) if now.saturating_duration_since(*at) < self.ttl => true,
            Some(_) => {
                entries.remove(&coord);
                false
            }
            None => false,
        }
    }

    /// Drop one entry, e.g. after the client released the chunk.
    pub fn forget(&self, client: ConnectionId, coord: ChunkCoord) -> bool {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = clients.get_mut(&client) else {
            return false;
        };
        let removed = entries.remove(&coord).is_some();
        if entries.is_empty() {
            clients.remove(&client);
        }
        removed
    }

    /// Drop everything recorded for a disconnected client.
    pub fn remove_client(&self, client: ConnectionId) {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&client);
    }

    /// Remove every expired entry and any client left empty.
    /// Returns the number of entries removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        clients.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|_, at| now.saturating_duration_since(*at) < self.ttl);
            removed += before - entries.len();
            !entries.is_empty()
        });
        if removed > 0 {
            tracing::debug!("cache sweep removed {removed} expired entries");
        }
        removed
    }

    /// Entries currently held for `client`, expired or not.
    pub fn client_len(&self, client: ConnectionId) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&client)
            .map_or(0, FxHashMap::len)
    }

    /// Number of clients with at least one entry.
    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
