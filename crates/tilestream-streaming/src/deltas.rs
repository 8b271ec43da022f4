//! World object deltas: server-side batching and client-side application.
//!
//! The server records every add, move and remove as it happens and flushes
//! the batch once per tick as a single [`WorldObjectsUpdate`]. Entries are
//! never coalesced; a spawn followed by a move of the same object is two
//! entries, applied in order on the client.
//!
//! A chunk snapshot can be read on the server before an edit and still be on
//! the wire after that edit's delta arrived. [`HeldDeltas`] keeps deltas for
//! chunks the client has requested but not yet received and replays them on
//! top of the snapshot once it lands.

use std::sync::{Mutex, PoisonError};

use rustc_hash::FxHashMap;
use tilestream_net::{WorldObjectUpdate, WorldObjectsUpdate};
use tilestream_world::{ChunkCoord, ObjectTypeRegistry, WorldObject};

use crate::local_world::{LocalWorld, UpsertOutcome};

// ---------------------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------------------

/// Accumulates object changes between flushes.
#[derive(Default)]
pub struct WorldObjectDeltaBroadcaster {
    pending: Mutex<Vec<WorldObjectUpdate>>,
}

impl WorldObjectDeltaBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_add(&self, object: &WorldObject) {
        self.push(entry(object, false));
    }

    pub fn record_move(&self, object: &WorldObject) {
        self.push(entry(object, false));
    }

    pub fn record_remove(&self, object: &WorldObject) {
        self.push(entry(object, true));
    }

    fn push(&self, update: WorldObjectUpdate) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(update);
    }

    /// Take every recorded change. Returns `None` when nothing changed since
    /// the last flush, so no empty message goes out.
    pub fn flush(&self) -> Option<WorldObjectsUpdate> {
        let entries = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        if entries.is_empty() {
            return None;
        }
        Some(WorldObjectsUpdate { entries })
    }

    /// Changes recorded since the last flush.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn entry(object: &WorldObject, removed: bool) -> WorldObjectUpdate {
    WorldObjectUpdate {
        object_id: object.id,
        tile_x: object.tile_x,
        tile_y: object.tile_y,
        object_type: object.object_type.clone(),
        removed,
    }
}

// ---------------------------------------------------------------------------
// Client application
// ---------------------------------------------------------------------------

/// Counts of what [`apply_updates`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub created: usize,
    pub updated: usize,
    pub migrated: usize,
    pub removed: usize,
    /// Objects whose destination chunk is not loaded locally.
    pub dropped: usize,
    /// Entries naming an object type the registry does not know.
    pub skipped: usize,
}

/// Apply a batch of deltas to the local world, in order.
///
/// An entry with an unknown object type is logged and skipped; the rest of
/// the batch still applies. Removing an object that is not present is a
/// no-op.
pub fn apply_updates(
    world: &mut LocalWorld,
    registry: &ObjectTypeRegistry,
    updates: &[WorldObjectUpdate],
) -> ApplyReport {
    let mut report = ApplyReport::default();

    for update in updates {
        if update.removed {
            if world.remove_object(update.object_id).is_some() {
                report.removed += 1;
            }
            continue;
        }

        let Some(def) = registry.get(&update.object_type) else {
            tracing::error!(
                "delta for {:?} names unknown object type {:?}, skipping",
                update.object_id,
                update.object_type
            );
            report.skipped += 1;
            continue;
        };

        let spawned_at_ms = world
            .object(update.object_id)
            .map_or(0, |existing| existing.spawned_at_ms);
        let object = WorldObject {
            id: update.object_id,
            tile_x: update.tile_x,
            tile_y: update.tile_y,
            object_type: def.name.clone(),
            collidable: def.collidable,
            spawned_at_ms,
        };

        match world.upsert_object(object) {
            UpsertOutcome::Created => report.created += 1,
            UpsertOutcome::Updated => report.updated += 1,
            UpsertOutcome::Migrated { from } => {
                tracing::trace!("{:?} migrated out of chunk {from}", update.object_id);
                report.migrated += 1;
            }
            UpsertOutcome::Unloaded => report.dropped += 1,
        }
    }

    report
}

// ---------------------------------------------------------------------------
// Held deltas
// ---------------------------------------------------------------------------

/// Deltas that touch chunks whose payload is still in transit.
///
/// Replaying a held delta on a snapshot that already contains it is
/// harmless: upserts are idempotent and removing a missing object is a no-op.
#[derive(Debug, Default)]
pub struct HeldDeltas {
    held: FxHashMap<ChunkCoord, Vec<WorldObjectUpdate>>,
}

impl HeldDeltas {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep a copy of every entry whose tile lies in a chunk for which
    /// `in_transit` holds. Returns how many entries were kept.
    pub fn hold(
        &mut self,
        updates: &[WorldObjectUpdate],
        mut in_transit: impl FnMut(ChunkCoord) -> bool,
    ) -> usize {
        let mut kept = 0;
        for update in updates {
            let coord = ChunkCoord::from_tile(update.tile_x, update.tile_y);
            if in_transit(coord) {
                self.held.entry(coord).or_default().push(update.clone());
                kept += 1;
            }
        }
        kept
    }

    /// Entries held for `coord`, in arrival order. Clears them.
    pub fn take(&mut self, coord: ChunkCoord) -> Vec<WorldObjectUpdate> {
        self.held.remove(&coord).unwrap_or_default()
    }

    pub fn discard(&mut self, coord: ChunkCoord) {
        self.held.remove(&coord);
    }

    /// Drop held entries for every chunk `keep` rejects.
    pub fn retain(&mut self, mut keep: impl FnMut(ChunkCoord) -> bool) {
        self.held.retain(|coord, _| keep(*coord));
    }

    pub fn clear(&mut self) {
        self.held.clear();
    }

    /// Total held entries.
    pub fn len(&self) -> usize {
        self.held.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
