//! Client-side copy of the loaded part of the world.
//!
//! Holds every loaded chunk and an index from object id to owning chunk.
//! An object always lives in the chunk containing its tile; moving it across
//! a chunk border migrates it, and moving it into a chunk that is not loaded
//! drops the local copy (it arrives again with that chunk).

use rustc_hash::FxHashMap;
use tilestream_world::{ChunkCoord, ChunkPayload, ObjectId, WorldObject};

/// Result of [`LocalWorld::upsert_object`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New object added to its chunk.
    Created,
    /// Existing object updated within the same chunk.
    Updated,
    /// Existing object moved to another loaded chunk.
    Migrated { from: ChunkCoord },
    /// Destination chunk is not loaded; any local copy was removed.
    Unloaded,
}

#[derive(Default)]
pub struct LocalWorld {
    chunks: FxHashMap<ChunkCoord, ChunkPayload>,
    owners: FxHashMap<ObjectId, ChunkCoord>,
}

impl LocalWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a chunk, replacing any previous copy.
    ///
    /// Objects in the new payload take precedence over stale copies of the
    /// same ids held by other chunks.
    pub fn insert_chunk(&mut self, payload: ChunkPayload) {
        let coord = payload.coord;
        if let Some(old) = self.chunks.remove(&coord) {
            for obj in &old.objects {
                self.owners.remove(&obj.id);
            }
        }
        for obj in &payload.objects {
            if let Some(prev) = self.owners.insert(obj.id, coord)
                && prev != coord
                && let Some(other) = self.chunks.get_mut(&prev)
            {
                other.remove_object(obj.id);
            }
        }
        self.chunks.insert(coord, payload);
    }

    /// Remove a chunk and forget its objects.
    pub fn remove_chunk(&mut self, coord: ChunkCoord) -> Option<ChunkPayload> {
        let payload = self.chunks.remove(&coord)?;
        for obj in &payload.objects {
            self.owners.remove(&obj.id);
        }
        Some(payload)
    }

    pub fn is_loaded(&self, coord: ChunkCoord) -> bool {
        self.chunks.contains_key(&coord)
    }

    pub fn chunk(&self, coord: ChunkCoord) -> Option<&ChunkPayload> {
        self.chunks.get(&coord)
    }

    /// Look up an object by id.
    pub fn object(&self, id: ObjectId) -> Option<&WorldObject> {
        let owner = self.owners.get(&id)?;
        self.chunks.get(owner)?.object(id)
    }

    /// Insert or update an object, applying the ownership rule.
    pub fn upsert_object(&mut self, object: WorldObject) -> UpsertOutcome {
        let dest = object.chunk();
        let current = self.owners.get(&object.id).copied();

        if !self.chunks.contains_key(&dest) {
            if let Some(owner) = current {
                self.detach(object.id, owner);
            }
            return UpsertOutcome::Unloaded;
        }

        let outcome = match current {
            None => UpsertOutcome::Created,
            Some(owner) if owner == dest => UpsertOutcome::Updated,
            Some(owner) => {
                self.detach(object.id, owner);
                UpsertOutcome::Migrated { from: owner }
            }
        };
        self.owners.insert(object.id, dest);
        if let Some(chunk) = self.chunks.get_mut(&dest) {
            chunk.upsert_object(object);
        }
        outcome
    }

    /// Remove an object wherever it lives.
    pub fn remove_object(&mut self, id: ObjectId) -> Option<WorldObject> {
        let owner = self.owners.remove(&id)?;
        self.chunks.get_mut(&owner)?.remove_object(id)
    }

    fn detach(&mut self, id: ObjectId, owner: ChunkCoord) {
        self.owners.remove(&id);
        if let Some(chunk) = self.chunks.get_mut(&owner) {
            chunk.remove_object(id);
        }
    }

    /// Unload every chunk farther than `radius` (Chebyshev) from `center`.
    /// Returns the unloaded coordinates, nearest first.
    pub fn unload_outside(&mut self, center: ChunkCoord, radius: u32) -> Vec<ChunkCoord> {
        let mut far: Vec<ChunkCoord> = self
            .chunks
            .keys()
            .filter(|c| c.ring_distance(&center) > radius)
            .copied()
            .collect();
        far.sort_by_key(|c| (c.distance_sq(&center), *c));
        for coord in &far {
            self.remove_chunk(*coord);
        }
        far
    }

    /// Coordinates of all loaded chunks, unordered.
    pub fn loaded(&self) -> impl Iterator<Item = ChunkCoord> + '_ {
        self.chunks.keys().copied()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn object_count(&self) -> usize {
        self.owners.len()
    }

    /// Forget everything, e.g. on disconnect.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.owners.clear();
    }
}
