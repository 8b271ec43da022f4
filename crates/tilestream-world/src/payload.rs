//! The complete state of one chunk: its tiles and the objects it owns.

use serde::{Deserialize, Serialize};

use crate::coords::ChunkCoord;
use crate::object::{ObjectId, WorldObject};
use crate::tiles::TileGrid;

/// Tiles plus owned objects for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub coord: ChunkCoord,
    pub tiles: TileGrid,
    pub objects: Vec<WorldObject>,
}

impl ChunkPayload {
    pub fn new(coord: ChunkCoord, tiles: TileGrid, objects: Vec<WorldObject>) -> Self {
        Self {
            coord,
            tiles,
            objects,
        }
    }

    /// Find an owned object by id.
    pub fn object(&self, id: ObjectId) -> Option<&WorldObject> {
        self.objects.iter().find(|o| o.id == id)
    }

    /// Insert `object`, replacing any existing object with the same id.
    /// Insertion order is kept for new objects.
    pub fn upsert_object(&mut self, object: WorldObject) {
        match self.objects.iter_mut().find(|o| o.id == object.id) {
            Some(existing) => *existing = object,
            None => self.objects.push(object),
        }
    }

    /// Remove an owned object, returning it if it was present.
    pub fn remove_object(&mut self, id: ObjectId) -> Option<WorldObject> {
        let index = self.objects.iter().position(|o| o.id == id)?;
        Some(self.objects.remove(index))
    }
}
