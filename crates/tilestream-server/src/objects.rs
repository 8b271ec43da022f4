//! Authoritative object edits.
//!
//! Gameplay code spawns, moves and removes objects through [`WorldObjects`].
//! Each edit rewrites the owning chunk in the [`WorldStore`] and records a
//! delta so connected clients see it on the next flush. A move across a
//! chunk border takes the object out of the old chunk and puts it in the
//! new one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tilestream_net::unix_millis;
use tilestream_streaming::WorldObjectDeltaBroadcaster;
use tilestream_world::{
    ChunkCoord, ChunkPayload, GenerationError, ObjectId, ObjectTypeRegistry, StoreError,
    TerrainGenerator, WorldObject, WorldStore,
};

#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("unknown object type {0:?}")]
    UnknownType(String),
    #[error("object {id:?} not found in chunk {chunk}")]
    NotFound { id: ObjectId, chunk: ChunkCoord },
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("generation: {0}")]
    Generation(#[from] GenerationError),
}

pub struct WorldObjects {
    world_id: String,
    seed: u64,
    store: Arc<dyn WorldStore>,
    generator: Arc<dyn TerrainGenerator>,
    registry: Arc<ObjectTypeRegistry>,
    broadcaster: Arc<WorldObjectDeltaBroadcaster>,
    next_id: AtomicU64,
    /// Serialises read-modify-write of stored chunks.
    edit_lock: Mutex<()>,
}

impl WorldObjects {
    pub fn new(
        world_id: impl Into<String>,
        seed: u64,
        store: Arc<dyn WorldStore>,
        generator: Arc<dyn TerrainGenerator>,
        registry: Arc<ObjectTypeRegistry>,
        broadcaster: Arc<WorldObjectDeltaBroadcaster>,
    ) -> Self {
        // Time-based start so ids from a previous run are not reused.
        let first_id = (unix_millis() << 16) & !ObjectId::GENERATED_BIT;
        Self {
            world_id: world_id.into(),
            seed,
            store,
            generator,
            registry,
            broadcaster,
            next_id: AtomicU64::new(first_id.max(1)),
            edit_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &ObjectTypeRegistry {
        &self.registry
    }

    /// Place a new object of `object_type` on a tile.
    pub fn spawn(&self, object_type: &str, tile_x: i32, tile_y: i32) -> Result<WorldObject, ObjectError> {
        let def = self
            .registry
            .get(object_type)
            .ok_or_else(|| ObjectError::UnknownType(object_type.to_string()))?;
        let id = ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed) & !ObjectId::GENERATED_BIT);
        let object = WorldObject {
            id,
            tile_x,
            tile_y,
            object_type: def.name.clone(),
            collidable: def.collidable,
            spawned_at_ms: unix_millis(),
        };

        let _guard = self.lock();
        let mut chunk = self.load_or_generate(object.chunk())?;
        chunk.upsert_object(object.clone());
        self.store.save_chunk(&self.world_id, &chunk)?;
        self.broadcaster.record_add(&object);
        tracing::debug!("spawned {} {id:?} at ({tile_x}, {tile_y})", object.object_type);
        Ok(object)
    }

    /// Move the object `id`, currently owned by chunk `from`, to a new tile.
    pub fn move_to(
        &self,
        id: ObjectId,
        from: ChunkCoord,
        tile_x: i32,
        tile_y: i32,
    ) -> Result<WorldObject, ObjectError> {
        let _guard = self.lock();
        let mut source = self.load_or_generate(from)?;
        let mut object = source
            .remove_object(id)
            .ok_or(ObjectError::NotFound { id, chunk: from })?;
        object.tile_x = tile_x;
        object.tile_y = tile_y;

        let dest = object.chunk();
        if dest == from {
            source.upsert_object(object.clone());
            self.store.save_chunk(&self.world_id, &source)?;
        } else {
            let mut target = self.load_or_generate(dest)?;
            target.upsert_object(object.clone());
            self.store.save_chunk(&self.world_id, &target)?;
            self.store.save_chunk(&self.world_id, &source)?;
            tracing::debug!("{id:?} moved from chunk {from} to {dest}");
        }
        self.broadcaster.record_move(&object);
        Ok(object)
    }

    /// Remove the object `id` from chunk `from`.
    pub fn remove(&self, id: ObjectId, from: ChunkCoord) -> Result<WorldObject, ObjectError> {
        let _guard = self.lock();
        let mut chunk = self.load_or_generate(from)?;
        let object = chunk
            .remove_object(id)
            .ok_or(ObjectError::NotFound { id, chunk: from })?;
        self.store.save_chunk(&self.world_id, &chunk)?;
        self.broadcaster.record_remove(&object);
        Ok(object)
    }

    /// Read a chunk as clients would receive it.
    pub fn chunk(&self, coord: ChunkCoord) -> Result<ChunkPayload, ObjectError> {
        self.load_or_generate(coord)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.edit_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_or_generate(&self, coord: ChunkCoord) -> Result<ChunkPayload, ObjectError> {
        match self.store.load_chunk(&self.world_id, coord)? {
            Some(chunk) => Ok(chunk),
            None => Ok(self.generator.generate(self.seed, coord)?),
        }
    }
}
