//! World objects placed on tiles and the registry of object types.
//!
//! Objects are owned by the chunk containing their tile. The registry is
//! built once at startup and shared by the generator and the delta path,
//! which resolves type names through it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coords::ChunkCoord;

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// Stable identifier of a world object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Bit set on ids assigned by terrain generation, so they never collide
    /// with ids handed out at runtime.
    pub const GENERATED_BIT: u64 = 1 << 63;

    /// Whether this id was produced by terrain generation.
    pub fn is_generated(&self) -> bool {
        self.0 & Self::GENERATED_BIT != 0
    }
}

/// A typed object occupying a tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldObject {
    /// Unique id.
    pub id: ObjectId,
    /// World tile column.
    pub tile_x: i32,
    /// World tile row.
    pub tile_y: i32,
    /// Registered type name, e.g. `"tree"`.
    pub object_type: String,
    /// Whether entities collide with this object.
    pub collidable: bool,
    /// Milliseconds since the Unix epoch at spawn; `0` for generated objects.
    pub spawned_at_ms: u64,
}

impl WorldObject {
    /// The chunk that owns this object.
    pub fn chunk(&self) -> ChunkCoord {
        ChunkCoord::from_tile(self.tile_x, self.tile_y)
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Descriptor for a kind of world object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectType {
    /// Unique name used on the wire.
    pub name: String,
    /// Whether instances block movement.
    pub collidable: bool,
    /// Width and height in tiles.
    pub footprint: (u8, u8),
}

impl ObjectType {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, collidable: bool, footprint: (u8, u8)) -> Self {
        Self {
            name: name.into(),
            collidable,
            footprint,
        }
    }
}

/// Errors raised while registering object types.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A type with the same name is already registered.
    #[error("duplicate object type name: {0}")]
    DuplicateName(String),
}

/// Name → [`ObjectType`] lookup.
#[derive(Debug, Clone)]
pub struct ObjectTypeRegistry {
    types: HashMap<String, ObjectType>,
}

impl ObjectTypeRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            types: HashMap::new(),
        }
    }

    /// A registry holding the built-in types placed by terrain generation.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        for def in [
            ObjectType::new("tree", true, (1, 1)),
            ObjectType::new("rock", true, (1, 1)),
            ObjectType::new("bush", false, (1, 1)),
            ObjectType::new("chest", true, (1, 1)),
        ] {
            registry.types.insert(def.name.clone(), def);
        }
        registry
    }

    /// Register a new type.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateName`] if the name is taken.
    pub fn register(&mut self, def: ObjectType) -> Result<(), RegistryError> {
        if self.types.contains_key(&def.name) {
            return Err(RegistryError::DuplicateName(def.name));
        }
        self.types.insert(def.name.clone(), def);
        Ok(())
    }

    /// Look up a type by name.
    pub fn get(&self, name: &str) -> Option<&ObjectType> {
        self.types.get(name)
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether no types are registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Default for ObjectTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
