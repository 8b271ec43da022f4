//! Tile world data model and the collaborator interfaces used by chunk
//! streaming: terrain generation and chunk persistence.

pub mod coords;
pub mod object;
pub mod payload;
pub mod store;
pub mod terrain;
pub mod tiles;

pub use coords::{CHUNK_AREA, CHUNK_SIZE, ChunkCoord};
pub use object::{ObjectId, ObjectType, ObjectTypeRegistry, RegistryError, WorldObject};
pub use payload::ChunkPayload;
pub use store::{DirWorldStore, MemoryWorldStore, StoreError, WorldStore};
pub use terrain::{GenerationError, NoiseTerrainGenerator, TerrainGenerator, TerrainParams};
pub use tiles::{TileGrid, TileGridError, TileId};
