//! Terrain generation interface and a Perlin-noise reference generator.
//!
//! Generation must be a pure function of `(seed, coord)`: the server may
//! regenerate a chunk that was never saved, and every client has to see the
//! same result.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use noise::{NoiseFn, Perlin};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::coords::{CHUNK_SIZE, ChunkCoord};
use crate::object::{ObjectId, ObjectTypeRegistry, WorldObject};
use crate::payload::ChunkPayload;
use crate::tiles::{TileGrid, TileId};

/// Errors produced by a [`TerrainGenerator`].
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The chunk lies beyond the world border or the `i32` tile range.
    #[error("chunk {0} lies outside the world")]
    OutOfBounds(ChunkCoord),
    /// Any other generator failure.
    #[error("generation failed for chunk {coord}: {reason}")]
    Failed { coord: ChunkCoord, reason: String },
}

/// Produces the initial tiles and objects of a chunk.
pub trait TerrainGenerator: Send + Sync {
    /// Generate the chunk at `coord` for the world `seed`.
    fn generate(&self, seed: u64, coord: ChunkCoord) -> Result<ChunkPayload, GenerationError>;
}

// ---------------------------------------------------------------------------
// Seed derivation
// ---------------------------------------------------------------------------

/// Combine the world seed with a chunk coordinate into a per-chunk seed.
pub fn derive_chunk_seed(world_seed: u64, coord: ChunkCoord) -> u64 {
    let mut hasher = DefaultHasher::new();
    world_seed.hash(&mut hasher);
    coord.x.hash(&mut hasher);
    coord.y.hash(&mut hasher);
    hasher.finish()
}

/// Deterministic RNG for one chunk.
pub fn chunk_rng(world_seed: u64, coord: ChunkCoord) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(derive_chunk_seed(world_seed, coord))
}

/// Stable id for an object placed by generation at a world tile.
pub fn generated_object_id(world_seed: u64, tile_x: i32, tile_y: i32) -> ObjectId {
    let mut hasher = DefaultHasher::new();
    world_seed.hash(&mut hasher);
    tile_x.hash(&mut hasher);
    tile_y.hash(&mut hasher);
    ObjectId(hasher.finish() | ObjectId::GENERATED_BIT)
}

// ---------------------------------------------------------------------------
// Noise generator
// ---------------------------------------------------------------------------

/// Tunables for [`NoiseTerrainGenerator`].
#[derive(Clone, Debug)]
pub struct TerrainParams {
    /// Noise frequency in cycles per tile.
    pub frequency: f64,
    /// Heights below this are water.
    pub water_level: f64,
    /// Heights below this (and above water) are sand.
    pub sand_level: f64,
    /// Heights above this are stone.
    pub stone_level: f64,
    /// Chance of a tree on a grass tile.
    pub tree_density: f64,
    /// Chance of a bush on a grass tile without a tree.
    pub bush_density: f64,
    /// Chance of a rock on a stone tile.
    pub rock_density: f64,
    /// Chebyshev radius in chunks beyond which generation fails; `None` is unbounded.
    pub border_radius: Option<u32>,
}

impl Default for TerrainParams {
    fn default() -> Self {
        Self {
            frequency: 0.035,
            water_level: -0.3,
            sand_level: -0.2,
            stone_level: 0.4,
            tree_density: 0.06,
            bush_density: 0.03,
            rock_density: 0.08,
            border_radius: None,
        }
    }
}

/// Perlin heightmap terrain with seeded object scattering.
pub struct NoiseTerrainGenerator {
    params: TerrainParams,
    registry: ObjectTypeRegistry,
}

impl NoiseTerrainGenerator {
    pub fn new(params: TerrainParams) -> Self {
        Self {
            params,
            registry: ObjectTypeRegistry::new(),
        }
    }

    /// Current parameters.
    pub fn params(&self) -> &TerrainParams {
        &self.params
    }

    fn classify(&self, height: f64) -> TileId {
        if height < self.params.water_level {
            TileId::WATER
        } else if height < self.params.sand_level {
            TileId::SAND
        } else if height > self.params.stone_level {
            TileId::STONE
        } else {
            TileId::GRASS
        }
    }

    fn place(&self, seed: u64, tile_x: i32, tile_y: i32, type_name: &str) -> Option<WorldObject> {
        let def = self.registry.get(type_name)?;
        Some(WorldObject {
            id: generated_object_id(seed, tile_x, tile_y),
            tile_x,
            tile_y,
            object_type: def.name.clone(),
            collidable: def.collidable,
            spawned_at_ms: 0,
        })
    }
}

impl Default for NoiseTerrainGenerator {
    fn default() -> Self {
        Self::new(TerrainParams::default())
    }
}

impl TerrainGenerator for NoiseTerrainGenerator {
    fn generate(&self, seed: u64, coord: ChunkCoord) -> Result<ChunkPayload, GenerationError> {
        if let Some(radius) = self.params.border_radius
            && coord.ring_distance(&ChunkCoord::new(0, 0)) > radius
        {
            return Err(GenerationError::OutOfBounds(coord));
        }

        let perlin = Perlin::new((seed ^ (seed >> 32)) as u32);
        let mut rng = chunk_rng(seed, coord);
        let (origin_x, origin_y) = coord
            .checked_origin_tile()
            .ok_or(GenerationError::OutOfBounds(coord))?;
        let mut tiles = TileGrid::filled(TileId::WATER);
        let mut objects = Vec::new();

        for ly in 0..CHUNK_SIZE {
            for lx in 0..CHUNK_SIZE {
                let tx = origin_x + lx as i32;
                let ty = origin_y + ly as i32;
                let height = perlin.get([
                    f64::from(tx) * self.params.frequency,
                    f64::from(ty) * self.params.frequency,
                ]);
                let tile = self.classify(height);
                tiles.set(lx, ly, tile);

                // One roll per tile keeps placement stable if densities change.
                let roll: f64 = rng.random();
                let placed = match tile {
                    TileId::GRASS if roll < self.params.tree_density => self.place(seed, tx, ty, "tree"),
                    TileId::GRASS if roll < self.params.tree_density + self.params.bush_density => {
                        self.place(seed, tx, ty, "bush")
                    }
                    TileId::STONE if roll < self.params.rock_density => self.place(seed, tx, ty, "rock"),
                    _ => None,
                };
                objects.extend(placed);
            }
        }

        Ok(ChunkPayload::new(coord, tiles, objects))
    }
}
