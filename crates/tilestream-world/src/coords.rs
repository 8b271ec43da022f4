//! Chunk coordinates and tile-to-chunk conversion.

use serde::{Deserialize, Serialize};

/// Edge length of a chunk in tiles.
pub const CHUNK_SIZE: usize = 16;

/// Number of tiles in one chunk.
pub const CHUNK_AREA: usize = CHUNK_SIZE * CHUNK_SIZE;

/// Integer address of a chunk on the unbounded world grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkCoord {
    /// Chunk column.
    pub x: i32,
    /// Chunk row.
    pub y: i32,
}

impl ChunkCoord {
    /// Create a chunk coordinate.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Chunk containing the given tile. Uses floor division so tile `-1`
    /// belongs to chunk `-1`, not chunk `0`.
    pub fn from_tile(tile_x: i32, tile_y: i32) -> Self {
        let size = CHUNK_SIZE as i32;
        Self {
            x: tile_x.div_euclid(size),
            y: tile_y.div_euclid(size),
        }
    }

    /// World tile coordinate of this chunk's top-left tile. Saturates for
    /// chunks whose tiles do not fit in `i32`; see [`Self::checked_origin_tile`].
    pub fn origin_tile(&self) -> (i32, i32) {
        let size = CHUNK_SIZE as i32;
        (self.x.saturating_mul(size), self.y.saturating_mul(size))
    }

    /// Like [`Self::origin_tile`], but `None` when any tile of the chunk lies
    /// outside the `i32` tile range.
    pub fn checked_origin_tile(&self) -> Option<(i32, i32)> {
        let size = CHUNK_SIZE as i32;
        Some((self.x.checked_mul(size)?, self.y.checked_mul(size)?))
    }

    /// Whether every tile of this chunk has an `i32` tile coordinate.
    pub fn is_addressable(&self) -> bool {
        self.checked_origin_tile().is_some()
    }

    /// Whether the given world tile lies inside this chunk.
    pub fn contains_tile(&self, tile_x: i32, tile_y: i32) -> bool {
        Self::from_tile(tile_x, tile_y) == *self
    }

    /// Chebyshev distance in chunks. Rings of equal distance form squares.
    pub fn ring_distance(&self, other: &ChunkCoord) -> u32 {
        let dx = (i64::from(self.x) - i64::from(other.x)).unsigned_abs();
        let dy = (i64::from(self.y) - i64::from(other.y)).unsigned_abs();
        dx.max(dy).min(u64::from(u32::MAX)) as u32
    }

    /// Squared Euclidean distance in chunks, used to order requests within a ring.
    pub fn distance_sq(&self, other: &ChunkCoord) -> u64 {
        let dx = (i64::from(self.x) - i64::from(other.x)).unsigned_abs();
        let dy = (i64::from(self.y) - i64::from(other.y)).unsigned_abs();
        dx.saturating_mul(dx).saturating_add(dy.saturating_mul(dy))
    }
}

impl std::fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}
