//! Fixed-size tile grid carried by every chunk.

use serde::{Deserialize, Serialize};

use crate::coords::{CHUNK_AREA, CHUNK_SIZE};

/// Identifier of a terrain tile kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TileId(pub u16);

impl TileId {
    /// Open water.
    pub const WATER: TileId = TileId(0);
    /// Beach sand.
    pub const SAND: TileId = TileId(1);
    /// Grassland.
    pub const GRASS: TileId = TileId(2);
    /// Bare rock.
    pub const STONE: TileId = TileId(3);
}

/// Error returned when a tile vector does not describe a full chunk.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("tile grid must contain {expected} tiles, got {actual}")]
pub struct TileGridError {
    /// Required tile count.
    pub expected: usize,
    /// Tile count supplied.
    pub actual: usize,
}

/// A `CHUNK_SIZE × CHUNK_SIZE` grid of tiles stored row-major.
///
/// Deserialization checks the length, so a malformed wire or disk payload
/// cannot produce a short grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<TileId>", into = "Vec<TileId>")]
pub struct TileGrid {
    tiles: Vec<TileId>,
}

impl TileGrid {
    /// A grid filled with one tile kind.
    pub fn filled(tile: TileId) -> Self {
        Self {
            tiles: vec![tile; CHUNK_AREA],
        }
    }

    /// Build a grid from a row-major vector of exactly [`CHUNK_AREA`] tiles.
    pub fn from_vec(tiles: Vec<TileId>) -> Result<Self, TileGridError> {
        if tiles.len() != CHUNK_AREA {
            return Err(TileGridError {
                expected: CHUNK_AREA,
                actual: tiles.len(),
            });
        }
        Ok(Self { tiles })
    }

    /// Tile at local coordinates, or `None` outside the chunk.
    pub fn get(&self, local_x: usize, local_y: usize) -> Option<TileId> {
        if local_x >= CHUNK_SIZE || local_y >= CHUNK_SIZE {
            return None;
        }
        self.tiles.get(local_y * CHUNK_SIZE + local_x).copied()
    }

    /// Overwrite the tile at local coordinates. Out-of-range writes are ignored.
    pub fn set(&mut self, local_x: usize, local_y: usize, tile: TileId) {
        if local_x < CHUNK_SIZE && local_y < CHUNK_SIZE {
            self.tiles[local_y * CHUNK_SIZE + local_x] = tile;
        }
    }

    /// Row-major view of all tiles.
    pub fn as_slice(&self) -> &[TileId] {
        &self.tiles
    }
}

impl TryFrom<Vec<TileId>> for TileGrid {
    type Error = TileGridError;

    fn try_from(tiles: Vec<TileId>) -> Result<Self, Self::Error> {
        Self::from_vec(tiles)
    }
}

impl From<TileGrid> for Vec<TileId> {
    fn from(grid: TileGrid) -> Self {
        grid.tiles
    }
}
