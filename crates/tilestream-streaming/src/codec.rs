//! Splitting chunk payloads into transfer parts and putting them back
//! together on the receiving side.
//!
//! Part 0 always carries the tile grid and the first batch of objects; the
//! remaining parts carry further object batches. Parts may arrive in any
//! order and a chunk is complete once `total_parts` distinct parts are held.

use rustc_hash::FxHashMap;
use thiserror::Error;
use tilestream_net::ChunkData;
use tilestream_world::{ChunkCoord, ChunkPayload, TileGrid, WorldObject};

/// Errors raised while reassembling a chunk. The partial set for the
/// affected coordinate is discarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("chunk {coord} announced zero parts")]
    ZeroParts { coord: ChunkCoord },
    #[error("chunk {coord} part {index} is outside 0..{total}")]
    IndexOutOfRange { coord: ChunkCoord, index: u32, total: u32 },
    #[error("chunk {coord} part count changed from {expected} to {got}")]
    InconsistentTotal { coord: ChunkCoord, expected: u32, got: u32 },
    #[error("chunk {coord} part {index} carries tiles; only part 0 may")]
    TilesOnTrailingPart { coord: ChunkCoord, index: u32 },
    #[error("chunk {coord} completed without a tile grid")]
    MissingTiles { coord: ChunkCoord },
}

/// Split `payload` into wire parts of at most `max_objects_per_part` objects.
///
/// A chunk with no objects yields exactly one tiles-only part. A limit of
/// zero is treated as one.
pub fn split_chunk(payload: &ChunkPayload, max_objects_per_part: usize) -> Vec<ChunkData> {
    let per_part = max_objects_per_part.max(1);
    let coord = payload.coord;

    let batches: Vec<&[WorldObject]> = if payload.objects.is_empty() {
        vec![&payload.objects[..]]
    } else {
        payload.objects.chunks(per_part).collect()
    };
    let total_parts = batches.len() as u32;

    batches
        .into_iter()
        .enumerate()
        .map(|(index, objects)| ChunkData {
            x: coord.x,
            y: coord.y,
            tiles: (index == 0).then(|| payload.tiles.clone()),
            objects: objects.to_vec(),
            partial: total_parts > 1,
            part_index: index as u32,
            total_parts,
        })
        .collect()
}

struct PartialChunk {
    total_parts: u32,
    tiles: Option<TileGrid>,
    parts: FxHashMap<u32, Vec<WorldObject>>,
}

impl PartialChunk {
    fn new(total_parts: u32) -> Self {
        Self {
            total_parts,
            tiles: None,
            parts: FxHashMap::default(),
        }
    }

    fn is_complete(&self) -> bool {
        self.parts.len() as u32 == self.total_parts
    }

    fn into_payload(mut self, coord: ChunkCoord) -> Result<ChunkPayload, CodecError> {
        let tiles = self.tiles.take().ok_or(CodecError::MissingTiles { coord })?;
        let mut objects = Vec::new();
        for index in 0..self.total_parts {
            if let Some(batch) = self.parts.remove(&index) {
                objects.extend(batch);
            }
        }
        Ok(ChunkPayload::new(coord, tiles, objects))
    }
}

/// Client-side collector of chunk parts.
#[derive(Default)]
pub struct ChunkReassembler {
    pending: FxHashMap<ChunkCoord, PartialChunk>,
}

impl ChunkReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one part. Returns the complete payload when this part finishes
    /// the chunk, `Ok(None)` while parts are still missing or when the part
    /// is a duplicate.
    pub fn accept(&mut self, part: ChunkData) -> Result<Option<ChunkPayload>, CodecError> {
        let coord = part.coord();
        let ChunkData {
            tiles,
            objects,
            part_index,
            total_parts,
            ..
        } = part;

        if total_parts == 0 {
            self.pending.remove(&coord);
            return Err(CodecError::ZeroParts { coord });
        }
        if part_index >= total_parts {
            self.pending.remove(&coord);
            return Err(CodecError::IndexOutOfRange {
                coord,
                index: part_index,
                total: total_parts,
            });
        }
        if part_index != 0 && tiles.is_some() {
            self.pending.remove(&coord);
            return Err(CodecError::TilesOnTrailingPart {
                coord,
                index: part_index,
            });
        }

        let entry = self
            .pending
            .entry(coord)
            .or_insert_with(|| PartialChunk::new(total_parts));
        if entry.total_parts != total_parts {
            let expected = entry.total_parts;
            self.pending.remove(&coord);
            return Err(CodecError::InconsistentTotal {
                coord,
                expected,
                got: total_parts,
            });
        }
        if entry.parts.contains_key(&part_index) {
            tracing::debug!("duplicate part {part_index} of chunk {coord} ignored");
            return Ok(None);
        }

        if part_index == 0 {
            entry.tiles = tiles;
        }
        entry.parts.insert(part_index, objects);

        if !entry.is_complete() {
            return Ok(None);
        }
        match self.pending.remove(&coord) {
            Some(complete) => complete.into_payload(coord).map(Some),
            None => Ok(None),
        }
    }

    /// Drop any partial set for `coord`.
    pub fn discard(&mut self, coord: ChunkCoord) {
        self.pending.remove(&coord);
    }

    /// Drop all partial sets, e.g. on disconnect.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Number of chunks with some but not all parts received.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
