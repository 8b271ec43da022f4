//! Chunk persistence: the [`WorldStore`] interface plus an in-memory store
//! and a directory-backed store.
//!
//! ## On-disk layout
//!
//! `<root>/<world_id>/<x>_<y>.tsck`, each file:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | Magic bytes `"TSCK"` |
//! | 4 | 1 | Format version (`u8`, currently 1) |
//! | 5 | N | LZ4 block (size-prepended) of the postcard-encoded [`ChunkPayload`] |

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use thiserror::Error;

use crate::coords::ChunkCoord;
use crate::payload::ChunkPayload;

/// Magic bytes identifying a chunk file.
const MAGIC: [u8; 4] = *b"TSCK";

/// Current chunk file format version.
const FORMAT_VERSION: u8 = 1;

/// Errors from a [`WorldStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("decompression error: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),
    #[error("invalid magic bytes")]
    InvalidMagic,
    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u8),
    /// The file decoded to a different chunk than its name says.
    #[error("stored chunk {found} does not match requested {expected}")]
    CoordMismatch {
        expected: ChunkCoord,
        found: ChunkCoord,
    },
    /// World ids become directory names and may not escape the store root.
    #[error("invalid world id: {0:?}")]
    InvalidWorldId(String),
}

/// Persistent storage for generated and modified chunks.
pub trait WorldStore: Send + Sync {
    /// Load a previously saved chunk, or `Ok(None)` if it was never saved.
    fn load_chunk(&self, world_id: &str, coord: ChunkCoord) -> Result<Option<ChunkPayload>, StoreError>;

    /// Persist a chunk, replacing any earlier version.
    fn save_chunk(&self, world_id: &str, payload: &ChunkPayload) -> Result<(), StoreError>;

    /// Persist a freshly generated chunk unless a version is already stored.
    /// Returns `false` when an existing version was kept.
    ///
    /// The default is not atomic; stores shared between writers override it.
    fn save_chunk_if_absent(&self, world_id: &str, payload: &ChunkPayload) -> Result<bool, StoreError> {
        if self.load_chunk(world_id, payload.coord)?.is_some() {
            return Ok(false);
        }
        self.save_chunk(world_id, payload)?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Store that keeps chunks in memory. Used by tests and throwaway worlds.
#[derive(Default)]
pub struct MemoryWorldStore {
    chunks: DashMap<(String, ChunkCoord), ChunkPayload>,
    saves: AtomicU64,
}

impl MemoryWorldStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored chunks across all worlds.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total `save_chunk` calls.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }
}

impl WorldStore for MemoryWorldStore {
    fn load_chunk(&self, world_id: &str, coord: ChunkCoord) -> Result<Option<ChunkPayload>, StoreError> {
        Ok(self
            .chunks
            .get(&(world_id.to_string(), coord))
            .map(|entry| entry.value().clone()))
    }

    fn save_chunk(&self, world_id: &str, payload: &ChunkPayload) -> Result<(), StoreError> {
        self.chunks
            .insert((world_id.to_string(), payload.coord), payload.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn save_chunk_if_absent(&self, world_id: &str, payload: &ChunkPayload) -> Result<bool, StoreError> {
        match self.chunks.entry((world_id.to_string(), payload.coord)) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(payload.clone());
                self.saves.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// Store that writes one compressed file per chunk under a root directory.
pub struct DirWorldStore {
    root: PathBuf,
}

impl DirWorldStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory holding one subdirectory per world.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn world_dir(&self, world_id: &str) -> Result<PathBuf, StoreError> {
        if world_id.is_empty()
            || world_id == "."
            || world_id.contains("..")
            || world_id.contains(['/', '\\'])
        {
            return Err(StoreError::InvalidWorldId(world_id.to_string()));
        }
        Ok(self.root.join(world_id))
    }

    fn chunk_path(&self, world_id: &str, coord: ChunkCoord) -> Result<PathBuf, StoreError> {
        Ok(self
            .world_dir(world_id)?
            .join(format!("{}_{}.tsck", coord.x, coord.y)))
    }
}

/// Per-thread scratch file next to `path`, so concurrent writers never share one.
fn tmp_path(path: &Path) -> PathBuf {
    let thread = format!("{:?}", std::thread::current().id());
    let thread: String = thread.chars().filter(char::is_ascii_digit).collect();
    path.with_extension(format!("tsck.{thread}.tmp"))
}

/// Encode a payload into the chunk file format.
pub fn encode_chunk_file(payload: &ChunkPayload) -> Result<Vec<u8>, StoreError> {
    let body = postcard::to_allocvec(payload)?;
    let compressed = lz4_flex::compress_prepend_size(&body);
    let mut buf = Vec::with_capacity(MAGIC.len() + 1 + compressed.len());
    buf.extend_from_slice(&MAGIC);
    buf.push(FORMAT_VERSION);
    buf.extend_from_slice(&compressed);
    Ok(buf)
}

/// Decode a chunk file produced by [`encode_chunk_file`].
pub fn decode_chunk_file(data: &[u8]) -> Result<ChunkPayload, StoreError> {
    if data.len() < MAGIC.len() || data[..MAGIC.len()] != MAGIC {
        return Err(StoreError::InvalidMagic);
    }
    let version = *data.get(MAGIC.len()).ok_or(StoreError::UnsupportedVersion(0))?;
    if version != FORMAT_VERSION {
        return Err(StoreError::UnsupportedVersion(version));
    }
    let body = lz4_flex::decompress_size_prepended(&data[MAGIC.len() + 1..])?;
    Ok(postcard::from_bytes(&body)?)
}

impl WorldStore for DirWorldStore {
    fn load_chunk(&self, world_id: &str, coord: ChunkCoord) -> Result<Option<ChunkPayload>, StoreError> {
        let path = self.chunk_path(world_id, coord)?;
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let payload = decode_chunk_file(&data)?;
        if payload.coord != coord {
            return Err(StoreError::CoordMismatch {
                expected: coord,
                found: payload.coord,
            });
        }
        Ok(Some(payload))
    }

    fn save_chunk(&self, world_id: &str, payload: &ChunkPayload) -> Result<(), StoreError> {
        let path = self.chunk_path(world_id, payload.coord)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = encode_chunk_file(payload)?;

        // Write then rename so a crash never leaves a torn chunk file.
        let tmp = tmp_path(&path);
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, &path)?;
        tracing::trace!("saved chunk {} for world {world_id}", payload.coord);
        Ok(())
    }

    fn save_chunk_if_absent(&self, world_id: &str, payload: &ChunkPayload) -> Result<bool, StoreError> {
        let path = self.chunk_path(world_id, payload.coord)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = encode_chunk_file(payload)?;

        // hard_link fails if the target exists, which makes the check atomic.
        let tmp = tmp_path(&path);
        std::fs::write(&tmp, &data)?;
        let linked = std::fs::hard_link(&tmp, &path);
        let _ = std::fs::remove_file(&tmp);
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
