//! Network message types and serialization.
//!
//! All messages are serialized with [`postcard`] and prefixed with a protocol
//! version byte. Use [`serialize_message`] and [`deserialize_message`] for
//! encoding/decoding.

use serde::{Deserialize, Serialize};
use tilestream_world::{ChunkCoord, ObjectId, TileGrid, WorldObject};

/// Current wire-protocol version. Prepended to every serialized message.
pub const PROTOCOL_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// Top-level enum
// ---------------------------------------------------------------------------

/// Top-level network message. The enum discriminant is the type tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    // --- Chunks ---
    /// Client asks for the full contents of a chunk.
    ChunkRequest(ChunkRequest),
    /// Server sends one part of a chunk.
    ChunkData(ChunkData),
    /// Server has finished answering a chunk request.
    ChunkRequestAck(ChunkRequestAck),
    /// Server could not produce a chunk.
    ChunkFailed(ChunkFailed),
    /// Client unloaded a chunk it previously received.
    ChunkRelease(ChunkRelease),

    // --- Objects ---
    /// Server sends a batch of object changes since the last tick.
    WorldObjectsUpdate(WorldObjectsUpdate),

    // --- System ---
    /// Heartbeat ping. Sender expects a Pong in response.
    Ping(Ping),
    /// Heartbeat pong. Response to a Ping.
    Pong(Pong),
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Request for a chunk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkRequest {
    /// Chunk column.
    pub x: i32,
    /// Chunk row.
    pub y: i32,
    /// Client wall-clock time of the request in milliseconds.
    pub timestamp_ms: u64,
}

impl ChunkRequest {
    pub fn coord(&self) -> ChunkCoord {
        ChunkCoord::new(self.x, self.y)
    }
}

/// One part of a chunk transfer.
///
/// Only part 0 carries tiles. A chunk is complete once `total_parts`
/// distinct parts have arrived.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkData {
    /// Chunk column.
    pub x: i32,
    /// Chunk row.
    pub y: i32,
    /// Tile grid; present on part 0 only.
    pub tiles: Option<TileGrid>,
    /// Objects carried by this part.
    pub objects: Vec<WorldObject>,
    /// Whether the chunk was split into more than one part.
    pub partial: bool,
    /// Zero-based index of this part.
    pub part_index: u32,
    /// Number of parts making up the chunk.
    pub total_parts: u32,
}

impl ChunkData {
    pub fn coord(&self) -> ChunkCoord {
        ChunkCoord::new(self.x, self.y)
    }
}

/// All parts of a chunk have been sent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkRequestAck {
    pub x: i32,
    pub y: i32,
}

/// Chunk production failed on the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkFailed {
    pub x: i32,
    pub y: i32,
    /// Human-readable failure reason.
    pub reason: String,
}

/// Client dropped its copy of a chunk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkRelease {
    pub x: i32,
    pub y: i32,
}

/// One object change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorldObjectUpdate {
    /// Object the change applies to.
    pub object_id: ObjectId,
    /// New tile column (last known column when removed).
    pub tile_x: i32,
    /// New tile row (last known row when removed).
    pub tile_y: i32,
    /// Registered type name.
    pub object_type: String,
    /// The object was removed from the world.
    pub removed: bool,
}

/// Batch of object changes in recording order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorldObjectsUpdate {
    pub entries: Vec<WorldObjectUpdate>,
}

/// Heartbeat ping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ping {
    /// Sender timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Sequence number.
    pub sequence: u32,
}

/// Heartbeat pong (response to [`Ping`]).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pong {
    /// Echoed timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Echoed sequence number.
    pub sequence: u32,
}

impl From<Ping> for Pong {
    fn from(ping: Ping) -> Self {
        Self {
            timestamp_ms: ping.timestamp_ms,
            sequence: ping.sequence,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during message deserialization.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The payload was empty (no version byte).
    #[error("empty payload, no version byte")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Postcard deserialization failed.
    #[error("deserialization error: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

/// Serialize a [`Message`] into a versioned binary payload.
///
/// Wire format: `[version: u8] [postcard-encoded Message]`
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>, postcard::Error> {
    let body = postcard::to_allocvec(msg)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Deserialize a versioned binary payload into a [`Message`].
pub fn deserialize_message(data: &[u8]) -> Result<Message, MessageError> {
    let (&version, body) = data.split_first().ok_or(MessageError::EmptyPayload)?;
    if version != PROTOCOL_VERSION {
        return Err(MessageError::UnsupportedVersion(version));
    }
    Ok(postcard::from_bytes(body)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tilestream_world::TileId;

    fn roundtrip(msg: Message) {
        let bytes = serialize_message(&msg).unwrap();
        let decoded = deserialize_message(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_chunk_data_with_tiles_roundtrip() {
        roundtrip(Message::ChunkData(ChunkData {
            x: -4,
            y: 9,
            tiles: Some(TileGrid::filled(TileId::GRASS)),
            objects: vec![WorldObject {
                id: ObjectId(77),
                tile_x: -60,
                tile_y: 150,
                object_type: "tree".into(),
                collidable: true,
                spawned_at_ms: 0,
            }],
            partial: true,
            part_index: 0,
            total_parts: 2,
        }));
    }

    #[test]
    fn test_failure_and_release_roundtrip() {
        roundtrip(Message::ChunkFailed(ChunkFailed {
            x: 1,
            y: 2,
            reason: "disk full".into(),
        }));
        roundtrip(Message::ChunkRelease(ChunkRelease { x: -1, y: -1 }));
    }

    #[test]
    fn test_object_update_batch_keeps_order() {
        let entries: Vec<_> = (0..3)
            .map(|i| WorldObjectUpdate {
                object_id: ObjectId(i),
                tile_x: i as i32,
                tile_y: 0,
                object_type: "rock".into(),
                removed: i == 2,
            })
            .collect();
        let msg = Message::WorldObjectsUpdate(WorldObjectsUpdate {
            entries: entries.clone(),
        });
        let bytes = serialize_message(&msg).unwrap();
        match deserialize_message(&bytes).unwrap() {
            Message::WorldObjectsUpdate(update) => assert_eq!(update.entries, entries),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_chunk_request_is_compact() {
        let msg = Message::ChunkRequest(ChunkRequest {
            x: 3,
            y: -3,
            timestamp_ms: 1_700_000_000_000,
        });
        let bytes = serialize_message(&msg).unwrap();
        assert!(bytes.len() < 16, "ChunkRequest should be compact, got {} bytes", bytes.len());
    }

    #[test]
    fn test_pong_echoes_ping() {
        let ping = Ping {
            timestamp_ms: 55,
            sequence: 9,
        };
        let pong = Pong::from(ping);
        assert_eq!(pong.timestamp_ms, 55);
        assert_eq!(pong.sequence, 9);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let msg = Message::Ping(Ping {
            timestamp_ms: 0,
            sequence: 0,
        });
        let mut bytes = serialize_message(&msg).unwrap();
        bytes[0] = 255;
        let result = deserialize_message(&bytes);
        assert!(matches!(result, Err(MessageError::UnsupportedVersion(255))));
    }

    #[test]
    fn test_empty_payload_rejected() {
        let result = deserialize_message(&[]);
        assert!(matches!(result, Err(MessageError::EmptyPayload)));
    }

    #[test]
    fn test_short_tile_grid_rejected() {
        // Hand-build a ChunkData whose tile vector is too short.
        #[derive(Serialize)]
        enum Fake {
            #[allow(dead_code)]
            ChunkRequest(ChunkRequest),
            ChunkData {
                x: i32,
                y: i32,
                tiles: Option<Vec<u16>>,
                objects: Vec<WorldObject>,
                partial: bool,
                part_index: u32,
                total_parts: u32,
            },
        }
        let body = postcard::to_allocvec(&Fake::ChunkData {
            x: 0,
            y: 0,
            tiles: Some(vec![1, 2, 3]),
            objects: vec![],
            partial: false,
            part_index: 0,
            total_parts: 1,
        })
        .unwrap();
        let mut bytes = vec![PROTOCOL_VERSION];
        bytes.extend_from_slice(&body);
        assert!(matches!(
            deserialize_message(&bytes),
            Err(MessageError::Postcard(_))
        ));
    }
}
