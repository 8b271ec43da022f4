//! TCP networking: wire messages, serialization, compression, framing, and
//! connection lifecycle for the Tilestream server and client.

pub mod compression;
pub mod framing;
pub mod messages;
pub mod tcp_client;
pub mod tcp_server;
pub mod wire;

pub use compression::{CompressionConfig, CompressionError};
pub use framing::{FrameConfig, FrameError, read_frame, write_frame};
pub use messages::{
    ChunkData, ChunkFailed, ChunkRelease, ChunkRequest, ChunkRequestAck, Message, MessageError,
    PROTOCOL_VERSION, Ping, Pong, WorldObjectUpdate, WorldObjectsUpdate,
};
pub use tcp_client::{
    ClientClosed, ClientConfig, ConnectionState, ConnectionStateWatch, GameClient, unix_millis,
};
pub use tcp_server::{
    ConnectionId, ConnectionLimitReached, ConnectionMap, GameServer, IdGenerator, SendError,
    ServerConfig, ServerEvent,
};
pub use wire::{WireConfig, WireError, decode_message, encode_message, recv_message, send_message};
