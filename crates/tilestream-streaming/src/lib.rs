//! Chunk streaming: client request scheduling, server dispatch with
//! coalescing, delivery caching, the multi-part transfer codec, and world
//! object delta batching.

pub mod cache;
pub mod codec;
pub mod coordinator;
pub mod deltas;
pub mod dispatcher;
pub mod local_world;
pub mod preload;

pub use cache::ChunkCache;
pub use codec::{ChunkReassembler, CodecError, split_chunk};
pub use coordinator::{ChunkRequestCoordinator, CoordinatorConfig, Priority, Received};
pub use deltas::{ApplyReport, HeldDeltas, WorldObjectDeltaBroadcaster, apply_updates};
pub use dispatcher::{
    DispatchError, DispatcherConfig, MessageSink, RequestOutcome, ServerChunkDispatcher,
};
pub use local_world::{LocalWorld, UpsertOutcome};
pub use preload::{PreloadPlan, RingRadii, plan_rings, plan_urgent};
