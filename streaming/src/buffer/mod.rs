pub mod chunk;
pub mod queue;

pub use chunk::{
    secs_to_ticks, ticks_to_secs, ChunkId, ChunkSnapshot, ChunkState, DownloaderId, MediaChunk,
    MediaType, TICKS_PER_SECOND,
};
pub use queue::{ChunkTiming, MediaChunkQueue};
