//! Adaptive bitrate streaming core.
//!
//! Chunks of every stream live in a [`MediaChunkQueue`]. The [`Heuristics`]
//! pick the bitrate of each download, the [`Dispatcher`] fetches it and the
//! completion feeds the statistics behind the next decision.

pub mod buffer;
pub mod config;
pub mod errors;
pub mod heuristics;
pub mod network;

pub use buffer::{ChunkState, ChunkTiming, MediaChunk, MediaChunkQueue, MediaType};
pub use config::HeuristicsSettings;
pub use errors::StreamingError;
pub use heuristics::{DownloadReport, Heuristics};
pub use network::{
    Dispatcher, DownloadCompletion, DownloadOutcome, DownloadRequest, HttpTransport, Transport,
    TransportError, UrlGenerator,
};
