use std::{error::Error, fmt};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamingError {
    ConfigError(String),
    /// A chunk id or slot index outside of what the queue can represent.
    OutOfRange(String),
    /// Too many consecutive chunks failed for one stream.
    MissingChunks(String),
    UnknownStream(String),
    /// A failure the download pipeline does not know how to recover from.
    Fatal(String),
}

impl fmt::Display for StreamingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamingError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            StreamingError::OutOfRange(msg) => write!(f, "Out of range: {}", msg),
            StreamingError::MissingChunks(msg) => write!(f, "Missing chunks: {}", msg),
            StreamingError::UnknownStream(msg) => write!(f, "Unknown stream: {}", msg),
            StreamingError::Fatal(msg) => write!(f, "Fatal error: {}", msg),
        }
    }
}

impl Error for StreamingError {}
