use std::{error::Error, fmt};
use streaming::StreamingError;

#[derive(Debug)]
pub enum PlayerError {
    ConfigError(String),
    RuntimeError(String),
    StreamError(String),
    DownloadError(String),
    ReportError(String),
}

impl fmt::Display for PlayerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            PlayerError::RuntimeError(msg) => write!(f, "Runtime error: {}", msg),
            PlayerError::StreamError(msg) => write!(f, "Stream error: {}", msg),
            PlayerError::DownloadError(msg) => write!(f, "Download error: {}", msg),
            PlayerError::ReportError(msg) => write!(f, "Report error: {}", msg),
        }
    }
}

impl Error for PlayerError {}

impl From<StreamingError> for PlayerError {
    fn from(e: StreamingError) -> Self {
        match e {
            StreamingError::ConfigError(msg) => PlayerError::ConfigError(msg),
            StreamingError::Fatal(msg) => PlayerError::DownloadError(msg),
            e => PlayerError::StreamError(e.to_string()),
        }
    }
}
