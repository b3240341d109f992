use async_trait::async_trait;
use bytes::Bytes;
use std::{error::Error, fmt};

pub mod downloader;
pub mod http;
pub mod url;

pub use downloader::{
    CompletionCallback, DispatchLoop, Dispatcher, DownloadCompletion, DownloadOutcome,
    DownloadRequest, Downloader, DownloaderState, InstanceId, MAX_ATTEMPTS,
};
pub use http::HttpTransport;
pub use url::{TemplateUrlGenerator, UrlGenerator};

#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    InvalidUrl(String),
    ConnectError(String),
    StatusError(u16),
    BodyError(String),
    Timeout(String),
    Unexpected(String),
}

impl TransportError {
    /// Failures worth another attempt. Anything else is final on the
    /// first occurrence.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectError(_)
                | TransportError::StatusError(_)
                | TransportError::BodyError(_)
                | TransportError::Timeout(_)
        )
    }

    /// Failures that say something is wrong with the client itself rather
    /// than with the network.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Unexpected(_))
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::InvalidUrl(msg) => write!(f, "Invalid url: {}", msg),
            TransportError::ConnectError(msg) => write!(f, "Connect error: {}", msg),
            TransportError::StatusError(code) => write!(f, "Unexpected status: {}", code),
            TransportError::BodyError(msg) => write!(f, "Body error: {}", msg),
            TransportError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            TransportError::Unexpected(msg) => write!(f, "Unexpected error: {}", msg),
        }
    }
}

impl Error for TransportError {}

/// Fetches the body of a URL.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<Bytes, TransportError>;
}
