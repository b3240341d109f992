use crate::error::PlayerError;
use serde::Serialize;
use serde_with::skip_serializing_none;
use streaming::{ChunkState, DownloadCompletion, DownloadOutcome, MediaType};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    Completed,
    Interrupted,
    TimeLimit,
    Failed,
}

/// Summary of one player session, written as JSON at exit.
#[skip_serializing_none]
#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub streams: Vec<StreamReport>,
}

impl SessionReport {
    pub fn is_failure(&self) -> bool {
        self.end == SessionEnd::Failed
    }

    pub fn total_bytes(&self) -> u64 {
        self.streams.iter().map(|s| s.total_bytes).sum()
    }

    pub fn to_json(&self) -> Result<String, PlayerError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| PlayerError::ReportError(format!("serialize report: {}", e)))
    }

    pub async fn write(&self, path: &str) -> Result<(), PlayerError> {
        let json = self.to_json()?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| PlayerError::ReportError(format!("write {}: {}", path, e)))?;
        debug!("session report saved to {}", path);
        Ok(())
    }
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
pub struct StreamReport {
    pub stream_id: u32,
    pub media_type: MediaType,
    pub bitrate_switches: u32,
    pub stalls: u32,
    pub skipped_chunks: u32,
    pub total_bytes: u64,
    pub final_bitrate: Option<u64>,
    pub chunks: Vec<ChunkRecord>,
}

impl StreamReport {
    pub fn new(stream_id: u32, media_type: MediaType) -> Self {
        Self {
            stream_id,
            media_type,
            bitrate_switches: 0,
            stalls: 0,
            skipped_chunks: 0,
            total_bytes: 0,
            final_bitrate: None,
            chunks: Vec::new(),
        }
    }

    /// Records a finished download; aborted ones leave no trace.
    pub fn record(&mut self, completion: &DownloadCompletion) {
        let (state, bytes, error) = match &completion.outcome {
            DownloadOutcome::Success { bytes } => (ChunkState::Loaded, Some(*bytes), None),
            DownloadOutcome::Failed { message, .. } => (ChunkState::Error, None, Some(message.clone())),
            DownloadOutcome::Aborted => return,
        };

        self.total_bytes += bytes.unwrap_or(0);
        self.chunks.push(ChunkRecord {
            chunk_id: completion.chunk_id,
            bitrate: completion.bitrate,
            bytes,
            download_ms: completion.download_time.as_millis() as u64,
            attempts: completion.attempts,
            state,
            error,
        });
    }
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
pub struct ChunkRecord {
    pub chunk_id: usize,
    pub bitrate: u64,
    pub bytes: Option<u64>,
    pub download_ms: u64,
    pub attempts: u32,
    pub state: ChunkState,
    pub error: Option<String>,
}
