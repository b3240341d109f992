use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::trace;

/// Presentation time unit: 100 ns.
pub const TICKS_PER_SECOND: u64 = 10_000_000;

pub type ChunkId = usize;
pub type DownloaderId = u64;

pub fn ticks_to_secs(ticks: u64) -> f64 {
    ticks as f64 / TICKS_PER_SECOND as f64
}

pub fn secs_to_ticks(secs: f64) -> u64 {
    (secs.max(0.0) * TICKS_PER_SECOND as f64).round() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    Pending,
    Downloading,
    Loaded,
    Parsed,
    Error,
}

impl ChunkState {
    /// Whether the chunk holds its bytes.
    pub fn is_downloaded(self) -> bool {
        matches!(self, ChunkState::Loaded | ChunkState::Parsed)
    }
}

/// Point-in-time copy of a chunk's mutable fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSnapshot {
    pub state: ChunkState,
    pub bitrate: u64,
    pub length: u64,
    pub current_offset: u64,
    pub duration_left: u64,
    pub downloader: Option<DownloaderId>,
    pub error_message: Option<String>,
}

#[derive(Debug)]
struct ChunkInner {
    state: ChunkState,
    bitrate: u64,
    data: Option<Bytes>,
    length: u64,
    current_offset: u64,
    duration_left: u64,
    error_message: Option<String>,
    downloader: Option<DownloaderId>,
    started_at: Option<Instant>,
    completed_at: Option<Instant>,
}

impl ChunkInner {
    fn new(duration: u64) -> Self {
        Self {
            state: ChunkState::Pending,
            bitrate: 0,
            data: None,
            length: 0,
            current_offset: 0,
            duration_left: duration,
            error_message: None,
            downloader: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// One time-addressable piece of a stream.
///
/// The identity fields never change. Everything else sits behind the chunk's
/// own lock, which also guards the downloader claim: a chunk is downloaded by
/// at most one downloader at a time.
#[derive(Debug)]
pub struct MediaChunk {
    pub id: ChunkId,
    pub stream_id: u32,
    pub media_type: MediaType,
    pub start_time: u64,
    pub duration: u64,
    inner: Mutex<ChunkInner>,
}

impl MediaChunk {
    pub fn new(
        id: ChunkId,
        stream_id: u32,
        media_type: MediaType,
        start_time: u64,
        duration: u64,
    ) -> Self {
        Self {
            id,
            stream_id,
            media_type,
            start_time,
            duration,
            inner: Mutex::new(ChunkInner::new(duration)),
        }
    }

    /// A fresh pending chunk covering the same time range.
    pub fn replacement(&self) -> Self {
        self.restamped(self.stream_id)
    }

    /// A fresh pending chunk covering the same time range of another stream.
    pub fn restamped(&self, stream_id: u32) -> Self {
        Self::new(
            self.id,
            stream_id,
            self.media_type,
            self.start_time,
            self.duration,
        )
    }

    pub fn end_time(&self) -> u64 {
        self.start_time + self.duration
    }

    /// Claims the chunk for `downloader`. Only a pending or failed chunk
    /// nobody else holds can be claimed.
    pub fn try_claim(&self, downloader: DownloaderId, bitrate: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.downloader.is_some()
            || !matches!(inner.state, ChunkState::Pending | ChunkState::Error)
        {
            return false;
        }

        inner.downloader = Some(downloader);
        inner.state = ChunkState::Downloading;
        inner.bitrate = bitrate;
        inner.error_message = None;
        inner.started_at = Some(Instant::now());
        inner.completed_at = None;
        true
    }

    pub fn is_claimed_by(&self, downloader: DownloaderId) -> bool {
        self.inner.lock().downloader == Some(downloader)
    }

    /// Stores downloaded bytes if `downloader` still holds the claim.
    pub fn install(&self, downloader: DownloaderId, data: Bytes) -> bool {
        let mut inner = self.inner.lock();
        if inner.downloader != Some(downloader) {
            trace!("chunk {}: claim lost, dropping {} bytes", self.id, data.len());
            return false;
        }

        inner.length = data.len() as u64;
        inner.data = Some(data);
        inner.current_offset = 0;
        inner.duration_left = self.duration;
        inner.state = ChunkState::Loaded;
        inner.downloader = None;
        inner.completed_at = Some(Instant::now());
        true
    }

    /// Marks the download as failed if `downloader` still holds the claim.
    pub fn fail(&self, downloader: DownloaderId, message: String) -> bool {
        let mut inner = self.inner.lock();
        if inner.downloader != Some(downloader) {
            return false;
        }

        inner.state = ChunkState::Error;
        inner.error_message = Some(message);
        inner.data = None;
        inner.length = 0;
        inner.downloader = None;
        inner.completed_at = Some(Instant::now());
        true
    }

    /// Gives up the claim without a result; the chunk becomes pending again.
    pub fn release(&self, downloader: DownloaderId) -> bool {
        let mut inner = self.inner.lock();
        if inner.downloader != Some(downloader) {
            return false;
        }

        *inner = ChunkInner::new(self.duration);
        true
    }

    /// Drops any data and claim.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state != ChunkState::Pending || inner.downloader.is_some() {
            trace!("chunk {}: reset from {:?}", self.id, inner.state);
        }
        *inner = ChunkInner::new(self.duration);
    }

    /// Called by an external parser once the bytes were demuxed.
    pub fn mark_parsed(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ChunkState::Loaded {
            return false;
        }
        inner.state = ChunkState::Parsed;
        true
    }

    /// Moves the read position `offset` ticks into a downloaded chunk and
    /// returns the offset actually applied. The byte position is estimated
    /// proportionally since the container is not parsed here.
    pub fn seek_within(&self, offset: u64) -> u64 {
        let offset = offset.min(self.duration);
        let mut inner = self.inner.lock();
        if !inner.state.is_downloaded() {
            return offset;
        }

        inner.duration_left = self.duration - offset;
        inner.current_offset = if self.duration == 0 {
            0
        } else {
            (inner.length as u128 * offset as u128 / self.duration as u128) as u64
        };
        offset
    }

    /// Playback consumed `bytes` bytes covering `ticks` of media.
    pub fn advance(&self, bytes: u64, ticks: u64) {
        let mut inner = self.inner.lock();
        inner.current_offset = (inner.current_offset + bytes).min(inner.length);
        inner.duration_left = inner.duration_left.saturating_sub(ticks);
    }

    pub fn snapshot(&self) -> ChunkSnapshot {
        let inner = self.inner.lock();
        ChunkSnapshot {
            state: inner.state,
            bitrate: inner.bitrate,
            length: inner.length,
            current_offset: inner.current_offset,
            duration_left: inner.duration_left,
            downloader: inner.downloader,
            error_message: inner.error_message.clone(),
        }
    }

    pub fn state(&self) -> ChunkState {
        self.inner.lock().state
    }

    pub fn bitrate(&self) -> u64 {
        self.inner.lock().bitrate
    }

    pub fn length(&self) -> u64 {
        self.inner.lock().length
    }

    pub fn data(&self) -> Option<Bytes> {
        self.inner.lock().data.clone()
    }

    pub fn error_message(&self) -> Option<String> {
        self.inner.lock().error_message.clone()
    }

    /// Time between claim and completion of the last download.
    pub fn download_time(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match (inner.started_at, inner.completed_at) {
            (Some(start), Some(end)) => Some(end.saturating_duration_since(start)),
            _ => None,
        }
    }
}
