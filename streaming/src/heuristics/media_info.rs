use crate::buffer::MediaType;
use crate::config::HeuristicsSettings;
use crate::errors::StreamingError;
use crate::heuristics::bitrate::PerBitrateInfo;
use crate::heuristics::window::SlidingWindow;
use std::time::Instant;
use tracing::debug;

/// Only the first entries of the bitrate table are reflected in the usable
/// bitmask; higher entries are still selectable but never reported.
pub const USABLE_MASK_BITS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Buffering,
    Steady,
    /// One download came back suspiciously fast.
    ProbingCache,
    /// Downloads keep coming back from a cache; bandwidth is not sampled.
    UsingCache,
}

/// Heuristics state of one elementary stream.
#[derive(Debug, Clone)]
pub struct NetworkMediaInfo {
    pub stream_id: u32,
    pub media_type: MediaType,
    pub buffer_fullness: SlidingWindow,
    pub bandwidth: SlidingWindow,
    pub download_state: DownloadState,
    pub locked_bitrate: Option<u64>,
    pub total_stream_downloaded: u64,
    pub previous_attempt: Option<Instant>,
    pub relative_content_download_speed: f64,
    pub(crate) missing_chunks: u32,
    bitrates: Vec<PerBitrateInfo>,
    usable_mask: u8,
    next: usize,
    previous: usize,
    min_bitrate: u64,
    max_bitrate: u64,
}

impl NetworkMediaInfo {
    /// Builds the stream state from the advertised bitrates. The table is
    /// kept sorted ascending without duplicates and must not be empty.
    pub fn new(
        stream_id: u32,
        media_type: MediaType,
        bitrates: &[u64],
        settings: &HeuristicsSettings,
    ) -> Result<Self, StreamingError> {
        let mut rates = bitrates.to_vec();
        rates.sort_unstable();
        rates.dedup();
        if rates.is_empty() {
            return Err(StreamingError::ConfigError(format!(
                "stream {} has no bitrates",
                stream_id
            )));
        }

        let mut info = Self {
            stream_id,
            media_type,
            buffer_fullness: SlidingWindow::buffer_fullness(),
            bandwidth: SlidingWindow::bandwidth(),
            download_state: DownloadState::Buffering,
            locked_bitrate: None,
            total_stream_downloaded: 0,
            previous_attempt: None,
            relative_content_download_speed: settings.relative_content_download_speed,
            missing_chunks: 0,
            bitrates: rates.into_iter().map(PerBitrateInfo::new).collect(),
            usable_mask: 0,
            next: 0,
            previous: 0,
            min_bitrate: 0,
            max_bitrate: u64::MAX,
        };
        info.update_usable_bitrates(0, u64::MAX);
        info.next = info.find_default_bitrate();
        info.previous = info.next;

        Ok(info)
    }

    /// Recomputes which bitrates may be requested and returns the bitmask of
    /// usable entries among the first [`USABLE_MASK_BITS`].
    pub fn update_usable_bitrates(&mut self, min: u64, max: u64) -> u8 {
        self.min_bitrate = min;
        self.max_bitrate = max;

        let mut mask = 0u8;
        for (i, info) in self.bitrates.iter_mut().enumerate() {
            if info.update_usable(min, max) && i < USABLE_MASK_BITS {
                mask |= 1 << i;
            }
        }

        if mask != self.usable_mask {
            debug!(
                "stream {}: usable bitrates changed {:#010b} -> {:#010b}",
                self.stream_id, self.usable_mask, mask
            );
        }
        self.usable_mask = mask;
        mask
    }

    /// Index of the bitrate to use when nothing better is known: the first
    /// usable entry, else the lowest one inside the bounds, else the lowest.
    pub fn find_default_bitrate(&self) -> usize {
        if let Some(idx) = self.bitrates.iter().position(|b| b.is_usable) {
            return idx;
        }

        self.bitrates
            .iter()
            .position(|b| b.in_bounds(self.min_bitrate, self.max_bitrate))
            .unwrap_or(0)
    }

    /// Closest usable index at or below `idx`. Negative values search
    /// upwards from the lowest entry.
    pub fn find_closest_bitrate_by_index(&self, idx: isize) -> usize {
        let found = if idx < 0 {
            self.bitrates.iter().position(|b| b.is_usable)
        } else {
            let start = (idx as usize).min(self.bitrates.len() - 1);
            (0..=start).rev().find(|&i| self.bitrates[i].is_usable)
        };

        found.unwrap_or_else(|| self.find_default_bitrate())
    }

    /// Highest usable index whose nominal rate does not exceed `value`.
    pub fn find_closest_bitrate_by_value(&self, value: f64) -> usize {
        (0..self.bitrates.len())
            .rev()
            .find(|&i| self.bitrates[i].is_usable && self.bitrates[i].bitrate as f64 <= value)
            .unwrap_or_else(|| self.find_default_bitrate())
    }

    /// Returns the stream to its startup state. A seek aims for a faster
    /// download rate than a normal start so playback resumes quickly.
    pub fn reset(&mut self, is_seek: bool, settings: &HeuristicsSettings) {
        self.download_state = DownloadState::Buffering;
        self.update_usable_bitrates(self.min_bitrate, self.max_bitrate);
        self.previous = self.next;
        self.next = self.find_default_bitrate();
        self.total_stream_downloaded = 0;
        self.buffer_fullness.reset();
        self.previous_attempt = None;
        self.missing_chunks = 0;
        self.relative_content_download_speed = if is_seek {
            settings.seek_relative_content_download_speed
        } else {
            settings.relative_content_download_speed
        };
    }

    pub fn bitrates(&self) -> &[PerBitrateInfo] {
        &self.bitrates
    }

    pub fn bitrate(&self, idx: usize) -> u64 {
        self.bitrates[idx.min(self.bitrates.len() - 1)].bitrate
    }

    pub fn index_of(&self, bitrate: u64) -> Option<usize> {
        self.bitrates.iter().position(|b| b.bitrate == bitrate)
    }

    pub fn bitrate_info_mut(&mut self, bitrate: u64) -> Option<&mut PerBitrateInfo> {
        self.bitrates.iter_mut().find(|b| b.bitrate == bitrate)
    }

    pub(crate) fn bitrate_info_at_mut(&mut self, idx: usize) -> &mut PerBitrateInfo {
        &mut self.bitrates[idx]
    }

    pub fn usable_mask(&self) -> u8 {
        self.usable_mask
    }

    pub fn bounds(&self) -> (u64, u64) {
        (self.min_bitrate, self.max_bitrate)
    }

    pub fn next_index(&self) -> usize {
        self.next
    }

    pub fn next_bitrate(&self) -> u64 {
        self.bitrate(self.next)
    }

    pub fn previous_bitrate(&self) -> u64 {
        self.bitrate(self.previous)
    }

    pub(crate) fn set_next(&mut self, idx: usize) {
        self.previous = self.next;
        self.next = idx.min(self.bitrates.len() - 1);
    }
}
