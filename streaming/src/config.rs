use crate::errors::StreamingError;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error};

/// Major version of the heuristics settings layout this crate understands.
pub const SUPPORTED_MAJOR_VERSION: u32 = 1;

/// Tuning knobs for the bitrate heuristics and the chunk buffer.
///
/// All buffer levels are in seconds of buffered media.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HeuristicsSettings {
    pub major_version: u32,
    pub minor_version: u32,
    /// Stop requesting chunks once this much media is buffered.
    pub max_buffer_size: f64,
    /// Above this level the heuristics try a higher bitrate.
    pub upper_buffer_fullness: f64,
    /// Below this level the stream goes back to buffering.
    pub lower_buffer_fullness: f64,
    /// Below this level the stream drops to the lowest bitrate.
    pub panic_buffer_fullness: f64,
    /// Minimum time between two attempts at a higher bitrate, in seconds.
    pub try_improving_bitrate_period: f64,
    /// A download this many times faster than the bandwidth kernel is
    /// treated as served from a cache.
    pub cache_bandwidth_factor: f64,
    /// ...as long as it is also faster than this, in kbps.
    pub cache_bandwidth_min: f64,
    pub max_missing_or_corrupted_chunks: u32,
    /// Download speed, relative to playback, to aim for after a normal start.
    pub relative_content_download_speed: f64,
    /// Same, right after a seek.
    pub seek_relative_content_download_speed: f64,
}

impl Default for HeuristicsSettings {
    fn default() -> Self {
        Self {
            major_version: SUPPORTED_MAJOR_VERSION,
            minor_version: 0,
            max_buffer_size: 20.0,
            upper_buffer_fullness: 15.0,
            lower_buffer_fullness: 8.0,
            panic_buffer_fullness: 3.0,
            try_improving_bitrate_period: 10.0,
            cache_bandwidth_factor: 3.0,
            cache_bandwidth_min: 20_000.0,
            max_missing_or_corrupted_chunks: 5,
            relative_content_download_speed: 1.25,
            seek_relative_content_download_speed: 2.0,
        }
    }
}

impl HeuristicsSettings {
    /// Parses a `[heuristics]`-style TOML table. A settings block written for
    /// another major version is logged and replaced by the defaults.
    pub fn from_toml(data: &str) -> Result<Self, StreamingError> {
        let settings: HeuristicsSettings = toml::from_str(data).map_err(|e| {
            StreamingError::ConfigError(format!("Invalid heuristics settings: {}", e))
        })?;
        Ok(settings.checked())
    }

    /// Applies the version gate to already deserialized settings.
    pub fn checked(self) -> Self {
        if self.major_version != SUPPORTED_MAJOR_VERSION {
            error!(
                "heuristics settings version {}.{} is not supported (expected major {}), using defaults",
                self.major_version, self.minor_version, SUPPORTED_MAJOR_VERSION
            );
            return Self::default();
        }

        debug!(
            "heuristics settings version {}.{}",
            self.major_version, self.minor_version
        );
        self
    }

    pub fn try_improving_period(&self) -> Duration {
        Duration::from_secs_f64(self.try_improving_bitrate_period.max(0.0))
    }

    pub fn cache_bandwidth_min_bps(&self) -> f64 {
        self.cache_bandwidth_min * 1000.0
    }
}
