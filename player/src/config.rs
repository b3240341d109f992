use crate::error::PlayerError;
use serde::Deserialize;
use std::fs;
use std::time::Duration;
use streaming::{HeuristicsSettings, MediaType};

/// Main configuration structure for the player
#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub runtime: Runtime,
    pub source: Source,
    #[serde(default)]
    pub download: Download,
    #[serde(default)]
    pub playback: Playback,
    #[serde(default)]
    pub heuristics: HeuristicsSettings,
    #[serde(default)]
    pub report: Report,
}

#[derive(Debug, Default, Deserialize)]
pub struct Runtime {
    pub threads: Option<usize>,
}

/// Where chunks come from
#[derive(Debug, Deserialize)]
pub struct Source {
    pub base_url: String,
    #[serde(default = "Source::default_url_template")]
    pub url_template: String,
    pub streams: Vec<StreamSource>,
}

impl Source {
    fn default_url_template() -> String {
        "{base}/{stream}/{bitrate}/{chunk}.m4s".to_string()
    }
}

/// One elementary stream as the manifest describes it
#[derive(Debug, Clone, Deserialize)]
pub struct StreamSource {
    pub id: u32,
    pub media_type: MediaType,
    pub bitrates: Vec<u64>,
    pub chunks: usize,
    #[serde(with = "humantime_serde")]
    pub chunk_duration: Duration,
}

#[derive(Debug, Deserialize)]
pub struct Download {
    /// Downloads in flight per stream
    #[serde(default = "Download::default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "Download::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Download {
    fn default_max_concurrent() -> usize {
        2
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

impl Default for Download {
    fn default() -> Self {
        Self {
            max_concurrent: Self::default_max_concurrent(),
            timeout: Self::default_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Playback {
    #[serde(default, with = "humantime_serde")]
    pub start_position: Option<Duration>,
    /// Stop after this long even if the streams have chunks left
    #[serde(default, with = "humantime_serde")]
    pub max_duration: Option<Duration>,
    /// How often simulated playback consumes the buffer
    #[serde(default = "Playback::default_tick", with = "humantime_serde")]
    pub tick: Duration,
}

impl Playback {
    fn default_tick() -> Duration {
        Duration::from_millis(250)
    }
}

impl Default for Playback {
    fn default() -> Self {
        Self {
            start_position: None,
            max_duration: None,
            tick: Self::default_tick(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Report {
    pub path: Option<String>,
}

impl Settings {
    pub fn load(config_path: &str) -> Result<Self, PlayerError> {
        let data = fs::read_to_string(config_path).map_err(|_| {
            PlayerError::ConfigError(format!("Config file '{}' does not exist", config_path))
        })?;
        Self::from_toml(&data)
    }

    pub fn from_toml(data: &str) -> Result<Self, PlayerError> {
        let mut settings: Settings = toml::from_str(data)
            .map_err(|e| PlayerError::ConfigError(format!("Invalid configuration: {}", e)))?;
        settings.heuristics = settings.heuristics.checked();
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), PlayerError> {
        if self.source.streams.is_empty() {
            return Err(PlayerError::ConfigError("no streams configured".to_string()));
        }
        if self.download.max_concurrent == 0 {
            return Err(PlayerError::ConfigError(
                "download.max_concurrent must be positive".to_string(),
            ));
        }
        if self.playback.tick.is_zero() {
            return Err(PlayerError::ConfigError(
                "playback.tick must be positive".to_string(),
            ));
        }

        for (i, stream) in self.source.streams.iter().enumerate() {
            if self.source.streams[..i].iter().any(|s| s.id == stream.id) {
                return Err(PlayerError::ConfigError(format!(
                    "stream {} is configured twice",
                    stream.id
                )));
            }
            if stream.bitrates.is_empty() || stream.chunks == 0 || stream.chunk_duration.is_zero() {
                return Err(PlayerError::ConfigError(format!(
                    "stream {} needs bitrates, chunks and a chunk duration",
                    stream.id
                )));
            }
        }
        Ok(())
    }
}
