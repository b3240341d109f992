use crate::heuristics::window::SlidingWindow;
use std::time::Instant;

/// Download speed, relative to real time, a bitrate has to sustain to be
/// considered supported.
const SUPPORTED_SPEED: f64 = 1.0;

/// Observed performance of one candidate encoding rate.
#[derive(Debug, Clone)]
pub struct PerBitrateInfo {
    pub bitrate: u64,
    pub is_tested: bool,
    pub is_supported: bool,
    pub is_usable: bool,
    success: SlidingWindow,
    tested_at: Option<Instant>,
}

impl PerBitrateInfo {
    pub fn new(bitrate: u64) -> Self {
        Self {
            bitrate,
            is_tested: false,
            is_supported: false,
            is_usable: false,
            success: SlidingWindow::success(),
            tested_at: None,
        }
    }

    /// Records one download at this rate. `speed` is chunk duration divided
    /// by download time; a failed download counts as zero.
    pub fn record(&mut self, speed: Option<f64>, now: Instant) {
        let speed = speed.unwrap_or(0.0).max(0.0);
        let kernel = self.success.add(speed);
        self.is_tested = true;
        self.is_supported = kernel >= SUPPORTED_SPEED;
        self.tested_at = Some(now);
    }

    /// Forgets earlier results so the rate gets tried again.
    pub fn retest(&mut self) {
        self.is_tested = false;
        self.is_supported = false;
        self.success.reset();
    }

    /// Whether the last test is older than `period`.
    pub fn tested_before(&self, now: Instant, period: std::time::Duration) -> bool {
        match self.tested_at {
            Some(at) => now.saturating_duration_since(at) >= period,
            None => true,
        }
    }

    pub fn in_bounds(&self, min: u64, max: u64) -> bool {
        self.bitrate >= min && self.bitrate <= max
    }

    pub(crate) fn update_usable(&mut self, min: u64, max: u64) -> bool {
        self.is_usable = (!self.is_tested || self.is_supported) && self.in_bounds(min, max);
        self.is_usable
    }

    pub fn speed(&self) -> f64 {
        self.success.kernel()
    }
}
