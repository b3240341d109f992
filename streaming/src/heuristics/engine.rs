use crate::buffer::{ticks_to_secs, MediaType};
use crate::config::HeuristicsSettings;
use crate::errors::StreamingError;
use crate::heuristics::media_info::{DownloadState, NetworkMediaInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Floor for download times so instant responses do not divide by zero.
const MIN_DOWNLOAD_SECS: f64 = 0.001;

/// Outcome of one chunk download, as seen by the heuristics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadReport {
    pub bitrate: u64,
    pub bytes: u64,
    pub download_time: Duration,
    /// Media duration of the chunk in ticks.
    pub chunk_duration: u64,
    pub success: bool,
}

impl DownloadReport {
    pub fn bandwidth(&self) -> f64 {
        self.bytes as f64 * 8.0 / self.download_secs()
    }

    /// How many times faster than real time the chunk arrived.
    pub fn speed(&self) -> f64 {
        ticks_to_secs(self.chunk_duration) / self.download_secs()
    }

    fn download_secs(&self) -> f64 {
        self.download_time.as_secs_f64().max(MIN_DOWNLOAD_SECS)
    }
}

/// Bitrate selection for every stream of a presentation.
#[derive(Debug)]
pub struct Heuristics {
    settings: HeuristicsSettings,
    streams: Mutex<HashMap<u32, NetworkMediaInfo>>,
}

impl Heuristics {
    pub fn new(settings: HeuristicsSettings) -> Self {
        Self {
            settings,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &HeuristicsSettings {
        &self.settings
    }

    pub fn register_stream(
        &self,
        stream_id: u32,
        media_type: MediaType,
        bitrates: &[u64],
    ) -> Result<(), StreamingError> {
        let info = NetworkMediaInfo::new(stream_id, media_type, bitrates, &self.settings)?;
        debug!(
            "heuristics: stream {} ({:?}) with {} bitrates",
            stream_id,
            media_type,
            info.bitrates().len()
        );
        self.streams.lock().insert(stream_id, info);
        Ok(())
    }

    pub fn remove_stream(&self, stream_id: u32) {
        self.streams.lock().remove(&stream_id);
    }

    /// Picks the bitrate of the next chunk to request for `stream_id`.
    pub fn next_bitrate(&self, stream_id: u32, now: Instant) -> Result<u64, StreamingError> {
        self.with_stream_mut(stream_id, |info| {
            let before = info.next_bitrate();
            let state = info.download_state;
            let idx = decide(info, &self.settings, now);
            info.set_next(idx);

            let after = info.next_bitrate();
            if before != after || state != info.download_state {
                info!(
                    "stream {}: {:?} -> {:?}, bitrate {} -> {}",
                    stream_id, state, info.download_state, before, after
                );
            }
            after
        })
    }

    /// Feeds the result of a finished download into the stream statistics.
    ///
    /// Fails once more than `max_missing_or_corrupted_chunks` downloads in a
    /// row were lost.
    pub fn on_download_completed(
        &self,
        stream_id: u32,
        report: DownloadReport,
        now: Instant,
    ) -> Result<(), StreamingError> {
        let settings = &self.settings;
        self.with_stream_mut(stream_id, |info| {
            info.total_stream_downloaded += report.bytes;

            if !report.success {
                info.missing_chunks += 1;
                if let Some(bitrate) = info.bitrate_info_mut(report.bitrate) {
                    bitrate.record(None, now);
                }
                warn!(
                    "stream {}: chunk at {} bps lost ({} in a row)",
                    stream_id, report.bitrate, info.missing_chunks
                );
                if info.missing_chunks > settings.max_missing_or_corrupted_chunks {
                    return Err(StreamingError::MissingChunks(format!(
                        "stream {}: {} chunks in a row failed",
                        stream_id, info.missing_chunks
                    )));
                }
                return Ok(());
            }
            info.missing_chunks = 0;

            let bandwidth = report.bandwidth();
            if looks_cached(info, settings, bandwidth) {
                info.download_state = match info.download_state {
                    DownloadState::ProbingCache | DownloadState::UsingCache => {
                        DownloadState::UsingCache
                    }
                    _ => DownloadState::ProbingCache,
                };
                debug!(
                    "stream {}: {:.0} bps looks like a cache hit ({:?})",
                    stream_id, bandwidth, info.download_state
                );
                return Ok(());
            }

            if matches!(
                info.download_state,
                DownloadState::ProbingCache | DownloadState::UsingCache
            ) {
                info.download_state = if !info.buffer_fullness.is_empty()
                    && info.buffer_fullness.kernel() >= settings.lower_buffer_fullness
                {
                    DownloadState::Steady
                } else {
                    DownloadState::Buffering
                };
                debug!(
                    "stream {}: back on the network ({:?})",
                    stream_id, info.download_state
                );
            }

            info.bandwidth.add(bandwidth);
            if let Some(bitrate) = info.bitrate_info_mut(report.bitrate) {
                bitrate.record(Some(report.speed()), now);
            }
            Ok(())
        })?
    }

    /// Current buffered media in seconds, sampled by the playback side.
    pub fn on_buffer_level(&self, stream_id: u32, seconds: f64) -> Result<f64, StreamingError> {
        self.with_stream_mut(stream_id, |info| info.buffer_fullness.add(seconds))
    }

    pub fn reset(&self, stream_id: u32, is_seek: bool) -> Result<(), StreamingError> {
        let settings = &self.settings;
        self.with_stream_mut(stream_id, |info| info.reset(is_seek, settings))
    }

    /// Pins the stream to the usable bitrate closest to `bitrate`.
    pub fn lock_bitrate(&self, stream_id: u32, bitrate: u64) -> Result<(), StreamingError> {
        self.with_stream_mut(stream_id, |info| info.locked_bitrate = Some(bitrate))
    }

    pub fn unlock_bitrate(&self, stream_id: u32) -> Result<(), StreamingError> {
        self.with_stream_mut(stream_id, |info| info.locked_bitrate = None)
    }

    pub fn set_bitrate_bounds(
        &self,
        stream_id: u32,
        min: u64,
        max: u64,
    ) -> Result<u8, StreamingError> {
        self.with_stream_mut(stream_id, |info| info.update_usable_bitrates(min, max))
    }

    pub fn download_state(&self, stream_id: u32) -> Result<DownloadState, StreamingError> {
        self.with_stream(stream_id, |info| info.download_state)
    }

    /// Runs `f` against a stream's state without changing it.
    pub fn with_stream<R>(
        &self,
        stream_id: u32,
        f: impl FnOnce(&NetworkMediaInfo) -> R,
    ) -> Result<R, StreamingError> {
        let streams = self.streams.lock();
        let info = streams
            .get(&stream_id)
            .ok_or_else(|| StreamingError::UnknownStream(stream_id.to_string()))?;
        Ok(f(info))
    }

    fn with_stream_mut<R>(
        &self,
        stream_id: u32,
        f: impl FnOnce(&mut NetworkMediaInfo) -> R,
    ) -> Result<R, StreamingError> {
        let mut streams = self.streams.lock();
        let info = streams
            .get_mut(&stream_id)
            .ok_or_else(|| StreamingError::UnknownStream(stream_id.to_string()))?;
        Ok(f(info))
    }
}

fn looks_cached(info: &NetworkMediaInfo, settings: &HeuristicsSettings, bandwidth: f64) -> bool {
    !info.bandwidth.is_empty()
        && bandwidth > info.bandwidth.kernel() * settings.cache_bandwidth_factor
        && bandwidth > settings.cache_bandwidth_min_bps()
}

fn elapsed_since(previous: Option<Instant>, now: Instant, period: Duration) -> bool {
    match previous {
        Some(at) => now.saturating_duration_since(at) >= period,
        None => true,
    }
}

/// Chooses the bitrate index of the next request and moves the stream
/// between buffering and steady state.
fn decide(info: &mut NetworkMediaInfo, settings: &HeuristicsSettings, now: Instant) -> usize {
    let (min, max) = info.bounds();
    info.update_usable_bitrates(min, max);

    if let Some(locked) = info.locked_bitrate {
        return info.find_closest_bitrate_by_value(locked as f64);
    }

    let current = info.find_closest_bitrate_by_index(info.next_index() as isize);
    let has_fullness = !info.buffer_fullness.is_empty();
    let fullness = info.buffer_fullness.kernel();
    let fit = if info.bandwidth.is_empty() {
        None
    } else {
        Some(info.find_closest_bitrate_by_value(
            info.bandwidth.kernel() / info.relative_content_download_speed,
        ))
    };

    match info.download_state {
        DownloadState::Buffering => {
            let idx = fit.unwrap_or_else(|| info.find_default_bitrate());
            if has_fullness && fullness >= settings.lower_buffer_fullness {
                info.download_state = DownloadState::Steady;
                info.previous_attempt = Some(now);
            }
            idx
        }
        DownloadState::Steady => {
            if fullness < settings.panic_buffer_fullness {
                info.download_state = DownloadState::Buffering;
                info.find_closest_bitrate_by_index(-1)
            } else if fullness < settings.lower_buffer_fullness {
                info.download_state = DownloadState::Buffering;
                fit.map_or(current, |fit| fit.min(current))
            } else if fullness >= settings.upper_buffer_fullness
                && elapsed_since(info.previous_attempt, now, settings.try_improving_period())
            {
                info.previous_attempt = Some(now);
                let up = current + 1;
                if up < info.bitrates().len() {
                    let candidate = info.bitrate_info_at_mut(up);
                    if candidate.is_tested
                        && !candidate.is_supported
                        && candidate.tested_before(now, settings.try_improving_period())
                    {
                        candidate.retest();
                        info.update_usable_bitrates(min, max);
                    }
                }
                info.find_closest_bitrate_by_index(up as isize).max(current)
            } else {
                fit.map_or(current, |fit| current.min(fit))
            }
        }
        DownloadState::ProbingCache | DownloadState::UsingCache => {
            if has_fullness && fullness < settings.panic_buffer_fullness {
                info.download_state = DownloadState::Buffering;
                info.find_closest_bitrate_by_index(-1)
            } else {
                current
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::TICKS_PER_SECOND;

    const RATES: [u64; 4] = [300_000, 700_000, 1_500_000, 3_000_000];

    fn heuristics(settings: HeuristicsSettings) -> Heuristics {
        let heuristics = Heuristics::new(settings);
        heuristics
            .register_stream(1, MediaType::Video, &RATES)
            .unwrap();
        heuristics
    }

    fn report(bitrate: u64, bytes: u64, millis: u64) -> DownloadReport {
        DownloadReport {
            bitrate,
            bytes,
            download_time: Duration::from_millis(millis),
            chunk_duration: 2 * TICKS_PER_SECOND,
            success: true,
        }
    }

    fn lost(bitrate: u64) -> DownloadReport {
        DownloadReport {
            success: false,
            ..report(bitrate, 0, 0)
        }
    }

    #[test]
    fn report_rates() {
        let r = report(300_000, 250_000, 1000);
        assert_eq!(r.bandwidth(), 2_000_000.0);
        assert_eq!(r.speed(), 2.0);
    }

    #[test]
    fn starts_on_lowest_bitrate() {
        let heuristics = heuristics(HeuristicsSettings::default());
        let bitrate = heuristics.next_bitrate(1, Instant::now()).unwrap();
        assert_eq!(bitrate, 300_000);
        assert_eq!(
            heuristics.download_state(1).unwrap(),
            DownloadState::Buffering
        );
    }

    #[test]
    fn buffering_fits_bandwidth_with_margin() {
        let heuristics = heuristics(HeuristicsSettings::default());
        let now = Instant::now();
        heuristics
            .on_download_completed(1, report(300_000, 250_000, 1000), now)
            .unwrap();
        // 2 Mbps / 1.25 leaves room for 1.5 Mbps
        assert_eq!(heuristics.next_bitrate(1, now).unwrap(), 1_500_000);
    }

    #[test]
    fn steady_state_improves_after_period() {
        let heuristics = heuristics(HeuristicsSettings::default());
        let now = Instant::now();
        heuristics
            .on_download_completed(1, report(300_000, 250_000, 1000), now)
            .unwrap();
        heuristics.on_buffer_level(1, 16.0).unwrap();

        assert_eq!(heuristics.next_bitrate(1, now).unwrap(), 1_500_000);
        assert_eq!(heuristics.download_state(1).unwrap(), DownloadState::Steady);

        let soon = now + Duration::from_secs(1);
        assert_eq!(heuristics.next_bitrate(1, soon).unwrap(), 1_500_000);

        let later = now + Duration::from_secs(11);
        assert_eq!(heuristics.next_bitrate(1, later).unwrap(), 3_000_000);

        // the 3 Mbps attempt is too slow: the bitrate becomes unusable and 1.5 Mbps
        // of bandwidth only leaves room for 700 kbps with the margin
        heuristics
            .on_download_completed(1, report(3_000_000, 750_000, 4000), later)
            .unwrap();
        let next = later + Duration::from_secs(1);
        assert_eq!(heuristics.next_bitrate(1, next).unwrap(), 700_000);
        let usable = heuristics
            .with_stream(1, |info| info.bitrates()[3].is_usable)
            .unwrap();
        assert!(!usable);
    }

    #[test]
    fn steady_down_switch_keeps_download_margin() {
        let heuristics = heuristics(HeuristicsSettings::default());
        let now = Instant::now();
        heuristics
            .on_download_completed(1, report(300_000, 250_000, 1000), now)
            .unwrap();
        heuristics.on_buffer_level(1, 10.0).unwrap();
        assert_eq!(heuristics.next_bitrate(1, now).unwrap(), 1_500_000);

        // the 1.8 Mbps average covers 1.5 Mbps in real time but not at 1.25x
        heuristics
            .on_download_completed(1, report(1_500_000, 200_000, 1000), now)
            .unwrap();
        let soon = now + Duration::from_secs(1);
        assert_eq!(heuristics.next_bitrate(1, soon).unwrap(), 700_000);
        assert_eq!(heuristics.download_state(1).unwrap(), DownloadState::Steady);
    }

    #[test]
    fn unsupported_bitrate_is_retested_later() {
        let heuristics = heuristics(HeuristicsSettings::default());
        let now = Instant::now();
        heuristics
            .on_download_completed(1, report(1_500_000, 1_000_000, 1000), now)
            .unwrap();
        heuristics
            .on_download_completed(1, lost(3_000_000), now)
            .unwrap();
        heuristics.on_buffer_level(1, 16.0).unwrap();

        // 8 Mbps / 1.25 still excludes the failed 3 Mbps
        assert_eq!(heuristics.next_bitrate(1, now).unwrap(), 1_500_000);

        let later = now + Duration::from_secs(10);
        assert_eq!(heuristics.next_bitrate(1, later).unwrap(), 3_000_000);
    }

    #[test]
    fn panic_level_drops_to_lowest() {
        let heuristics = heuristics(HeuristicsSettings::default());
        let now = Instant::now();
        heuristics
            .on_download_completed(1, report(300_000, 250_000, 1000), now)
            .unwrap();
        heuristics.on_buffer_level(1, 10.0).unwrap();
        assert_eq!(heuristics.next_bitrate(1, now).unwrap(), 1_500_000);

        heuristics.on_buffer_level(1, 2.0).unwrap();
        assert_eq!(heuristics.next_bitrate(1, now).unwrap(), 300_000);
        assert_eq!(
            heuristics.download_state(1).unwrap(),
            DownloadState::Buffering
        );
    }

    #[test]
    fn low_buffer_returns_to_buffering() {
        let heuristics = heuristics(HeuristicsSettings::default());
        let now = Instant::now();
        heuristics
            .on_download_completed(1, report(300_000, 250_000, 1000), now)
            .unwrap();
        heuristics.on_buffer_level(1, 10.0).unwrap();
        heuristics.next_bitrate(1, now).unwrap();

        heuristics.on_buffer_level(1, 5.0).unwrap();
        assert_eq!(heuristics.next_bitrate(1, now).unwrap(), 1_500_000);
        assert_eq!(
            heuristics.download_state(1).unwrap(),
            DownloadState::Buffering
        );
    }

    #[test]
    fn cache_hits_do_not_move_bandwidth() {
        let heuristics = heuristics(HeuristicsSettings::default());
        let now = Instant::now();
        heuristics
            .on_download_completed(1, report(300_000, 250_000, 1000), now)
            .unwrap();

        heuristics
            .on_download_completed(1, report(300_000, 250_000, 50), now)
            .unwrap();
        assert_eq!(
            heuristics.download_state(1).unwrap(),
            DownloadState::ProbingCache
        );
        heuristics
            .on_download_completed(1, report(300_000, 250_000, 50), now)
            .unwrap();
        assert_eq!(
            heuristics.download_state(1).unwrap(),
            DownloadState::UsingCache
        );
        let kernel = heuristics.with_stream(1, |i| i.bandwidth.kernel()).unwrap();
        assert_eq!(kernel, 2_000_000.0);

        heuristics
            .on_download_completed(1, report(300_000, 250_000, 1000), now)
            .unwrap();
        assert_eq!(
            heuristics.download_state(1).unwrap(),
            DownloadState::Buffering
        );
    }

    #[test]
    fn too_many_missing_chunks_fail_the_stream() {
        let settings = HeuristicsSettings {
            max_missing_or_corrupted_chunks: 2,
            ..HeuristicsSettings::default()
        };
        let heuristics = heuristics(settings);
        let now = Instant::now();

        heuristics.on_download_completed(1, lost(300_000), now).unwrap();
        heuristics.on_download_completed(1, lost(300_000), now).unwrap();
        heuristics
            .on_download_completed(1, report(300_000, 1000, 100), now)
            .unwrap();
        heuristics.on_download_completed(1, lost(300_000), now).unwrap();
        heuristics.on_download_completed(1, lost(300_000), now).unwrap();
        let result = heuristics.on_download_completed(1, lost(300_000), now);
        assert!(matches!(result, Err(StreamingError::MissingChunks(_))));
    }

    #[test]
    fn locked_bitrate_wins() {
        let heuristics = heuristics(HeuristicsSettings::default());
        let now = Instant::now();
        heuristics.lock_bitrate(1, 1_000_000).unwrap();
        assert_eq!(heuristics.next_bitrate(1, now).unwrap(), 700_000);

        heuristics.unlock_bitrate(1).unwrap();
        assert_eq!(heuristics.next_bitrate(1, now).unwrap(), 300_000);
    }

    #[test]
    fn bounds_limit_choice() {
        let heuristics = heuristics(HeuristicsSettings::default());
        let now = Instant::now();
        let mask = heuristics
            .set_bitrate_bounds(1, 700_000, 1_500_000)
            .unwrap();
        assert_eq!(mask, 0b0110);
        heuristics
            .on_download_completed(1, report(700_000, 2_500_000, 1000), now)
            .unwrap();
        assert_eq!(heuristics.next_bitrate(1, now).unwrap(), 1_500_000);
    }

    #[test]
    fn seek_reset_is_more_conservative() {
        let heuristics = heuristics(HeuristicsSettings::default());
        let now = Instant::now();
        heuristics
            .on_download_completed(1, report(300_000, 250_000, 1000), now)
            .unwrap();
        heuristics.reset(1, true).unwrap();

        // 2 Mbps / 2.0 only leaves room for 700 kbps
        assert_eq!(heuristics.next_bitrate(1, now).unwrap(), 700_000);
        let downloaded = heuristics
            .with_stream(1, |info| info.total_stream_downloaded)
            .unwrap();
        assert_eq!(downloaded, 0);
    }

    #[test]
    fn unknown_stream_is_an_error() {
        let heuristics = heuristics(HeuristicsSettings::default());
        assert!(matches!(
            heuristics.next_bitrate(9, Instant::now()),
            Err(StreamingError::UnknownStream(_))
        ));
    }
}
