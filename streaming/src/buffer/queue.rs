use crate::buffer::chunk::{ChunkId, ChunkState, MediaChunk, MediaType, TICKS_PER_SECOND};
use crate::errors::StreamingError;
use parking_lot::Mutex;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Slack subtracted from a chunk's end time when looking for the chunk that
/// contains a seek target.
pub const SEEK_GUARD: u64 = TICKS_PER_SECOND / 10;

/// Upper bound on the number of chunks a single queue may address.
pub const MAX_CHUNKS: usize = 1 << 20;

/// Start time and duration of one chunk, as announced by the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTiming {
    pub start_time: u64,
    pub duration: u64,
}

impl ChunkTiming {
    /// `count` back to back chunks of the same duration.
    pub fn uniform(count: usize, duration: u64) -> Vec<ChunkTiming> {
        (0..count)
            .map(|i| ChunkTiming {
                start_time: i as u64 * duration,
                duration,
            })
            .collect()
    }
}

#[derive(Debug)]
struct QueueState {
    slots: Vec<Arc<MediaChunk>>,
    first: usize,
    last: usize,
    stream_id: u32,
    shut_down: bool,
}

/// Buffer of chunk slots for one stream, addressed by chunk id.
///
/// `first` is the oldest chunk not yet consumed, `last` is one past the newest
/// chunk handed to the queue. Mutations hold the queue lock for their whole
/// duration. Cursors and buffered totals are mirrored into atomics so
/// playback can read them without taking the lock.
#[derive(Debug)]
pub struct MediaChunkQueue {
    media_type: MediaType,
    max_buffered: usize,
    state: Mutex<QueueState>,
    first: AtomicUsize,
    last: AtomicUsize,
    buffer_size: AtomicU64,
    buffer_time: AtomicU64,
}

impl MediaChunkQueue {
    /// Creates one pending slot per announced chunk. At most `max_buffered`
    /// chunks past `first` are accepted.
    pub fn new(
        stream_id: u32,
        media_type: MediaType,
        timings: &[ChunkTiming],
        max_buffered: usize,
    ) -> Result<Self, StreamingError> {
        if timings.len() > MAX_CHUNKS {
            return Err(StreamingError::OutOfRange(format!(
                "stream {} announces {} chunks, at most {} are supported",
                stream_id,
                timings.len(),
                MAX_CHUNKS
            )));
        }

        let slots = timings
            .iter()
            .enumerate()
            .map(|(id, t)| {
                Arc::new(MediaChunk::new(
                    id,
                    stream_id,
                    media_type,
                    t.start_time,
                    t.duration,
                ))
            })
            .collect();

        Ok(Self {
            media_type,
            max_buffered: max_buffered.max(1),
            state: Mutex::new(QueueState {
                slots,
                first: 0,
                last: 0,
                stream_id,
                shut_down: false,
            }),
            first: AtomicUsize::new(0),
            last: AtomicUsize::new(0),
            buffer_size: AtomicU64::new(0),
            buffer_time: AtomicU64::new(0),
        })
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn stream_id(&self) -> u32 {
        self.state.lock().stream_id
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn max_buffered(&self) -> usize {
        self.max_buffered
    }

    pub fn first(&self) -> usize {
        self.first.load(Relaxed)
    }

    pub fn last(&self) -> usize {
        self.last.load(Relaxed)
    }

    /// Bytes of contiguous downloaded data from the playback position.
    pub fn buffer_size(&self) -> u64 {
        self.buffer_size.load(Relaxed)
    }

    /// Ticks of contiguous downloaded media from the playback position.
    pub fn buffer_time(&self) -> u64 {
        self.buffer_time.load(Relaxed)
    }

    /// The chunk playback is on, if any chunk is queued.
    pub fn current(&self) -> Option<Arc<MediaChunk>> {
        let state = self.state.lock();
        if state.first < state.last {
            state.slots.get(state.first).cloned()
        } else {
            None
        }
    }

    /// The newest queued chunk.
    pub fn last_chunk(&self) -> Option<Arc<MediaChunk>> {
        let state = self.state.lock();
        if state.first < state.last {
            state.slots.get(state.last - 1).cloned()
        } else {
            None
        }
    }

    pub fn get(&self, id: ChunkId) -> Result<Arc<MediaChunk>, StreamingError> {
        let state = self.state.lock();
        state.slots.get(id).cloned().ok_or_else(|| {
            StreamingError::OutOfRange(format!(
                "chunk {} of stream {} (capacity {})",
                id,
                state.stream_id,
                state.slots.len()
            ))
        })
    }

    /// First unclaimed pending chunk inside the buffering window.
    pub fn next_to_download(&self) -> Option<Arc<MediaChunk>> {
        let state = self.state.lock();
        if state.shut_down {
            return None;
        }

        let end = (state.first + self.max_buffered).min(state.slots.len());
        state.slots[state.first.min(end)..end]
            .iter()
            .find(|chunk| {
                let snapshot = chunk.snapshot();
                snapshot.state == ChunkState::Pending && snapshot.downloader.is_none()
            })
            .cloned()
    }

    /// Hands a finished chunk to the queue.
    ///
    /// Returns `Ok(false)` when the chunk is ignored: too far ahead or behind,
    /// downloaded for a stream the queue no longer plays, or worse than what
    /// the slot already holds. A downloaded chunk replaces a slot that is
    /// still in flight; buffered data only gives way to a downloaded chunk
    /// at a higher bitrate.
    pub fn add(&self, chunk: Arc<MediaChunk>) -> Result<bool, StreamingError> {
        let mut state = self.state.lock();
        if state.shut_down {
            debug!("queue: shut down, ignoring chunk {}", chunk.id);
            return Ok(false);
        }

        let id = chunk.id;
        if id >= state.slots.len() {
            error!(
                "queue: chunk {} is beyond capacity {}",
                id,
                state.slots.len()
            );
            return Err(StreamingError::OutOfRange(format!(
                "chunk {} of stream {} (capacity {})",
                id,
                chunk.stream_id,
                state.slots.len()
            )));
        }

        if id < state.first || id >= state.first + self.max_buffered {
            warn!(
                "queue: chunk {} outside of buffering window [{}, {})",
                id,
                state.first,
                state.first + self.max_buffered
            );
            return Ok(false);
        }

        let slot = state.slots[id].clone();
        if slot.stream_id != chunk.stream_id {
            debug!(
                "queue: chunk {} belongs to stream {}, slot plays {}",
                id, chunk.stream_id, slot.stream_id
            );
            chunk.reset();
            return Ok(false);
        }

        if !Arc::ptr_eq(&slot, &chunk) {
            let existing = slot.snapshot();
            let incoming = chunk.snapshot();
            if existing.state.is_downloaded()
                && !(incoming.state.is_downloaded() && incoming.bitrate > existing.bitrate)
            {
                debug!(
                    "queue: keeping chunk {} at {} bps over {:?} at {} bps",
                    id, existing.bitrate, incoming.state, incoming.bitrate
                );
                chunk.reset();
                return Ok(false);
            }

            trace!(
                "queue: chunk {} replaced ({:?} -> {:?})",
                id,
                existing.state,
                incoming.state
            );
            slot.reset();
            state.slots[id] = chunk;
        }

        if id >= state.last {
            state.last = id + 1;
        }

        self.recompute(&state);
        Ok(true)
    }

    /// Drops everything before `seek_time` and positions `first` on the chunk
    /// containing it. Returns the offset into that chunk playback starts at:
    /// audio can start mid-chunk, video always starts on a chunk boundary.
    pub fn discard_until(&self, seek_time: u64) -> u64 {
        let mut state = self.state.lock();
        if state.slots.is_empty() {
            return 0;
        }

        let mut target = state.slots.len() - 1;
        let mut target_start = 0;
        let mut elapsed: u64 = 0;
        for (i, slot) in state.slots.iter().enumerate() {
            let start = elapsed;
            elapsed += slot.duration;
            target_start = start;
            if elapsed.saturating_sub(SEEK_GUARD) > seek_time {
                target = i;
                break;
            }
        }

        let (old_first, old_last) = (state.first, state.last);
        if target >= old_first && target < old_last {
            for slot in &state.slots[old_first..target] {
                slot.reset();
            }
        } else if target >= old_last {
            for slot in &state.slots[old_first..old_last] {
                slot.reset();
            }
            state.last = target;
        }
        state.first = target;
        if state.last < state.first {
            state.last = state.first;
        }

        let chunk = state.slots[target].clone();
        let offset = match self.media_type {
            MediaType::Audio => chunk.seek_within(seek_time.saturating_sub(target_start)),
            MediaType::Video => chunk.seek_within(0),
        };

        debug!(
            "queue: seek to {} lands on chunk {} (was [{}, {})), offset {}",
            seek_time, target, old_first, old_last, offset
        );
        self.recompute(&state);
        offset
    }

    /// Keeps roughly `to_keep` ticks of media past the playback position and
    /// drops the rest, including downloads still in flight. Nothing is
    /// dropped while less than `to_keep` is buffered. Returns the number of
    /// chunks discarded.
    pub fn prune(&self, to_keep: u64) -> usize {
        let mut state = self.state.lock();
        let (first, last) = (state.first, state.last);

        let mut kept: u64 = 0;
        let mut cut = None;
        for i in first..last {
            kept += state.slots[i].snapshot().duration_left;
            if kept >= to_keep {
                cut = Some(i + 1);
                break;
            }
        }
        let Some(cut) = cut else {
            return 0;
        };

        let window_end = (first + self.max_buffered).min(state.slots.len()).max(last);
        let mut discarded = 0;
        for slot in &state.slots[cut.min(window_end)..window_end] {
            if slot.state() != ChunkState::Pending || slot.snapshot().downloader.is_some() {
                slot.reset();
                discarded += 1;
            }
        }

        state.last = cut.max(first).min(last);
        if discarded > 0 {
            debug!(
                "queue: pruned {} chunks, keeping [{}, {})",
                discarded, state.first, state.last
            );
        }
        self.recompute(&state);
        discarded
    }

    /// Retires the chunk playback just finished. Returns whether the stream
    /// has chunks left.
    pub fn move_next(&self) -> bool {
        let mut state = self.state.lock();
        if state.shut_down || state.first >= state.slots.len() {
            return false;
        }

        let first = state.first;
        state.slots[first].reset();
        state.first += 1;
        if state.last < state.first {
            state.last = state.first;
        }

        self.recompute(&state);
        state.first < state.slots.len()
    }

    /// Recomputes buffered bytes and time over the downloaded chunks that
    /// follow `first` without a gap. Failed chunks are skipped; the first
    /// chunk that is not downloaded yet ends the run.
    pub fn update_buffer_sizes(&self) {
        let state = self.state.lock();
        self.recompute(&state);
    }

    /// Points every slot at another stream (e.g. a different audio track).
    /// Downloads still running for the old stream are rejected by `add`.
    pub fn switch_stream(&self, stream_id: u32) {
        let mut state = self.state.lock();
        if state.stream_id == stream_id {
            return;
        }

        debug!("queue: switching stream {} -> {}", state.stream_id, stream_id);
        for slot in state.slots.iter_mut() {
            *slot = Arc::new(slot.restamped(stream_id));
        }
        state.stream_id = stream_id;
        state.last = state.first;
        self.recompute(&state);
    }

    /// Drops all buffered data; later chunks are ignored.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        for slot in &state.slots {
            slot.reset();
        }
        state.shut_down = true;
        state.last = state.first;
        self.recompute(&state);
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    fn recompute(&self, state: &QueueState) {
        let mut size: u64 = 0;
        let mut time: u64 = 0;
        for slot in &state.slots[state.first..state.last] {
            let snapshot = slot.snapshot();
            match snapshot.state {
                ChunkState::Error => continue,
                s if s.is_downloaded() => {
                    size += snapshot.length - snapshot.current_offset;
                    time += snapshot.duration_left;
                }
                _ => break,
            }
        }

        self.first.store(state.first, Relaxed);
        self.last.store(state.last, Relaxed);
        self.buffer_size.store(size, Relaxed);
        self.buffer_time.store(time, Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const SECOND: u64 = TICKS_PER_SECOND;

    fn queue(media_type: MediaType, chunks: usize, max_buffered: usize) -> MediaChunkQueue {
        let timings = ChunkTiming::uniform(chunks, 2 * SECOND);
        MediaChunkQueue::new(1, media_type, &timings, max_buffered).unwrap()
    }

    fn download(queue: &MediaChunkQueue, id: ChunkId, bitrate: u64, len: usize) -> Arc<MediaChunk> {
        let chunk = queue.get(id).unwrap();
        assert!(chunk.try_claim(100 + id as u64, bitrate));
        assert!(chunk.install(100 + id as u64, Bytes::from(vec![0u8; len])));
        chunk
    }

    fn load(queue: &MediaChunkQueue, id: ChunkId, len: usize) {
        let chunk = download(queue, id, 300_000, len);
        assert!(queue.add(chunk).unwrap());
    }

    #[test]
    fn add_extends_last_and_accounts() {
        let queue = queue(MediaType::Video, 10, 10);
        load(&queue, 0, 100);
        load(&queue, 1, 50);
        assert_eq!(queue.first(), 0);
        assert_eq!(queue.last(), 2);
        assert_eq!(queue.buffer_size(), 150);
        assert_eq!(queue.buffer_time(), 4 * SECOND);
        assert_eq!(queue.current().unwrap().id, 0);
        assert_eq!(queue.last_chunk().unwrap().id, 1);
    }

    #[test]
    fn accounting_stops_at_first_gap() {
        let queue = queue(MediaType::Video, 10, 10);
        load(&queue, 0, 100);
        load(&queue, 2, 100);
        assert_eq!(queue.last(), 3);
        assert_eq!(queue.buffer_size(), 100);
        assert_eq!(queue.buffer_time(), 2 * SECOND);

        load(&queue, 1, 100);
        assert_eq!(queue.buffer_size(), 300);
        assert_eq!(queue.buffer_time(), 6 * SECOND);
    }

    #[test]
    fn failed_chunks_are_skipped_in_accounting() {
        let queue = queue(MediaType::Video, 10, 10);
        load(&queue, 0, 100);
        let failed = queue.get(1).unwrap();
        failed.try_claim(7, 1);
        failed.fail(7, "gone".to_string());
        assert!(queue.add(failed).unwrap());
        load(&queue, 2, 40);

        assert_eq!(queue.buffer_size(), 140);
        assert_eq!(queue.buffer_time(), 4 * SECOND);
    }

    #[test]
    fn accounting_uses_remaining_parts() {
        let queue = queue(MediaType::Audio, 4, 4);
        load(&queue, 0, 100);
        load(&queue, 1, 100);
        queue.current().unwrap().advance(40, SECOND / 2);
        queue.update_buffer_sizes();

        assert_eq!(queue.buffer_size(), 160);
        assert_eq!(queue.buffer_time(), 4 * SECOND - SECOND / 2);
    }

    #[test]
    fn add_outside_window_is_ignored() {
        let queue = queue(MediaType::Video, 10, 3);
        let chunk = download(&queue, 3, 1, 10);
        assert!(!queue.add(chunk).unwrap());
        assert_eq!(queue.last(), 0);
    }

    #[test]
    fn add_beyond_capacity_is_an_error() {
        let queue = queue(MediaType::Video, 2, 10);
        let stray = Arc::new(MediaChunk::new(5, 1, MediaType::Video, 0, SECOND));
        assert!(matches!(
            queue.add(stray),
            Err(StreamingError::OutOfRange(_))
        ));
        assert!(matches!(queue.get(2), Err(StreamingError::OutOfRange(_))));
    }

    #[test]
    fn add_for_other_stream_resets_chunk() {
        let queue = queue(MediaType::Audio, 4, 4);
        let old = queue.get(0).unwrap();
        old.try_claim(1, 64_000);
        queue.switch_stream(2);

        assert!(old.install(1, Bytes::from_static(b"late")));
        assert!(!queue.add(old.clone()).unwrap());
        assert_eq!(old.state(), ChunkState::Pending);
        assert_eq!(queue.get(0).unwrap().stream_id, 2);
        assert_eq!(queue.last(), 0);
    }

    #[test]
    fn downloaded_chunk_replaces_slot_in_flight() {
        let queue = queue(MediaType::Video, 4, 4);
        let slot = queue.get(1).unwrap();
        slot.try_claim(1, 300_000);

        let upgrade = Arc::new(slot.replacement());
        upgrade.try_claim(2, 1_500_000);
        upgrade.install(2, Bytes::from(vec![1u8; 30]));
        assert!(queue.add(upgrade).unwrap());

        // the first download lost its claim and cannot land any more
        assert!(!slot.install(1, Bytes::from_static(b"stale")));
        assert_eq!(queue.get(1).unwrap().bitrate(), 1_500_000);
    }

    #[test]
    fn higher_bitrate_slot_is_kept() {
        let queue = queue(MediaType::Video, 4, 4);
        let high = download(&queue, 0, 1_500_000, 30);
        assert!(queue.add(high).unwrap());

        let low = Arc::new(queue.get(0).unwrap().replacement());
        low.try_claim(9, 300_000);
        low.install(9, Bytes::from(vec![0u8; 10]));
        assert!(!queue.add(low.clone()).unwrap());
        assert_eq!(low.state(), ChunkState::Pending);
        assert_eq!(queue.current().unwrap().bitrate(), 1_500_000);
        assert_eq!(queue.buffer_size(), 30);
    }

    #[test]
    fn failed_upgrade_keeps_buffered_data() {
        let queue = queue(MediaType::Video, 4, 4);
        load(&queue, 0, 100);

        let failed = Arc::new(queue.get(0).unwrap().replacement());
        failed.try_claim(9, 1_500_000);
        failed.fail(9, "timeout".to_string());
        assert!(!queue.add(failed.clone()).unwrap());
        assert_eq!(failed.state(), ChunkState::Pending);

        let current = queue.current().unwrap();
        assert_eq!(current.state(), ChunkState::Loaded);
        assert_eq!(current.bitrate(), 300_000);
        assert_eq!(queue.buffer_size(), 100);
    }

    #[test]
    fn equal_bitrate_does_not_replace_buffered_chunk() {
        let queue = queue(MediaType::Video, 4, 4);
        load(&queue, 0, 100);

        let same = Arc::new(queue.get(0).unwrap().replacement());
        same.try_claim(9, 300_000);
        same.install(9, Bytes::from(vec![0u8; 10]));
        assert!(!queue.add(same).unwrap());
        assert_eq!(queue.buffer_size(), 100);
    }

    #[test]
    fn discard_until_lands_on_containing_chunk() {
        let queue = queue(MediaType::Video, 10, 10);
        for id in 0..5 {
            load(&queue, id, 100);
        }
        let dropped: Vec<_> = (0..3).map(|id| queue.get(id).unwrap()).collect();

        let offset = queue.discard_until(7 * SECOND);
        assert_eq!(offset, 0);
        assert_eq!(queue.first(), 3);
        assert_eq!(queue.last(), 5);
        for chunk in dropped {
            assert_eq!(chunk.state(), ChunkState::Pending);
        }
        assert_eq!(queue.buffer_time(), 4 * SECOND);
    }

    #[test]
    fn discard_until_guard_moves_to_next_chunk() {
        let queue = queue(MediaType::Video, 10, 10);
        queue.discard_until(2 * SECOND - SECOND / 20);
        assert_eq!(queue.first(), 1);
    }

    #[test]
    fn audio_discard_seeks_inside_chunk() {
        let queue = queue(MediaType::Audio, 10, 10);
        for id in 0..5 {
            load(&queue, id, 1000);
        }

        let offset = queue.discard_until(7 * SECOND);
        assert_eq!(offset, SECOND);
        let current = queue.current().unwrap().snapshot();
        assert_eq!(current.duration_left, SECOND);
        assert_eq!(current.current_offset, 500);
        assert_eq!(queue.buffer_time(), 3 * SECOND);
        assert_eq!(queue.buffer_size(), 1500);
    }

    #[test]
    fn discard_past_buffer_empties_it() {
        let queue = queue(MediaType::Video, 10, 10);
        for id in 0..3 {
            load(&queue, id, 100);
        }
        queue.discard_until(15 * SECOND);
        assert_eq!(queue.first(), 7);
        assert_eq!(queue.last(), 7);
        assert_eq!(queue.buffer_size(), 0);
        assert_eq!(queue.get(1).unwrap().state(), ChunkState::Pending);
    }

    #[test]
    fn discard_beyond_end_lands_on_last_chunk() {
        let queue = queue(MediaType::Video, 4, 4);
        queue.discard_until(100 * SECOND);
        assert_eq!(queue.first(), 3);
    }

    #[test]
    fn prune_keeps_requested_time() {
        let queue = queue(MediaType::Video, 10, 10);
        for id in 0..6 {
            load(&queue, id, 100);
        }
        let in_flight = queue.get(6).unwrap();
        in_flight.try_claim(1, 1);

        let discarded = queue.prune(3 * SECOND);
        assert_eq!(queue.last(), 2);
        assert_eq!(discarded, 5);
        assert_eq!(queue.buffer_time(), 4 * SECOND);
        assert!(!in_flight.is_claimed_by(1));
    }

    #[test]
    fn prune_with_ample_budget_keeps_lookahead() {
        let queue = queue(MediaType::Video, 10, 10);
        for id in 0..3 {
            load(&queue, id, 100);
        }
        let in_flight = queue.get(3).unwrap();
        in_flight.try_claim(1, 1);

        assert_eq!(queue.prune(100 * SECOND), 0);
        assert_eq!(queue.last(), 3);
        assert_eq!(queue.buffer_time(), 6 * SECOND);
        assert!(in_flight.is_claimed_by(1));
    }

    #[test]
    fn move_next_retires_oldest() {
        let queue = queue(MediaType::Video, 2, 2);
        load(&queue, 0, 100);
        let first = queue.current().unwrap();

        assert!(queue.move_next());
        assert_eq!(first.state(), ChunkState::Pending);
        assert_eq!(queue.first(), 1);
        assert_eq!(queue.last(), 1);
        assert!(!queue.move_next());
        assert!(!queue.move_next());
        assert_eq!(queue.first(), 2);
    }

    #[test]
    fn cursors_stay_ordered() {
        let queue = queue(MediaType::Video, 64, 8);
        let mut rng = StdRng::seed_from_u64(0x2545_f491);
        let mut previous_first = 0;
        for _ in 0..500 {
            let pick: usize = rng.random_range(0..30);
            if pick % 3 == 0 {
                queue.move_next();
            } else {
                let id = queue.first() + pick % 10;
                if let Ok(chunk) = queue.get(id) {
                    if chunk.try_claim(1, 1) {
                        chunk.install(1, Bytes::from_static(b"x"));
                    }
                    let _ = queue.add(chunk);
                }
            }
            assert!(queue.first() >= previous_first);
            assert!(queue.last() >= queue.first());
            assert!(queue.last() <= queue.capacity());
            previous_first = queue.first();
        }
    }

    #[test]
    fn next_to_download_skips_claimed() {
        let queue = queue(MediaType::Video, 5, 2);
        let first = queue.next_to_download().unwrap();
        assert_eq!(first.id, 0);
        first.try_claim(1, 1);
        assert_eq!(queue.next_to_download().unwrap().id, 1);
        queue.get(1).unwrap().try_claim(2, 1);
        assert!(queue.next_to_download().is_none());
    }

    #[test]
    fn shutdown_refuses_new_chunks() {
        let queue = queue(MediaType::Video, 4, 4);
        load(&queue, 0, 100);
        queue.shutdown();
        assert!(queue.is_shut_down());
        assert_eq!(queue.buffer_size(), 0);

        let chunk = download(&queue, 1, 1, 10);
        assert!(!queue.add(chunk).unwrap());
        assert!(queue.next_to_download().is_none());
        assert!(!queue.move_next());
    }
}
