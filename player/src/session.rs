use crate::config::{Settings, StreamSource};
use crate::error::PlayerError;
use crate::report::{SessionEnd, SessionReport, StreamReport};
use std::sync::Arc;
use std::time::Instant;
use streaming::buffer::{secs_to_ticks, ticks_to_secs};
use streaming::network::{CompletionCallback, InstanceId, TemplateUrlGenerator};
use streaming::{
    ChunkState, ChunkTiming, Dispatcher, DownloadCompletion, DownloadOutcome, DownloadRequest,
    Heuristics, MediaChunkQueue, Transport, UrlGenerator,
};
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const INSTANCE: InstanceId = 1;

/// Playback state of one stream.
struct StreamSession {
    id: u32,
    queue: Arc<MediaChunkQueue>,
    in_flight: usize,
    /// Seek offset to apply once the first chunk arrives.
    start_offset: u64,
    started: bool,
    stalled: bool,
    finished: bool,
    last_bitrate: Option<u64>,
    report: StreamReport,
}

impl StreamSession {
    fn new(source: &StreamSource, max_buffer_size: f64) -> Result<Self, PlayerError> {
        let chunk_ticks = secs_to_ticks(source.chunk_duration.as_secs_f64()).max(1);
        let timings = ChunkTiming::uniform(source.chunks, chunk_ticks);
        let max_buffered = (secs_to_ticks(max_buffer_size) / chunk_ticks) as usize + 1;
        let queue = MediaChunkQueue::new(source.id, source.media_type, &timings, max_buffered)?;

        Ok(Self {
            id: source.id,
            queue: Arc::new(queue),
            in_flight: 0,
            start_offset: 0,
            started: false,
            stalled: false,
            finished: false,
            last_bitrate: None,
            report: StreamReport::new(source.id, source.media_type),
        })
    }

    /// Consumes `elapsed` ticks of buffered media.
    fn play(&mut self, mut elapsed: u64) {
        while !self.finished {
            let chunk = match self.queue.current() {
                Some(chunk) => chunk,
                None => {
                    if self.queue.first() >= self.queue.capacity() {
                        self.finish();
                    } else {
                        self.stall();
                    }
                    break;
                }
            };

            let snapshot = chunk.snapshot();
            match snapshot.state {
                ChunkState::Error => {
                    warn!("stream {}: skipping failed chunk {}", self.id, chunk.id);
                    self.report.skipped_chunks += 1;
                    self.advance();
                }
                state if state.is_downloaded() => {
                    if self.stalled {
                        info!("stream {}: playback resumed at chunk {}", self.id, chunk.id);
                        self.stalled = false;
                    }
                    self.started = true;
                    if self.start_offset > 0 {
                        chunk.seek_within(self.start_offset);
                        self.start_offset = 0;
                        continue;
                    }
                    if elapsed == 0 && snapshot.duration_left > 0 {
                        break;
                    }

                    let step = elapsed.min(snapshot.duration_left);
                    let bytes = if chunk.duration == 0 {
                        0
                    } else {
                        (snapshot.length as u128 * step as u128 / chunk.duration as u128) as u64
                    };
                    chunk.advance(bytes, step);
                    elapsed -= step;
                    if snapshot.duration_left == step {
                        self.advance();
                    }
                }
                _ => {
                    self.stall();
                    break;
                }
            }
        }
        self.queue.update_buffer_sizes();
    }

    fn advance(&mut self) {
        if !self.queue.move_next() {
            self.finish();
        }
    }

    fn stall(&mut self) {
        if self.started && !self.stalled {
            debug!(
                "stream {}: stalled at chunk {}",
                self.id,
                self.queue.first()
            );
            self.report.stalls += 1;
        }
        self.stalled = true;
    }

    fn finish(&mut self) {
        if !self.finished {
            info!("stream {}: end of stream", self.id);
            self.finished = true;
        }
    }
}

/// Shared pieces every stream uses.
struct Core {
    heuristics: Heuristics,
    dispatcher: Arc<Dispatcher>,
    urls: TemplateUrlGenerator,
    callback: CompletionCallback,
    max_concurrent: usize,
    max_buffer: u64,
}

impl Core {
    /// Starts downloads until the stream has enough in flight or buffered.
    fn fill(&self, stream: &mut StreamSession) -> Result<(), PlayerError> {
        while !stream.finished
            && stream.in_flight < self.max_concurrent
            && stream.queue.buffer_time() < self.max_buffer
        {
            let chunk = match stream.queue.next_to_download() {
                Some(chunk) => chunk,
                None => break,
            };

            let bitrate = self.heuristics.next_bitrate(stream.id, Instant::now())?;
            if stream.last_bitrate.is_some_and(|last| last != bitrate) {
                stream.report.bitrate_switches += 1;
            }
            stream.last_bitrate = Some(bitrate);

            let urls: &dyn UrlGenerator = &self.urls;
            let request = DownloadRequest::new(INSTANCE, chunk, bitrate, urls);
            match self.dispatcher.start(request, self.callback.clone()) {
                Some(_) => stream.in_flight += 1,
                None => break,
            }
        }
        Ok(())
    }

    fn on_completion(
        &self,
        streams: &mut [StreamSession],
        completion: DownloadCompletion,
    ) -> Result<(), PlayerError> {
        let stream = match streams.iter_mut().find(|s| s.id == completion.stream_id) {
            Some(stream) => stream,
            None => {
                debug!("completion for unknown stream {}", completion.stream_id);
                return Ok(());
            }
        };
        stream.in_flight = stream.in_flight.saturating_sub(1);
        stream.report.record(&completion);

        if let Some(report) = completion.report() {
            self.heuristics
                .on_download_completed(stream.id, report, Instant::now())?;
        }
        if let DownloadOutcome::Failed {
            message,
            fatal: true,
        } = &completion.outcome
        {
            return Err(PlayerError::DownloadError(format!(
                "stream {} chunk {}: {}",
                stream.id, completion.chunk_id, message
            )));
        }

        if completion.outcome != DownloadOutcome::Aborted {
            let slot = stream.queue.get(completion.chunk_id)?;
            stream.queue.add(slot)?;
        }
        Ok(())
    }
}

/// Downloads every configured stream while simulating playback.
pub struct Session {
    settings: Arc<Settings>,
    transport: Arc<dyn Transport>,
    shutdown: Arc<Notify>,
}

impl Session {
    pub fn new(
        settings: Arc<Settings>,
        transport: Arc<dyn Transport>,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            settings,
            transport,
            shutdown,
        }
    }

    /// Runs until every stream played out, the time limit hits, shutdown is
    /// signalled or a stream fails. Only setup errors are returned as `Err`;
    /// failures while running end up in the report.
    pub async fn run(self) -> Result<SessionReport, PlayerError> {
        let settings = &self.settings;
        let started = Instant::now();
        let shutdown = self.shutdown.clone();
        let notified = shutdown.notified();
        tokio::pin!(notified);

        let heuristics = Heuristics::new(settings.heuristics.clone());
        let mut streams = Vec::with_capacity(settings.source.streams.len());
        for source in &settings.source.streams {
            heuristics.register_stream(source.id, source.media_type, &source.bitrates)?;
            streams.push(StreamSession::new(source, settings.heuristics.max_buffer_size)?);
        }

        if let Some(position) = settings.playback.start_position {
            let seek = secs_to_ticks(position.as_secs_f64());
            for stream in streams.iter_mut() {
                stream.start_offset = stream.queue.discard_until(seek);
                heuristics.reset(stream.id, true)?;
                info!(
                    "stream {}: starting at chunk {} (+{:.3}s)",
                    stream.id,
                    stream.queue.first(),
                    ticks_to_secs(stream.start_offset)
                );
            }
        }

        let (dispatcher, dispatch_loop) = Dispatcher::new(self.transport.clone());
        let dispatch_task = tokio::spawn(dispatch_loop.run());

        let (tx, mut completions) = mpsc::unbounded_channel();
        let callback: CompletionCallback = Arc::new(move |completion| {
            let _ = tx.send(completion);
        });
        let core = Core {
            heuristics,
            dispatcher: dispatcher.clone(),
            urls: TemplateUrlGenerator::new(&settings.source.base_url, &settings.source.url_template),
            callback,
            max_concurrent: settings.download.max_concurrent,
            max_buffer: secs_to_ticks(settings.heuristics.max_buffer_size),
        };

        let time_limit = settings.playback.max_duration;
        let limit = async move {
            match time_limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(limit);

        let mut ticker = tokio::time::interval(settings.playback.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();

        let result = loop {
            if let Err(e) = fill_all(&core, &mut streams) {
                break Err(e);
            }
            if streams.iter().all(|s| s.finished) {
                break Ok(SessionEnd::Completed);
            }

            tokio::select! {
                _ = &mut notified => break Ok(SessionEnd::Interrupted),
                _ = &mut limit => break Ok(SessionEnd::TimeLimit),
                Some(completion) = completions.recv() => {
                    if let Err(e) = core.on_completion(&mut streams, completion) {
                        break Err(e);
                    }
                }
                _ = ticker.tick() => {
                    let elapsed = secs_to_ticks(last_tick.elapsed().as_secs_f64());
                    last_tick = Instant::now();
                    for stream in streams.iter_mut() {
                        stream.play(elapsed);
                        let level = ticks_to_secs(stream.queue.buffer_time());
                        if let Err(e) = core.heuristics.on_buffer_level(stream.id, level) {
                            warn!("stream {}: {}", stream.id, e);
                        }
                    }
                }
            }
        };

        dispatcher.cancel_all(INSTANCE);
        dispatcher.shutdown();
        if let Err(e) = dispatch_task.await {
            warn!("dispatch loop: {}", e);
        }

        let (end, error) = match result {
            Ok(end) => (end, None),
            Err(e) => (SessionEnd::Failed, Some(e.to_string())),
        };
        let mut reports = Vec::with_capacity(streams.len());
        for stream in streams {
            stream.queue.shutdown();
            let mut report = stream.report;
            report.final_bitrate = stream.last_bitrate;
            reports.push(report);
        }

        let report = SessionReport {
            end,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
            streams: reports,
        };
        info!(
            "session ended ({:?}) after {} ms, {} bytes downloaded",
            report.end,
            report.duration_ms,
            report.total_bytes()
        );
        Ok(report)
    }
}

fn fill_all(core: &Core, streams: &mut [StreamSession]) -> Result<(), PlayerError> {
    for stream in streams.iter_mut() {
        core.fill(stream)?;
    }
    Ok(())
}
