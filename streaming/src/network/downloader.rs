use crate::buffer::{ChunkId, DownloaderId, MediaChunk, MediaType};
use crate::heuristics::DownloadReport;
use crate::network::url::{with_cache_buster, UrlGenerator};
use crate::network::{Transport, TransportError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, trace, warn};

/// Groups downloads started on behalf of one player instance.
pub type InstanceId = u64;

/// Attempts per download, the first one included.
pub const MAX_ATTEMPTS: u32 = 2;

/// Leading video chunks that bypass intermediate caches.
const CACHE_BUSTED_CHUNKS: ChunkId = 2;

pub type CompletionCallback = Arc<dyn Fn(DownloadCompletion) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloaderState {
    Created,
    Queued,
    Downloading,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    Success { bytes: u64 },
    Failed { message: String, fatal: bool },
    Aborted,
}

/// Delivered exactly once per started download.
#[derive(Debug, Clone)]
pub struct DownloadCompletion {
    pub downloader: DownloaderId,
    pub instance: InstanceId,
    pub stream_id: u32,
    pub chunk_id: ChunkId,
    pub bitrate: u64,
    pub attempts: u32,
    /// Duration of the last attempt.
    pub download_time: Duration,
    pub chunk_duration: u64,
    pub outcome: DownloadOutcome,
}

impl DownloadCompletion {
    /// Sample for the heuristics. Aborted downloads say nothing about the
    /// network.
    pub fn report(&self) -> Option<DownloadReport> {
        let (bytes, success) = match &self.outcome {
            DownloadOutcome::Success { bytes } => (*bytes, true),
            DownloadOutcome::Failed { .. } => (0, false),
            DownloadOutcome::Aborted => return None,
        };
        Some(DownloadReport {
            bitrate: self.bitrate,
            bytes,
            download_time: self.download_time,
            chunk_duration: self.chunk_duration,
            success,
        })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.outcome, DownloadOutcome::Failed { fatal: true, .. })
    }
}

/// What to fetch: one chunk of one stream at one bitrate.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub instance: InstanceId,
    pub chunk: Arc<MediaChunk>,
    pub bitrate: u64,
    pub url: String,
}

impl DownloadRequest {
    pub fn new(
        instance: InstanceId,
        chunk: Arc<MediaChunk>,
        bitrate: u64,
        urls: &dyn UrlGenerator,
    ) -> Self {
        let url = urls.chunk_url(
            chunk.stream_id,
            chunk.id,
            bitrate,
            chunk.start_time,
            chunk.duration,
        );
        Self {
            instance,
            chunk,
            bitrate,
            url,
        }
    }
}

/// Fetch of one chunk, from claim to completion.
pub struct Downloader {
    id: DownloaderId,
    instance: InstanceId,
    chunk: Arc<MediaChunk>,
    bitrate: u64,
    url: String,
    callback: CompletionCallback,
    dispatcher: Weak<Dispatcher>,
    state: Mutex<DownloaderState>,
    attempts: AtomicU32,
    aborted: AtomicBool,
    awaiting_response: AtomicBool,
    completed: AtomicBool,
    cancelled: Notify,
    attempt_started: Mutex<Option<Instant>>,
}

impl Downloader {
    pub fn id(&self) -> DownloaderId {
        self.id
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn chunk(&self) -> &Arc<MediaChunk> {
        &self.chunk
    }

    pub fn bitrate(&self) -> u64 {
        self.bitrate
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Relaxed)
    }

    pub fn state(&self) -> DownloaderState {
        *self.state.lock()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(SeqCst)
    }

    /// Aborts the download. Safe to call any number of times.
    ///
    /// A download that was not issued yet completes before this returns; an
    /// issued one is interrupted and completes from its request task.
    pub fn cancel(self: &Arc<Self>) {
        if self.aborted.swap(true, SeqCst) {
            return;
        }

        let issued = {
            let mut state = self.state.lock();
            match *state {
                DownloaderState::Created | DownloaderState::Queued => {
                    *state = DownloaderState::Aborted;
                    false
                }
                DownloaderState::Downloading => true,
                DownloaderState::Completed | DownloaderState::Aborted => return,
            }
        };

        if issued {
            trace!("downloader {}: interrupting request", self.id);
            self.cancelled.notify_one();
        } else {
            debug!("downloader {}: cancelled before issue", self.id);
            self.chunk.release(self.id);
            self.finish(DownloadOutcome::Aborted);
        }
    }

    /// Moves a queued download into flight. Returns false when it was
    /// cancelled meanwhile.
    fn begin_attempt(&self) -> bool {
        let mut state = self.state.lock();
        if *state != DownloaderState::Queued || self.aborted.load(SeqCst) {
            return false;
        }

        *state = DownloaderState::Downloading;
        self.attempts.fetch_add(1, Relaxed);
        self.awaiting_response.store(true, SeqCst);
        *self.attempt_started.lock() = Some(Instant::now());
        true
    }

    /// Handles the response of the current attempt; `None` means the
    /// request was interrupted by `cancel`.
    fn on_response(self: &Arc<Self>, result: Option<Result<Bytes, TransportError>>) {
        if !self.awaiting_response.swap(false, SeqCst) {
            error!(
                "downloader {}: response for chunk {} without a request in flight",
                self.id, self.chunk.id
            );
            return;
        }

        let result = match result {
            Some(result) if !self.is_aborted() => result,
            _ => {
                self.chunk.release(self.id);
                self.finish(DownloadOutcome::Aborted);
                return;
            }
        };

        match result {
            Ok(data) => {
                let bytes = data.len() as u64;
                if self.chunk.install(self.id, data) {
                    self.finish(DownloadOutcome::Success { bytes });
                } else {
                    debug!(
                        "downloader {}: chunk {} was reset, {} bytes dropped",
                        self.id, self.chunk.id, bytes
                    );
                    self.finish(DownloadOutcome::Aborted);
                }
            }
            Err(e) if !self.chunk.is_claimed_by(self.id) => {
                debug!(
                    "downloader {}: chunk {} was reset, dropping error: {}",
                    self.id, self.chunk.id, e
                );
                self.finish(DownloadOutcome::Aborted);
            }
            Err(e) if e.is_transient() && self.attempts() < MAX_ATTEMPTS => {
                warn!(
                    "downloader {}: chunk {} attempt {} failed: {}",
                    self.id,
                    self.chunk.id,
                    self.attempts(),
                    e
                );
                self.retry();
            }
            Err(e) => {
                let fatal = e.is_fatal();
                if fatal {
                    error!("downloader {}: chunk {}: {}", self.id, self.chunk.id, e);
                } else {
                    warn!(
                        "downloader {}: chunk {} failed after {} attempts: {}",
                        self.id,
                        self.chunk.id,
                        self.attempts(),
                        e
                    );
                }
                if !self.chunk.fail(self.id, e.to_string()) {
                    debug!(
                        "downloader {}: chunk {} was reset before the failure landed",
                        self.id, self.chunk.id
                    );
                    self.finish(DownloadOutcome::Aborted);
                    return;
                }
                self.finish(DownloadOutcome::Failed {
                    message: e.to_string(),
                    fatal,
                });
            }
        }
    }

    fn retry(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if !self.is_aborted() {
                *state = DownloaderState::Queued;
            }
        }

        match self.dispatcher.upgrade() {
            Some(dispatcher) if !self.is_aborted() => dispatcher.enqueue(self.clone()),
            _ => {
                self.chunk.release(self.id);
                self.finish(DownloadOutcome::Aborted);
            }
        }
    }

    fn finish(self: &Arc<Self>, outcome: DownloadOutcome) {
        if self.completed.swap(true, SeqCst) {
            return;
        }

        *self.state.lock() = match outcome {
            DownloadOutcome::Aborted => DownloaderState::Aborted,
            _ => DownloaderState::Completed,
        };
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.unregister(self);
        }

        let download_time = self
            .attempt_started
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default();
        (self.callback)(DownloadCompletion {
            downloader: self.id,
            instance: self.instance,
            stream_id: self.chunk.stream_id,
            chunk_id: self.chunk.id,
            bitrate: self.bitrate,
            attempts: self.attempts(),
            download_time,
            chunk_duration: self.chunk.duration,
            outcome,
        });
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("id", &self.id)
            .field("instance", &self.instance)
            .field("chunk", &self.chunk.id)
            .field("bitrate", &self.bitrate)
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish()
    }
}

#[derive(Debug)]
enum DispatchCommand {
    Drain,
    Shutdown,
}

#[derive(Debug, Default)]
struct Registry {
    instances: HashMap<InstanceId, HashMap<DownloaderId, Arc<Downloader>>>,
    pending: VecDeque<Arc<Downloader>>,
    shut_down: bool,
}

/// Owns every live download and feeds them, one at a time, to the
/// dispatch loop that issues the requests.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    registry: Mutex<Registry>,
    commands: mpsc::UnboundedSender<DispatchCommand>,
    next_id: AtomicU64,
}

impl Dispatcher {
    /// The returned loop must be spawned on the runtime for requests to go
    /// out.
    pub fn new(transport: Arc<dyn Transport>) -> (Arc<Self>, DispatchLoop) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Self {
            transport,
            registry: Mutex::new(Registry::default()),
            commands: tx,
            next_id: AtomicU64::new(1),
        });
        let dispatch_loop = DispatchLoop {
            dispatcher: dispatcher.clone(),
            commands: rx,
        };
        (dispatcher, dispatch_loop)
    }

    /// Claims the chunk and queues its download. Returns `None` when the
    /// chunk is already claimed or the dispatcher is shut down.
    pub fn start(
        self: &Arc<Self>,
        request: DownloadRequest,
        callback: CompletionCallback,
    ) -> Option<Arc<Downloader>> {
        let id = self.next_id.fetch_add(1, Relaxed);
        let chunk = request.chunk;
        if !chunk.try_claim(id, request.bitrate) {
            trace!("chunk {}: already claimed", chunk.id);
            return None;
        }

        let url = if chunk.media_type == MediaType::Video && chunk.id < CACHE_BUSTED_CHUNKS {
            with_cache_buster(&request.url)
        } else {
            request.url
        };
        let downloader = Arc::new(Downloader {
            id,
            instance: request.instance,
            chunk,
            bitrate: request.bitrate,
            url,
            callback,
            dispatcher: Arc::downgrade(self),
            state: Mutex::new(DownloaderState::Created),
            attempts: AtomicU32::new(0),
            aborted: AtomicBool::new(false),
            awaiting_response: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            cancelled: Notify::new(),
            attempt_started: Mutex::new(None),
        });

        {
            let mut registry = self.registry.lock();
            if registry.shut_down {
                drop(registry);
                downloader.chunk.release(id);
                return None;
            }
            registry
                .instances
                .entry(downloader.instance)
                .or_default()
                .insert(id, downloader.clone());
        }

        debug!(
            "downloader {}: chunk {} of stream {} at {} bps",
            id, downloader.chunk.id, downloader.chunk.stream_id, downloader.bitrate
        );
        *downloader.state.lock() = DownloaderState::Queued;
        self.enqueue(downloader.clone());
        Some(downloader)
    }

    /// Aborts every download of `instance`.
    pub fn cancel_all(&self, instance: InstanceId) -> usize {
        let downloaders: Vec<Arc<Downloader>> = self
            .registry
            .lock()
            .instances
            .get(&instance)
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default();

        for downloader in &downloaders {
            downloader.cancel();
        }
        if !downloaders.is_empty() {
            info!(
                "instance {}: cancelled {} downloads",
                instance,
                downloaders.len()
            );
        }
        downloaders.len()
    }

    /// Number of live downloads of `instance`.
    pub fn in_flight(&self, instance: InstanceId) -> usize {
        self.registry
            .lock()
            .instances
            .get(&instance)
            .map_or(0, |map| map.len())
    }

    /// Aborts everything, refuses new downloads and stops the loop.
    pub fn shutdown(&self) {
        let instances: Vec<InstanceId> = {
            let mut registry = self.registry.lock();
            registry.shut_down = true;
            registry.instances.keys().copied().collect()
        };
        for instance in instances {
            self.cancel_all(instance);
        }
        let _ = self.commands.send(DispatchCommand::Shutdown);
    }

    fn enqueue(&self, downloader: Arc<Downloader>) {
        self.registry.lock().pending.push_back(downloader);
        if self.commands.send(DispatchCommand::Drain).is_err() {
            warn!("dispatch loop is gone, download stays queued");
        }
    }

    fn unregister(&self, downloader: &Downloader) {
        let mut registry = self.registry.lock();
        if let Some(map) = registry.instances.get_mut(&downloader.instance) {
            map.remove(&downloader.id);
            if map.is_empty() {
                registry.instances.remove(&downloader.instance);
            }
        }
    }

    fn drain(self: &Arc<Self>) {
        loop {
            let next = self.registry.lock().pending.pop_front();
            match next {
                Some(downloader) => self.issue(downloader),
                None => break,
            }
        }
    }

    fn issue(self: &Arc<Self>, downloader: Arc<Downloader>) {
        if !downloader.begin_attempt() {
            trace!("downloader {}: skipped, no longer queued", downloader.id);
            return;
        }

        trace!(
            "downloader {}: attempt {} GET {}",
            downloader.id,
            downloader.attempts(),
            downloader.url
        );
        let transport = self.transport.clone();
        tokio::task::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = downloader.cancelled.notified() => None,
                result = transport.get(&downloader.url) => Some(result),
            };
            downloader.on_response(result);
        });
    }
}

/// The single task issuing every request of a dispatcher.
pub struct DispatchLoop {
    dispatcher: Arc<Dispatcher>,
    commands: mpsc::UnboundedReceiver<DispatchCommand>,
}

impl DispatchLoop {
    pub async fn run(mut self) {
        debug!("dispatch loop started");
        while let Some(command) = self.commands.recv().await {
            match command {
                DispatchCommand::Drain => self.dispatcher.drain(),
                DispatchCommand::Shutdown => break,
            }
        }
        debug!("dispatch loop stopped");
    }
}
