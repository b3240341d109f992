use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::runtime::Runtime;
use tracing::info;

/// Builds the multi-thread runtime; `threads` overrides the worker count.
pub fn build(threads: Option<usize>) -> io::Result<Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().thread_name_fn(|| {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        format!("worker-{}", NEXT.fetch_add(1, Ordering::Relaxed))
    });
    if let Some(threads) = threads.filter(|t| *t > 0) {
        info!("custom runtime threads: {}", threads);
        builder.worker_threads(threads);
    }

    builder.build()
}
