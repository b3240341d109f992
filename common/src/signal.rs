use std::io;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

/// Broadcasts on `notifier` when the process gets SIGINT, SIGTERM,
/// SIGQUIT or SIGHUP. Must be called from within the runtime.
pub fn listen(notifier: Arc<Notify>) -> io::Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut hup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("received interrupt signal"),
            _ = hup.recv() => info!("received hup signal"),
            _ = terminate.recv() => info!("received terminate signal"),
            _ = quit.recv() => info!("received quit signal"),
        }

        broadcast(&notifier);
    }))
}

/// Wakes everyone waiting on `notifier` and leaves a permit behind for a
/// waiter that only subscribes afterwards.
pub fn broadcast(notifier: &Notify) {
    notifier.notify_waiters();
    notifier.notify_one();
}
