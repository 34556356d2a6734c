/// Signal handling for the guard itself.
///
/// SIGINT (Ctrl-C) and SIGTERM both request a shutdown: the poll loop stops at
/// its next wait point. The renderer is a separate process group and is left
/// running.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared shutdown state, accessible from signal listeners and the poll loop.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownState>,
}

struct ShutdownState {
    requested: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    /// A signal that only fires via `request()`. No OS listeners.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownState {
                requested: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Create a signal and spawn tokio tasks listening for SIGINT and SIGTERM.
    /// Call this once at startup, inside the runtime.
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let handle = Self::new();

        let mut sigint = signal(SignalKind::interrupt())?;
        let state = handle.clone();
        tokio::spawn(async move {
            sigint.recv().await;
            tracing::warn!("caught SIGINT, stopping watchdog (render process keeps running)");
            state.request();
        });

        let mut sigterm = signal(SignalKind::terminate())?;
        let state = handle.clone();
        tokio::spawn(async move {
            sigterm.recv().await;
            tracing::warn!("caught SIGTERM, stopping watchdog (render process keeps running)");
            state.request();
        });

        Ok(handle)
    }

    /// Returns `true` once a shutdown has been requested.
    pub fn requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Mark shutdown and wake anyone waiting in `wait()`.
    pub fn request(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Wait until shutdown is requested. Returns immediately if already set.
    pub async fn wait(&self) {
        // Register before checking the flag so a concurrent `request()` can't slip between.
        let notified = self.inner.notify.notified();
        if self.requested() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
