use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::sync::Notify;

/// Async task shutdown signaling combining `Notify` and `AtomicBool`
///
/// `notify_waiters()` only wakes tasks that are already waiting; the flag
/// lets a task that was busy between waits still observe the shutdown.
///
/// # Usage
/// ```
/// use std::time::Duration;
/// use nftwall::runtime::ShutdownSignal;
///
/// # async fn example() {
/// let signal = ShutdownSignal::new();
///
/// // In worker task:
/// if signal.wait_timeout_or_shutdown(Duration::from_millis(1)).await {
///     // shutdown requested
/// }
///
/// // In main task:
/// signal.shutdown();
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    notify: Notify,
    shutdown: AtomicBool,
}

impl ShutdownSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Wait for timeout or shutdown signal, whichever comes first
    ///
    /// Returns `true` if shutdown was signaled, `false` if timeout occurred
    pub async fn wait_timeout_or_shutdown(&self, timeout: Duration) -> bool {
        tokio::select! {
            _ = self.wait() => true,
            _ = tokio::time::sleep(timeout) => self.is_shutdown(),
        }
    }

    /// Resolve once shutdown has been signaled
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent shutdown() cannot slip between
        notified.as_mut().enable();
        if self.is_shutdown() {
            return;
        }
        notified.await;
    }

    /// Sets the shutdown flag and notifies all waiting tasks
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}
