//! Cooperative shutdown signal shared by worker tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A clonable one-way latch. Once triggered it stays triggered; `wait`
/// returns immediately for late subscribers, so workers polling it in a
/// select loop cannot miss the signal.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    notify: Arc<Notify>,
    fired: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// A fresh, untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger the signal. Idempotent.
    pub fn trigger(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether the signal has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Wait until the signal fires.
    pub async fn wait(&self) {
        loop {
            if self.is_triggered() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register for the wakeup before re-checking the flag, so a
            // trigger landing in between cannot be missed.
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}
