//! One-shot event gate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// A gate that starts closed and can be opened exactly once.
///
/// Used for the connection-ready, stop, and initialize-complete signals.
/// `set` is idempotent; waiters observe the gate open at most once.
#[derive(Debug, Default)]
pub(crate) struct Event {
    set: AtomicBool,
    notify: Notify,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.set.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            // Register interest before checking the flag so a concurrent
            // `set` between the check and the await still wakes us.
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }

    /// Wait up to `timeout`; returns whether the gate opened.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}
