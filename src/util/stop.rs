//! Cooperative cancellation token.
//!
//! A thread-safe, async-aware stop signal that can be cloned and shared
//! across the tasks belonging to one logical operation (a scan, a session).
//! Cancelling any clone notifies all waiters, which lets teardown release
//! every associated resource synchronously with the cancellation call.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A cooperative cancellation token.
///
/// Clones share the same underlying state, so cancelling any clone
/// notifies all waiters.
#[derive(Debug, Clone, Default)]
pub struct Stop {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl Stop {
    /// Create a new, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to all waiters.
    pub fn cancel(&self) {
        self.internal.closing.store(true, Ordering::Release);
        self.internal.notify.notify_waiters();
    }

    /// Check if cancellation has been signaled.
    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Wait for cancellation to be signaled.
    ///
    /// Returns immediately if already cancelled.
    pub async fn wait(&self) {
        // The notified future must exist before the flag is re-checked,
        // or a cancel landing in between would never wake us.
        let notified = self.internal.notify.notified();
        if self.cancelled() {
            return;
        }
        notified.await;
    }

    /// Race a future against cancellation.
    ///
    /// Returns `Some(T)` if the future completes first, `None` if
    /// cancellation wins.
    pub async fn select<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            _ = self.wait() => None,
            out = fut => Some(out),
        }
    }
}
