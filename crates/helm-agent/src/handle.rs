//! A cloneable handle for poking the loop from external code.

use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio_util::sync::CancellationToken;

/// A cloneable handle for poking the loop from external code.
///
/// Cancellation aborts in-flight work. A yield request only prevents the
/// next iteration from starting.
#[derive(Clone)]
pub struct LoopHandle {
    pub(crate) cancel: Arc<Mutex<CancellationToken>>,
    pub(crate) yield_requested: Arc<AtomicBool>,
    pub(crate) idle_notify: Arc<tokio::sync::Notify>,
    pub(crate) is_running: Arc<AtomicBool>,
}

impl LoopHandle {
    pub fn new() -> Self {
        Self {
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            yield_requested: Arc::new(AtomicBool::new(false)),
            idle_notify: Arc::new(tokio::sync::Notify::new()),
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Abort the current operation.
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }

    /// Ask the loop to stop before its next iteration.
    pub fn request_yield(&self) {
        self.yield_requested.store(true, Ordering::Release);
    }

    pub fn yield_requested(&self) -> bool {
        self.yield_requested.load(Ordering::Acquire)
    }

    /// The token for the current run
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Wait until the loop becomes idle (finishes running).
    pub async fn wait_for_idle(&self) {
        let notified = self.idle_notify.notified();
        if !self.is_running.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    /// Whether the loop is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Mark a run as started. A fresh token is installed unless the current
    /// one was cancelled while the loop was idle.
    pub(crate) fn begin(&self) {
        {
            let mut cancel = self.cancel.lock();
            if !cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
        }
        self.is_running.store(true, Ordering::Release);
    }

    pub(crate) fn finish(&self) {
        *self.cancel.lock() = CancellationToken::new();
        self.yield_requested.store(false, Ordering::Release);
        self.is_running.store(false, Ordering::Release);
        self.idle_notify.notify_waiters();
    }
}

impl Default for LoopHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yield_and_reset() {
        let handle = LoopHandle::new();
        handle.begin();
        assert!(handle.is_running());
        handle.request_yield();
        assert!(handle.yield_requested());
        handle.finish();
        assert!(!handle.yield_requested());
        assert!(!handle.is_running());
    }

    #[test]
    fn test_cancel_reaches_clones() {
        let handle = LoopHandle::new();
        handle.begin();
        let token = handle.cancel_token();
        handle.clone().cancel();
        assert!(token.is_cancelled());
        handle.finish();
        assert!(!handle.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_for_idle_returns_when_not_running() {
        let handle = LoopHandle::new();
        handle.wait_for_idle().await;
    }
}
