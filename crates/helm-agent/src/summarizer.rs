//! Background summarizer: a small state machine around one spawned task

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarizerState {
    Idle,
    InProgress,
    Completed,
    Failed,
}

type SharedTask = Shared<BoxFuture<'static, ()>>;

struct Inner<T> {
    state: SummarizerState,
    result: Option<T>,
    error: Option<String>,
    /// Bumped by every start and cancel; a task only commits if it still matches
    epoch: u64,
    cancel: CancellationToken,
    task: Option<SharedTask>,
}

/// Runs one slow job at a time off the interactive path.
///
/// Clones share state.
pub struct BackgroundSummarizer<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for BackgroundSummarizer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for BackgroundSummarizer<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: SummarizerState::Idle,
                result: None,
                error: None,
                epoch: 0,
                cancel: CancellationToken::new(),
                task: None,
            })),
        }
    }
}

impl<T: Send + 'static> BackgroundSummarizer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SummarizerState {
        self.inner.lock().state
    }

    /// Error from the last failed run, until it is consumed
    pub fn error(&self) -> Option<String> {
        self.inner.lock().error.clone()
    }

    /// Start `work` unless a run is in progress or a result awaits
    /// consumption. Returns whether it started.
    pub fn start<F, Fut>(&self, work: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let epoch = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, SummarizerState::Idle | SummarizerState::Failed) {
                return false;
            }
            inner.epoch += 1;
            inner.state = SummarizerState::InProgress;
            inner.result = None;
            inner.error = None;
            inner.cancel = cancel.clone();
            inner.epoch
        };

        let fut = work(cancel);
        let shared = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let outcome = fut.await;
            let mut inner = shared.lock();
            if inner.epoch != epoch {
                tracing::debug!(epoch, "discarding stale summarization result");
                return;
            }
            match outcome {
                Ok(value) => {
                    inner.result = Some(value);
                    inner.state = SummarizerState::Completed;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "background summarization failed");
                    inner.error = Some(e.to_string());
                    inner.state = SummarizerState::Failed;
                }
            }
        });

        let task = async move {
            let _ = handle.await;
        }
        .boxed()
        .shared();

        let mut inner = self.inner.lock();
        if inner.epoch == epoch {
            inner.task = Some(task);
        }
        true
    }

    /// Wait for the in-flight run, if any
    pub async fn wait_for_completion(&self) {
        let task = self.inner.lock().task.clone();
        if let Some(task) = task {
            task.await;
        }
    }

    /// Take the result and go back to Idle.
    ///
    /// Returns None without touching anything while a run is in progress. A
    /// failed run is reset too, yielding None.
    pub fn consume_and_reset(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        match inner.state {
            SummarizerState::Idle | SummarizerState::InProgress => None,
            SummarizerState::Completed | SummarizerState::Failed => {
                inner.state = SummarizerState::Idle;
                inner.task = None;
                inner.error = None;
                inner.result.take()
            }
        }
    }

    /// Signal cancellation and return to Idle immediately
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        inner.cancel.cancel();
        inner.state = SummarizerState::Idle;
        inner.result = None;
        inner.error = None;
        inner.task = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_completed_result_consumed_once() {
        let summarizer = BackgroundSummarizer::new();
        assert!(summarizer.start(|_| async { Ok("summary".to_string()) }));
        summarizer.wait_for_completion().await;

        assert_eq!(summarizer.state(), SummarizerState::Completed);
        assert_eq!(summarizer.consume_and_reset().as_deref(), Some("summary"));
        assert_eq!(summarizer.state(), SummarizerState::Idle);
        assert_eq!(summarizer.consume_and_reset(), None);
    }

    #[tokio::test]
    async fn test_consume_while_in_progress_is_noop() {
        let summarizer = BackgroundSummarizer::new();
        let (tx, rx) = oneshot::channel::<()>();
        summarizer.start(|_| async move {
            let _ = rx.await;
            Ok(1u32)
        });

        assert_eq!(summarizer.consume_and_reset(), None);
        assert_eq!(summarizer.state(), SummarizerState::InProgress);

        let _ = tx.send(());
        summarizer.wait_for_completion().await;
        assert_eq!(summarizer.consume_and_reset(), Some(1));
    }

    #[tokio::test]
    async fn test_cancel_discards_late_result() {
        let summarizer = BackgroundSummarizer::new();
        let (tx, rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let observed_cancel = Arc::new(AtomicUsize::new(0));
        let flag = observed_cancel.clone();

        summarizer.start(move |cancel| async move {
            let _ = rx.await;
            if cancel.is_cancelled() {
                flag.fetch_add(1, Ordering::SeqCst);
            }
            let _ = done_tx.send(());
            Ok("late".to_string())
        });

        summarizer.cancel();
        assert_eq!(summarizer.state(), SummarizerState::Idle);

        let _ = tx.send(());
        let _ = done_rx.await;
        // Let the spawned task attempt its commit
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(observed_cancel.load(Ordering::SeqCst), 1);
        assert_eq!(summarizer.state(), SummarizerState::Idle);
        assert_eq!(summarizer.consume_and_reset(), None);
    }

    #[tokio::test]
    async fn test_second_start_while_running_is_ignored() {
        let summarizer = BackgroundSummarizer::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel::<()>();

        let counter = runs.clone();
        assert!(summarizer.start(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                let _ = rx.await;
                Ok("first".to_string())
            }
        }));
        let counter = runs.clone();
        assert!(!summarizer.start(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok("second".to_string()) }
        }));

        let _ = tx.send(());
        summarizer.wait_for_completion().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(summarizer.consume_and_reset().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_failed_run_can_be_retried() {
        let summarizer: BackgroundSummarizer<String> = BackgroundSummarizer::new();
        summarizer.start(|_| async { Err(Error::Summarization("model refused".into())) });
        summarizer.wait_for_completion().await;
        assert_eq!(summarizer.state(), SummarizerState::Failed);
        assert!(summarizer.error().unwrap().contains("model refused"));

        assert!(summarizer.start(|_| async { Ok("retry".to_string()) }));
        summarizer.wait_for_completion().await;
        assert_eq!(summarizer.consume_and_reset().as_deref(), Some("retry"));
    }

    #[tokio::test]
    async fn test_consume_after_failure_resets_to_idle() {
        let summarizer: BackgroundSummarizer<String> = BackgroundSummarizer::new();
        summarizer.start(|_| async { Err(Error::Summarization("timeout".into())) });
        summarizer.wait_for_completion().await;
        assert_eq!(summarizer.state(), SummarizerState::Failed);

        assert_eq!(summarizer.consume_and_reset(), None);
        assert_eq!(summarizer.state(), SummarizerState::Idle);
        assert_eq!(summarizer.error(), None);
        assert_eq!(summarizer.consume_and_reset(), None);
    }

    #[tokio::test]
    async fn test_cancel_discards_late_failure() {
        let summarizer: BackgroundSummarizer<String> = BackgroundSummarizer::new();
        let (tx, rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel::<()>();

        summarizer.start(move |_| async move {
            let _ = rx.await;
            let _ = done_tx.send(());
            Err(Error::Summarization("late failure".into()))
        });

        summarizer.cancel();
        let _ = tx.send(());
        let _ = done_rx.await;
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(summarizer.state(), SummarizerState::Idle);
        assert_eq!(summarizer.error(), None);
        assert_eq!(summarizer.consume_and_reset(), None);
    }

    #[tokio::test]
    async fn test_wait_without_start_returns() {
        let summarizer: BackgroundSummarizer<String> = BackgroundSummarizer::new();
        summarizer.wait_for_completion().await;
        assert_eq!(summarizer.state(), SummarizerState::Idle);
    }
}
