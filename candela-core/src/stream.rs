//! Handles for long-lived streaming tasks.

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Handle for a long-lived streaming task.
///
/// Lifecycle contract:
/// - Prefer [`stop`](StreamHandle::stop) to request a graceful shutdown and
///   await completion.
/// - Call [`abort`](StreamHandle::abort) for immediate, non-graceful
///   termination.
/// - If dropped without an explicit shutdown, a best-effort stop signal is
///   sent and the task is then aborted; the task may not observe the signal
///   before the abort lands.
#[derive(Debug)]
pub struct StreamHandle {
    inner: Option<JoinHandle<()>>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl StreamHandle {
    /// Create a handle around the spawned task and its stop channel.
    #[must_use]
    pub const fn new(inner: JoinHandle<()>, stop_tx: oneshot::Sender<()>) -> Self {
        Self {
            inner: Some(inner),
            stop_tx: Some(stop_tx),
        }
    }

    /// Gracefully stop the task and await its completion.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(inner) = self.inner.take() {
            let _ = inner.await;
        }
    }

    /// Force-abort the task without waiting for completion.
    pub fn abort(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.abort();
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(inner) = self.inner.take()
            && !inner.is_finished()
        {
            inner.abort();
        }
    }
}
