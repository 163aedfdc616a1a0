//! Fire-and-forget submissions with an optional completion signal.
//!
//! Every write the core forwards to the backend runs on its own tokio task.
//! The caller gets a [`Completion`] back immediately. Awaiting it yields the
//! outcome; dropping it abandons interest and the late result is discarded.

use std::fmt::Display;
use std::future::Future;

use tokio::sync::oneshot;
use tracing::warn;

use chatchat_shared::{BackendError, Result, SyncError};

/// Handle to the outcome of a background submission.
#[derive(Debug)]
#[must_use = "drop explicitly to ignore the outcome"]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Completion<T> {
    /// Wait for the backend to acknowledge or reject the request.
    pub async fn wait(self) -> Result<T> {
        self.rx
            .await
            .unwrap_or(Err(SyncError::TransportFailure(BackendError::Closed)))
    }

    /// A completion that is already resolved.
    pub fn ready(outcome: Result<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { rx }
    }
}

/// Spawn `fut` and return a handle to its result. Failures are also logged
/// here so that dropped completions still leave a diagnostic.
pub(crate) fn submit<T, E, F>(what: &'static str, fut: F) -> Completion<T>
where
    T: Send + 'static,
    E: Into<SyncError> + Display + Send + 'static,
    F: Future<Output = std::result::Result<T, E>> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let outcome = fut.await.map_err(|e| {
            warn!(op = what, error = %e, "Backend request failed");
            e.into()
        });
        // Receiver gone means the caller stopped caring.
        let _ = tx.send(outcome);
    });
    Completion { rx }
}
