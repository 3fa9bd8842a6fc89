/*!
 * Shared async utilities for edgelink.
 *
 * The central piece is [`OpCell`], a single-slot memoized operation future:
 * concurrent callers of the same logical operation receive the same shared
 * outcome while at most one underlying task runs.
 */
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::{Error, Result};

/// The shared handle to an in-flight or completed memoized operation
pub type OpFuture<T, E> = Shared<BoxFuture<'static, std::result::Result<T, E>>>;

/// A single-slot memoized operation future.
///
/// The slot holds the shared future of the current operation attempt. A
/// caller either joins the in-flight attempt or, when the slot is empty,
/// installs a fresh one. The operation body is expected to call
/// [`OpCell::clear`] on failure so a later call can retry; a successful
/// outcome stays memoized until an explicit reset.
pub struct OpCell<T, E> {
    slot: Mutex<Option<OpFuture<T, E>>>,
}

impl<T, E> OpCell<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create an empty cell
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Join the in-flight operation, or install and share a fresh one
    pub fn get_or_run<F>(&self, run: F) -> OpFuture<T, E>
    where
        F: FnOnce() -> BoxFuture<'static, std::result::Result<T, E>>,
    {
        let mut slot = self.lock();
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }
        let fresh = run().shared();
        *slot = Some(fresh.clone());
        fresh
    }

    /// Drop the memoized outcome so the next call runs again
    pub fn clear(&self) {
        *self.lock() = None;
    }

    /// Whether an attempt is memoized (in flight or completed)
    pub fn is_set(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<OpFuture<T, E>>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T, E> Default for OpCell<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for OpCell<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = self
            .slot
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false);
        f.debug_struct("OpCell").field("set", &set).finish()
    }
}

/// Await a future with a timeout; a zero duration means no timeout
pub async fn with_timeout<F>(duration: Duration, fut: F) -> Result<F::Output>
where
    F: Future,
{
    if duration.is_zero() {
        return Ok(fut.await);
    }
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| Error::timeout(format!("Operation timed out after {:?}", duration)))
}

/// Spawn a fire-and-forget task, logging its failure instead of surfacing it
pub fn spawn_and_log<F, E>(task: impl Into<String>, fut: F) -> JoinHandle<()>
where
    F: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let name = task.into();
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            warn!("Task {} failed: {}", name, e);
        }
    })
}
