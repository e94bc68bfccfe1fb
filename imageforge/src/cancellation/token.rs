//! Cancellation token for cooperative cancellation.

use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

use crate::errors::BuildError;

/// Returned by suspension points interrupted by cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cancelled: {reason}")]
pub struct Cancelled {
    /// The cancellation reason.
    pub reason: String,
}

impl From<Cancelled> for BuildError {
    fn from(err: Cancelled) -> Self {
        Self::Cancelled { reason: err.reason }
    }
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    reason: RwLock<Option<String>>,
    notify: Notify,
}

/// A token for cooperative cancellation.
///
/// Clones share state, so a token can be handed to spawned workers.
/// Cancellation is idempotent - only the first cancellation reason is kept.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation with a reason and wakes every waiter.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self
            .inner
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.inner.reason.write() = Some(reason.into());
            self.inner.notify.notify_waiters();
        }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.read().clone()
    }

    /// Completes once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking the flag so a concurrent cancel
            // cannot slip between the check and the wait.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Runs a future to completion unless cancellation wins first.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the token fires before the future completes;
    /// the future is dropped in that case.
    pub async fn guard<F: Future>(&self, future: F) -> Result<F::Output, Cancelled> {
        tokio::select! {
            biased;
            () = self.cancelled() => Err(self.cancelled_error()),
            output = future => Ok(output),
        }
    }

    /// Sleeps for `duration`, returning early if cancelled.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` as soon as the token fires.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        self.guard(tokio::time::sleep(duration)).await
    }

    fn cancelled_error(&self) -> Cancelled {
        Cancelled {
            reason: self.reason().unwrap_or_else(|| "cancelled".to_string()),
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}
