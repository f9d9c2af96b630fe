//! Per-call cancellation and deadline.

use crate::error::RpcError;
use listings_runtime::Shutdown;
use std::time::Duration;
use tokio::time::Instant;

/// What bounds a call from the caller's side.
///
/// A call stops retrying as soon as its context is cancelled or its
/// deadline passes, including while it is waiting out a backoff.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: Option<Shutdown>,
}

impl CallContext {
    /// A context with no deadline that is never cancelled.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Fail the call once `timeout` has elapsed from now.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Fail the call at `deadline`. An earlier existing deadline wins.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(self.deadline.map_or(deadline, |current| current.min(deadline)));
        self
    }

    /// Abort the call when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: Shutdown) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// The deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail fast if the context is already done.
    ///
    /// # Errors
    ///
    /// [`RpcError::Cancelled`] or [`RpcError::DeadlineExceeded`].
    pub fn check(&self) -> Result<(), RpcError> {
        if self.cancel.as_ref().is_some_and(Shutdown::is_triggered) {
            return Err(RpcError::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(RpcError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolve with the reason once the context is done. Never resolves for
    /// a background context.
    pub(crate) async fn done(&self) -> RpcError {
        let cancelled = async {
            match self.cancel.clone() {
                Some(mut cancel) => cancel.wait().await,
                None => std::future::pending().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = cancelled => RpcError::Cancelled,
            () = expired => RpcError::DeadlineExceeded,
        }
    }
}
