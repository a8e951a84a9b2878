//! Cancellable execution scope handed to queued operations.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::Error;

/// Why a [`RunContext`] was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The scope was cancelled explicitly, either by the caller or by
    /// cancel-on-error fan-out to sibling operations.
    Cancelled,
    /// The batch-wide deadline elapsed before every operation finished.
    DeadlineExceeded,
}

impl CancelReason {
    /// Converts the reason into the error an operation should return when
    /// it observes the cancellation.
    pub fn into_error(self) -> Error {
        match self {
            Self::Cancelled => Error::Cancelled,
            Self::DeadlineExceeded => Error::DeadlineExceeded,
        }
    }
}

/// Cancellation scope passed to every queued operation.
///
/// Operations are expected to check the context at their own suspension
/// points, usually by selecting on [`RunContext::cancelled`], and bail out
/// promptly once it fires. Cloning is cheap and every clone observes the
/// same cancellation.
///
/// Cancellation is idempotent: the first reason wins and later calls to
/// [`RunContext::cancel`] have no effect.
#[derive(Debug, Clone)]
pub struct RunContext {
    state: Arc<watch::Sender<Option<CancelReason>>>,
}

impl RunContext {
    /// Creates a root context that is not cancelled and has no deadline.
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(None);
        Self {
            state: Arc::new(sender),
        }
    }

    /// Creates a derived context with its own cancellation state.
    ///
    /// The child starts out with the parent's current state, so deriving
    /// from an already-cancelled context yields a cancelled child. Later
    /// cancellation of the parent is not forwarded automatically; the
    /// coordinator owning both ends is responsible for propagating it,
    /// which guarantees the caller's own cancellation is never swallowed.
    pub fn child(&self) -> Self {
        let child = Self::new();
        if let Some(reason) = self.reason() {
            child.cancel(reason);
        }
        child
    }

    /// Cancels the context with the given reason.
    ///
    /// Idempotent: only the first call has an effect.
    pub fn cancel(&self, reason: CancelReason) {
        self.state.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    /// Returns true if the context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Returns the cancellation reason, if the context has been cancelled.
    pub fn reason(&self) -> Option<CancelReason> {
        *self.state.borrow()
    }

    /// Returns the error form of the cancellation reason, if any.
    ///
    /// Deadline expiry and cancellation surface as ordinary operation
    /// errors, not as special cases.
    pub fn error(&self) -> Option<Error> {
        self.reason().map(CancelReason::into_error)
    }

    /// Resolves once the context is cancelled, yielding the reason.
    pub async fn cancelled(&self) -> CancelReason {
        let mut receiver = self.state.subscribe();
        let result = receiver.wait_for(Option::is_some).await;
        match result {
            Ok(guard) => (*guard).unwrap_or(CancelReason::Cancelled),
            // The sender lives inside self, so the channel cannot close
            // while we are borrowed from it.
            Err(_closed) => CancelReason::Cancelled,
        }
    }

    /// Resolves once the context is cancelled, yielding the matching error.
    ///
    /// Convenience for `tokio::select!` arms that return a `Result`.
    pub async fn done_err(&self) -> Error {
        self.cancelled().await.into_error()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Duration, timeout};

    #[test]
    fn test_cancel_is_idempotent() {
        let ctx = RunContext::new();
        assert!(!ctx.is_cancelled());
        assert!(ctx.reason().is_none());

        ctx.cancel(CancelReason::DeadlineExceeded);
        ctx.cancel(CancelReason::Cancelled);

        // First reason wins.
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.reason(), Some(CancelReason::DeadlineExceeded));
        assert!(matches!(ctx.error(), Some(Error::DeadlineExceeded)));
    }

    #[test]
    fn test_clones_share_state() {
        let ctx = RunContext::new();
        let clone = ctx.clone();
        ctx.cancel(CancelReason::Cancelled);
        assert!(clone.is_cancelled());
        assert_eq!(clone.reason(), Some(CancelReason::Cancelled));
    }

    #[test]
    fn test_child_is_independent() {
        let parent = RunContext::new();
        let child = parent.child();
        child.cancel(CancelReason::Cancelled);
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let parent = RunContext::new();
        parent.cancel(CancelReason::DeadlineExceeded);
        let child = parent.child();
        assert_eq!(child.reason(), Some(CancelReason::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_cancelled_resolves_on_cancel() {
        let ctx = RunContext::new();
        let waiter = ctx.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        ctx.cancel(CancelReason::Cancelled);
        let reason = timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(reason, Ok(Ok(CancelReason::Cancelled))));
    }

    #[tokio::test]
    async fn test_done_err_maps_reason() {
        let ctx = RunContext::new();
        ctx.cancel(CancelReason::DeadlineExceeded);
        assert!(matches!(ctx.done_err().await, Error::DeadlineExceeded));
    }
}
