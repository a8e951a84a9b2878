//! Synchronized wrapper for sharing a group across tasks.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::context::RunContext;
use crate::error::Result;
use crate::group::{Group, Outcome};

/// A [`Group`] that can be configured and queued from multiple tasks.
///
/// `Group` itself takes `&mut self` so single-task callers pay no locking
/// overhead. `SharedGroup` is the synchronized variant: every method locks
/// an internal mutex, and [`SharedGroup::wait`] / [`SharedGroup::wait_lax`]
/// hold that lock for the whole batch, so configuration attempted while a
/// wait is in progress blocks until the batch finishes.
pub struct SharedGroup<T> {
    inner: Mutex<Group<T>>,
}

impl<T: Send + 'static> Default for SharedGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> SharedGroup<T> {
    /// Creates an empty shared group with default configuration.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Group::new()),
        }
    }

    /// See [`Group::set_max_concurrent`].
    pub async fn set_max_concurrent(&self, limit: usize) {
        self.inner.lock().await.set_max_concurrent(limit);
    }

    /// See [`Group::set_cancel_on_error`].
    pub async fn set_cancel_on_error(&self, cancel: bool) {
        self.inner.lock().await.set_cancel_on_error(cancel);
    }

    /// See [`Group::set_timeout`].
    pub async fn set_timeout(&self, timeout: Duration) {
        self.inner.lock().await.set_timeout(timeout);
    }

    /// See [`Group::queue`].
    pub async fn queue<F, Fut>(&self, operation: F)
    where
        F: FnOnce(RunContext, usize) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.inner.lock().await.queue(operation);
    }

    /// Number of operations currently queued.
    pub async fn queued(&self) -> usize {
        self.inner.lock().await.queued()
    }

    /// See [`Group::wait`]. Holds the group lock until the batch finishes.
    ///
    /// # Errors
    /// Returns an error if any operation fails, per the configured policy.
    pub async fn wait(&self, ctx: &RunContext) -> Result<Vec<T>> {
        self.inner.lock().await.wait(ctx).await
    }

    /// See [`Group::wait_lax`]. Holds the group lock until the batch
    /// finishes.
    pub async fn wait_lax(&self, ctx: &RunContext) -> Vec<Outcome<T>> {
        self.inner.lock().await.wait_lax(ctx).await
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, reason = "Test code is allowed to use expect")]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_queue_from_multiple_tasks() {
        let group: Arc<SharedGroup<usize>> = Arc::new(SharedGroup::new());

        let mut handles = Vec::new();
        for _task in 0..4usize {
            let shared = Arc::clone(&group);
            handles.push(tokio::spawn(async move {
                for _slot in 0..8usize {
                    shared
                        .queue(|_ctx, index| async move { Ok(index) })
                        .await;
                }
            }));
        }
        for handle in handles {
            handle.await.expect("queueing task");
        }
        assert_eq!(group.queued().await, 32);

        let values = group.wait(&RunContext::new()).await.expect("batch");
        assert_eq!(values, (0..32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_configuration_passthrough() {
        let group: SharedGroup<i32> = SharedGroup::new();
        group.set_max_concurrent(2).await;
        group.set_cancel_on_error(true).await;
        group.set_timeout(Duration::from_secs(1)).await;
        group.queue(|_ctx, _index| async move { Ok(5) }).await;
        let values = group.wait(&RunContext::new()).await.expect("batch");
        assert_eq!(values, vec![5]);
    }
}
