//! Bounded concurrent task group.

use std::future::{Future, pending};
use std::mem::{replace, take};
use std::panic::resume_unwind;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::context::{CancelReason, RunContext};
use crate::error::{Error, ErrorList, Result};

/// A queued unit of work. Receives the execution scope and its 0-based
/// submission index, and produces a value or an error.
type QueuedOperation<T> =
    Box<dyn FnOnce(RunContext, usize) -> BoxFuture<'static, Result<T>> + Send>;

/// Per-operation record produced by [`Group::wait_lax`].
#[derive(Debug)]
pub struct Outcome<T> {
    /// The value or error the operation returned.
    pub result: Result<T>,
    index: usize,
}

impl<T> Outcome<T> {
    /// 0-based submission index of the operation that produced this outcome.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Consumes the outcome, yielding the operation's result.
    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

/// Coordinates a batch of independent operations running concurrently as
/// part of one overall operation.
///
/// A default `Group` places no limit on concurrency, does not cancel on
/// error, and has no timeout. Operations are queued with [`Group::queue`]
/// and executed by [`Group::wait`] or [`Group::wait_lax`], which drain the
/// queue so the group can be reused for a fresh batch.
///
/// Configuration and queueing take `&mut self`, so exclusive access is
/// enforced at compile time with no locking overhead. Callers that need to
/// share a group across tasks can use
/// [`SharedGroup`](crate::shared::SharedGroup) instead.
pub struct Group<T> {
    max_concurrent: usize,
    cancel_on_error: bool,
    timeout: Option<Duration>,
    queue: Vec<QueuedOperation<T>>,
}

/// Submission-ordered results plus the submission indices of every failure
/// in the order those failures completed.
type DrainOutput<T> = (Vec<Result<T>>, Vec<usize>);

impl<T: Send + 'static> Group<T> {
    /// Creates an empty group with no concurrency limit, no cancel-on-error,
    /// and no timeout.
    pub fn new() -> Self {
        Self {
            max_concurrent: 0,
            cancel_on_error: false,
            timeout: None,
            queue: Vec::new(),
        }
    }

    /// Sets the maximum number of operations allowed to run simultaneously.
    /// A value of zero removes the limit.
    pub fn set_max_concurrent(&mut self, limit: usize) {
        self.max_concurrent = limit;
    }

    /// Controls how the group behaves when an operation fails.
    ///
    /// If true, the first error cancels every other in-flight operation and
    /// [`Group::wait`] returns that error alone. If false, all operations
    /// run to completion and [`Group::wait`] returns an
    /// [`Error::Aggregate`] listing each failure.
    pub fn set_cancel_on_error(&mut self, cancel: bool) {
        self.cancel_on_error = cancel;
    }

    /// Sets a deadline for the whole batch, after which in-flight operations
    /// are cancelled. A zero duration removes the timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = if timeout.is_zero() {
            None
        } else {
            Some(timeout)
        };
    }

    /// Removes any configured timeout.
    pub fn clear_timeout(&mut self) {
        self.timeout = None;
    }

    /// Queues an operation to be run as part of the next batch.
    ///
    /// The operation receives a [`RunContext`] it should observe for
    /// cancellation, and its 0-based submission index. Queue as many
    /// operations as desired, then execute them with [`Group::wait`] or
    /// [`Group::wait_lax`].
    pub fn queue<F, Fut>(&mut self, operation: F)
    where
        F: FnOnce(RunContext, usize) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.queue
            .push(Box::new(move |ctx, index| Box::pin(operation(ctx, index))));
    }

    /// Number of operations currently queued.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Executes every queued operation, each on its own task, and waits for
    /// all of them to finish.
    ///
    /// Returned values are in the same order the operations were queued,
    /// never in completion order. On failure the value slice is dropped and
    /// an error is returned instead: the first error observed (in
    /// completion order) when cancel-on-error is set, otherwise an
    /// [`Error::Aggregate`] listing every failure in completion order. A
    /// lone failure is returned as-is rather than wrapped in an aggregate.
    ///
    /// `wait` never returns while an operation is still running, even after
    /// cancel-on-error or the batch deadline has fired; it always waits for
    /// every in-flight operation to observe the cancellation and exit. The
    /// queue is cleared on return so the group can be reused.
    ///
    /// # Errors
    /// Returns an error if any operation fails, per the configured policy.
    pub async fn wait(&mut self, ctx: &RunContext) -> Result<Vec<T>> {
        let cancel_on_error = self.cancel_on_error;
        let (mut results, failed) = self.run_all(ctx, false).await;
        if failed.is_empty() {
            let mut values = Vec::with_capacity(results.len());
            for result in results {
                values.push(result?);
            }
            return Ok(values);
        }
        if cancel_on_error {
            if let Some(&first) = failed.first() {
                return Err(take_failure(&mut results, first));
            }
        }
        let mut failures: Vec<Error> = failed
            .into_iter()
            .map(|index| take_failure(&mut results, index))
            .collect();
        if failures.len() == 1 {
            if let Some(error) = failures.pop() {
                return Err(error);
            }
        }
        Err(Error::Aggregate(ErrorList::from(failures)))
    }

    /// Like [`Group::wait`], but always waits for every operation and
    /// returns the full per-operation outcome list, ordered by submission
    /// index, with no aggregation.
    ///
    /// Cancel-on-error does not apply here: a failing operation never
    /// cancels its siblings, and every individual outcome is preserved for
    /// inspection.
    pub async fn wait_lax(&mut self, ctx: &RunContext) -> Vec<Outcome<T>> {
        let (results, _failed) = self.run_all(ctx, true).await;
        results
            .into_iter()
            .enumerate()
            .map(|(index, result)| Outcome { result, index })
            .collect()
    }

    /// Shared implementation of [`Group::wait`] and [`Group::wait_lax`]:
    /// spawns the queued operations and drains exactly one result per
    /// operation.
    async fn run_all(&mut self, ctx: &RunContext, lax: bool) -> DrainOutput<T> {
        let operations = take(&mut self.queue);
        let total = operations.len();
        let cancel_siblings = self.cancel_on_error && !lax;
        debug!(
            total,
            max_concurrent = self.max_concurrent,
            cancel_on_error = cancel_siblings,
            "starting batch"
        );

        // Derive a scope the group can cancel without touching the caller's
        // context. When neither a timeout nor cancel-on-error is in play the
        // operations run under the caller's scope unmodified.
        let needs_child = self.timeout.is_some() || cancel_siblings;
        let run_ctx = if needs_child { ctx.child() } else { ctx.clone() };

        let semaphore =
            (self.max_concurrent > 0).then(|| Arc::new(Semaphore::new(self.max_concurrent)));

        let mut join_set: JoinSet<(usize, Result<T>)> = JoinSet::new();
        for (index, operation) in operations.into_iter().enumerate() {
            let op_ctx = run_ctx.clone();
            let op_semaphore = semaphore.as_ref().map(Arc::clone);
            join_set.spawn(async move {
                // Acquire a cap slot before invoking the operation; the
                // permit is released when the task completes.
                let _permit = match op_semaphore {
                    Some(sem) => match sem.acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(closed) => return (index, Err(Error::Other(closed.to_string()))),
                    },
                    None => None,
                };
                (index, operation(op_ctx, index).await)
            });
        }

        let mut slots: Vec<Option<Result<T>>> = Vec::with_capacity(total);
        slots.resize_with(total, || None);
        let mut failed: Vec<usize> = Vec::new();
        let mut deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut watch_parent = needs_child;
        let mut collected = 0usize;

        while collected < total {
            tokio::select! {
                joined = join_set.join_next() => {
                    let Some(joined) = joined else {
                        // Every task has finished; slots left empty are
                        // backfilled as cancelled below.
                        break;
                    };
                    match joined {
                        Ok((index, result)) => {
                            collected += 1;
                            debug!(index, ok = result.is_ok(), "operation finished");
                            if result.is_err() {
                                if failed.is_empty() && cancel_siblings {
                                    warn!(index, "operation failed, cancelling in-flight siblings");
                                    run_ctx.cancel(CancelReason::Cancelled);
                                    deadline = None;
                                    watch_parent = false;
                                }
                                failed.push(index);
                            }
                            if let Some(slot) = slots.get_mut(index) {
                                *slot = Some(result);
                            }
                        }
                        Err(join_error) => {
                            if join_error.is_panic() {
                                // An operation panic is an engineering defect;
                                // it fails loudly instead of becoming an error
                                // value.
                                resume_unwind(join_error.into_panic());
                            }
                            collected += 1;
                        }
                    }
                }
                () = wait_for_deadline(deadline), if deadline.is_some() => {
                    warn!("batch deadline exceeded, cancelling in-flight operations");
                    run_ctx.cancel(CancelReason::DeadlineExceeded);
                    deadline = None;
                }
                reason = ctx.cancelled(), if watch_parent => {
                    warn!(?reason, "caller scope cancelled, propagating to batch");
                    run_ctx.cancel(reason);
                    deadline = None;
                    watch_parent = false;
                }
            }
        }

        let mut results = Vec::with_capacity(total);
        for (index, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(result) => results.push(result),
                None => {
                    failed.push(index);
                    results.push(Err(Error::Cancelled));
                }
            }
        }
        debug!(total, failures = failed.len(), "batch complete");
        (results, failed)
    }
}

impl<T: Send + 'static> Default for Group<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleeps until the batch deadline, or forever when no timeout is set.
/// Only polled behind an `is_some` guard.
async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

/// Extracts the error recorded at `index`, leaving a placeholder behind.
fn take_failure<T>(results: &mut [Result<T>], index: usize) -> Error {
    match results.get_mut(index) {
        Some(slot) => match replace(slot, Err(Error::Cancelled)) {
            Err(error) => error,
            Ok(_value) => Error::Other("operation recorded as failed but succeeded".to_owned()),
        },
        None => Error::Other("failure index out of range".to_owned()),
    }
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    reason = "Test code is allowed to use expect and panic"
)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_wait_empty_queue() {
        let mut group: Group<i32> = Group::new();
        let values = group.wait(&RunContext::new()).await.expect("empty batch");
        assert!(values.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_wait_returns_submission_order() {
        let mut group = Group::new();
        for index in 0..5u64 {
            group.queue(move |_ctx, queued_index| async move {
                // Later operations sleep less so they finish first, proving
                // the returned order is submission order.
                sleep(Duration::from_millis(50 / (queued_index as u64 + 1))).await;
                Ok(index)
            });
        }
        let values = group.wait(&RunContext::new()).await.expect("batch");
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_wait_collects_all_errors() {
        let mut group = Group::new();
        for index in 0..5usize {
            group.queue(move |_ctx, _queued_index| async move {
                if index % 2 == 0 {
                    Err(Error::Other(format!("error {index}")))
                } else {
                    Ok(index)
                }
            });
        }
        let error = group
            .wait(&RunContext::new())
            .await
            .expect_err("batch should fail");
        let Error::Aggregate(errors) = error else {
            panic!("expected aggregate error, got {error}");
        };
        assert_eq!(errors.len(), 3);
        let rendered = errors.to_string();
        assert!(rendered.contains("error 0"));
        assert!(rendered.contains("error 2"));
        assert!(rendered.contains("error 4"));
    }

    #[tokio::test]
    async fn test_single_failure_is_not_wrapped() {
        let mut group = Group::new();
        group.queue(|_ctx, _index| async move { Ok(1i32) });
        group.queue(|_ctx, _index| async move { Err(Error::Other("lone failure".to_owned())) });
        let error = group
            .wait(&RunContext::new())
            .await
            .expect_err("batch should fail");
        assert!(matches!(error, Error::Other(_)));
        assert_eq!(error.to_string(), "lone failure");
    }

    #[tokio::test]
    async fn test_cancel_on_error_cancels_siblings() {
        let mut group = Group::new();
        group.set_cancel_on_error(true);
        group.queue(|_ctx, _index| async move { Err::<i32, _>(Error::Other("boom".to_owned())) });

        let (cancel_tx, mut cancel_rx) = mpsc::unbounded_channel();
        for _slot in 1..5usize {
            let sender = cancel_tx.clone();
            group.queue(move |ctx, index| async move {
                // Block until cancellation fans out, then report it.
                let error = ctx.done_err().await;
                let _send = sender.send(index);
                Err(error)
            });
        }
        drop(cancel_tx);

        let error = group
            .wait(&RunContext::new())
            .await
            .expect_err("batch should fail");
        assert_eq!(error.to_string(), "boom");

        // Every sibling observed the cancellation before wait returned.
        let mut observed = 0usize;
        while cancel_rx.try_recv().is_ok() {
            observed += 1;
        }
        assert_eq!(observed, 4);
    }

    #[tokio::test]
    async fn test_timeout_returns_deadline_error() {
        let mut group = Group::new();
        group.set_cancel_on_error(true);
        group.set_timeout(Duration::from_millis(20));
        group.queue(|ctx, _index| async move {
            tokio::select! {
                error = ctx.done_err() => Err(error),
                () = sleep(Duration::from_secs(10)) => Ok(10i32),
            }
        });
        let error = group
            .wait(&RunContext::new())
            .await
            .expect_err("batch should time out");
        assert!(matches!(error, Error::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_timeout_every_operation_observes_cancellation() {
        let mut group = Group::new();
        group.set_timeout(Duration::from_millis(20));

        let (cancel_tx, mut cancel_rx) = mpsc::unbounded_channel();
        for _slot in 0..3usize {
            let sender = cancel_tx.clone();
            group.queue(move |ctx, index| async move {
                let error = ctx.done_err().await;
                let _send = sender.send(index);
                Err::<i32, _>(error)
            });
        }
        drop(cancel_tx);

        let error = group
            .wait(&RunContext::new())
            .await
            .expect_err("batch should time out");
        let Error::Aggregate(errors) = error else {
            panic!("expected aggregate error, got {error}");
        };
        assert_eq!(errors.len(), 3);
        for entry in &errors {
            assert!(matches!(entry, Error::DeadlineExceeded));
        }

        let mut observed = 0usize;
        while cancel_rx.try_recv().is_ok() {
            observed += 1;
        }
        assert_eq!(observed, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_max_concurrent_never_exceeded() {
        const LIMIT: usize = 10;
        let active = Arc::new(AtomicUsize::new(0));
        let mut group = Group::new();
        group.set_max_concurrent(LIMIT);
        for _slot in 0..200usize {
            let counter = Arc::clone(&active);
            group.queue(move |_ctx, _index| async move {
                let now_running = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if now_running > LIMIT {
                    counter.fetch_sub(1, Ordering::SeqCst);
                    return Err(Error::Other(format!(
                        "saw {now_running} active operations; want <= {LIMIT}"
                    )));
                }
                // Give other operations a chance to start.
                sleep(Duration::from_micros(100)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
                Ok(0i32)
            });
        }
        let values = group.wait(&RunContext::new()).await.expect("batch");
        assert_eq!(values.len(), 200);
    }

    #[tokio::test]
    async fn test_wait_lax_preserves_every_outcome() {
        let mut group = Group::new();
        for index in 0..5usize {
            group.queue(move |_ctx, _queued_index| async move {
                if index % 2 == 1 {
                    Err(Error::Other(format!("error {index}")))
                } else {
                    Ok(index)
                }
            });
        }
        let outcomes = group.wait_lax(&RunContext::new()).await;
        assert_eq!(outcomes.len(), 5);
        for (position, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.index(), position);
            if position % 2 == 1 {
                let error = outcome.result.as_ref().expect_err("odd index fails");
                assert_eq!(error.to_string(), format!("error {position}"));
            } else {
                assert_eq!(*outcome.result.as_ref().expect("even index succeeds"), position);
            }
        }
    }

    #[tokio::test]
    async fn test_wait_lax_ignores_cancel_on_error() {
        let mut group = Group::new();
        group.set_cancel_on_error(true);
        group.queue(|_ctx, _index| async move { Err::<usize, _>(Error::Other("first".to_owned())) });
        group.queue(|_ctx, _index| async move {
            // Would never finish if cancel-on-error fanned out here.
            sleep(Duration::from_millis(10)).await;
            Ok(2)
        });
        let outcomes = group.wait_lax(&RunContext::new()).await;
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0].result, Err(Error::Other(_))));
        assert_eq!(*outcomes[1].result.as_ref().expect("second succeeds"), 2);
    }

    #[tokio::test]
    async fn test_group_is_reusable_after_wait() {
        let mut group = Group::new();
        group.queue(|_ctx, _index| async move { Ok(1i32) });
        group.queue(|_ctx, _index| async move { Ok(2i32) });
        let first = group.wait(&RunContext::new()).await.expect("first batch");
        assert_eq!(first, vec![1, 2]);
        assert_eq!(group.queued(), 0);

        group.queue(|_ctx, _index| async move { Ok(3i32) });
        let second = group.wait(&RunContext::new()).await.expect("second batch");
        assert_eq!(second, vec![3]);
    }

    #[tokio::test]
    async fn test_caller_cancellation_propagates_through_derived_scope() {
        let mut group = Group::new();
        // A timeout forces a derived scope, so the caller's cancellation
        // has to be forwarded rather than observed directly.
        group.set_timeout(Duration::from_secs(30));
        for _slot in 0..2usize {
            group.queue(|ctx, _index| async move { Err::<i32, _>(ctx.done_err().await) });
        }

        let ctx = RunContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            canceller.cancel(CancelReason::Cancelled);
        });

        let error = group.wait(&ctx).await.expect_err("batch should be cancelled");
        let Error::Aggregate(errors) = error else {
            panic!("expected aggregate error, got {error}");
        };
        for entry in &errors {
            assert!(matches!(entry, Error::Cancelled));
        }
    }

    #[tokio::test]
    async fn test_caller_cancellation_without_derived_scope() {
        let mut group = Group::new();
        for _slot in 0..2usize {
            group.queue(|ctx, _index| async move { Err::<i32, _>(ctx.done_err().await) });
        }

        let ctx = RunContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            canceller.cancel(CancelReason::Cancelled);
        });

        let error = group.wait(&ctx).await.expect_err("batch should be cancelled");
        assert!(matches!(error, Error::Aggregate(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[should_panic(expected = "kaboom")]
    async fn test_operation_panic_propagates() {
        let mut group: Group<i32> = Group::new();
        group.queue(|_ctx, _index| async move { panic!("kaboom") });
        drop(group.wait(&RunContext::new()).await);
    }
}
