//! Run operations with progress reporting, timeouts, and bounded
//! concurrency.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use corral_core::{Error, Group, Result, RunContext};

use crate::reporter::Reporter;

/// Timeout applied when the caller does not provide one, so a forgotten
/// wait can never hang the process indefinitely.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default concurrency for parallel operations: the number of available
/// hardware execution units, never less than one.
pub fn default_concurrency() -> usize {
    num_cpus::get().max(1)
}

/// Options for [`run`]. All fields have usable defaults.
#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    /// Message passed to [`Reporter::start`]. Empty means no message.
    pub message: String,
    /// Unit count passed to [`Reporter::start`]; zero means no count.
    /// The operation itself may increment finer-grained sub-units through
    /// the reporter it captured.
    pub count: usize,
    /// Timeout after which the running operation is cancelled.
    /// Defaults to [`DEFAULT_TIMEOUT`].
    pub timeout: Option<Duration>,
}

/// Options for [`run_parallel`]. All fields have usable defaults except
/// `count`, which determines how many times the function runs.
#[derive(Debug, Default, Clone)]
pub struct RunParallelOptions {
    /// Message passed to [`Reporter::start`]. Empty means no message.
    pub message: String,
    /// Number of times the function is invoked, and the unit count passed
    /// to [`Reporter::start`]. Zero makes the call a no-op.
    pub count: usize,
    /// How many invocations may run simultaneously.
    /// Defaults to [`default_concurrency`].
    pub concurrency: Option<usize>,
    /// If true, the first failing invocation cancels all others and its
    /// error is returned alone. If false, all invocations run to
    /// completion and every failure is aggregated.
    pub cancel_on_error: bool,
    /// Timeout after which in-flight invocations are cancelled.
    /// Defaults to [`DEFAULT_TIMEOUT`].
    pub timeout: Option<Duration>,
}

/// Stops the reporter when dropped so every return path, including errors
/// and timeouts, stops it exactly once.
struct StopGuard {
    reporter: Arc<dyn Reporter>,
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        self.reporter.stop();
    }
}

/// Runs a single operation while displaying progress through `reporter`.
///
/// The operation receives a [`RunContext`] bound to the resolved timeout;
/// it should pass that context along so cancellation propagates. The
/// reporter is started before the operation, incremented once when the
/// operation completes (success or failure), and stopped unconditionally
/// before this function returns.
///
/// # Errors
/// Returns the operation's own error, or a cancellation error if the
/// timeout elapsed or the caller's scope was cancelled first.
pub async fn run<T, F, Fut>(
    ctx: &RunContext,
    reporter: Arc<dyn Reporter>,
    opts: RunOptions,
    operation: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(RunContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let _guard = StopGuard {
        reporter: Arc::clone(&reporter),
    };
    reporter.start(&opts.message, opts.count);

    let mut group = Group::new();
    group.set_timeout(opts.timeout.unwrap_or(DEFAULT_TIMEOUT));
    let op_reporter = Arc::clone(&reporter);
    group.queue(move |run_ctx, _index| async move {
        let result = operation(run_ctx).await;
        op_reporter.inc();
        result
    });

    let mut values = group.wait(ctx).await?;
    values
        .pop()
        .ok_or_else(|| Error::Other("operation produced no result".to_owned()))
}

/// Runs a function `opts.count` times concurrently while displaying
/// progress through `reporter`.
///
/// Each invocation receives a [`RunContext`] bound to the resolved timeout
/// and its 0-based invocation index. Results are returned in invocation
/// order. The reporter is incremented exactly once per completed
/// invocation, success or failure, and stopped unconditionally before this
/// function returns.
///
/// A count of zero is a documented no-op: the reporter is started and
/// immediately stopped, the function is never invoked, and an empty value
/// list is returned.
///
/// # Errors
/// Per the error policy: the first failure alone when
/// `opts.cancel_on_error` is set, otherwise an aggregate of every failure.
pub async fn run_parallel<T, F, Fut>(
    ctx: &RunContext,
    reporter: Arc<dyn Reporter>,
    opts: RunParallelOptions,
    operation: F,
) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: Fn(RunContext, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let _guard = StopGuard {
        reporter: Arc::clone(&reporter),
    };
    reporter.start(&opts.message, opts.count);
    if opts.count == 0 {
        debug!("run_parallel called with a count of zero, nothing to run");
        return Ok(Vec::new());
    }

    let concurrency = match opts.concurrency {
        Some(limit) if limit > 0 => limit,
        _ => default_concurrency(),
    };

    let mut group = Group::new();
    group.set_timeout(opts.timeout.unwrap_or(DEFAULT_TIMEOUT));
    group.set_max_concurrent(concurrency);
    group.set_cancel_on_error(opts.cancel_on_error);

    let operation = Arc::new(operation);
    for _slot in 0..opts.count {
        let invoke = Arc::clone(&operation);
        let op_reporter = Arc::clone(&reporter);
        group.queue(move |run_ctx, index| async move {
            let result = invoke(run_ctx, index).await;
            op_reporter.inc();
            result
        });
    }
    group.wait(ctx).await
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Test code is allowed to use expect"
)]
mod tests {
    use super::*;

    #[test]
    fn test_default_concurrency_is_at_least_one() {
        assert!(default_concurrency() >= 1);
    }

    #[test]
    fn test_default_timeout_is_ten_minutes() {
        assert_eq!(DEFAULT_TIMEOUT, Duration::from_secs(600));
    }
}
