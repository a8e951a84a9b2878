//! Progress reporter capability.

use std::sync::Mutex;

use tracing::{debug, info};

use corral_core::sync::IgnoreLock as _;

/// Capability object that visualizes the progress of a batch, typically a
/// spinner or a logger.
///
/// Reporters are passed explicitly to [`run`](crate::run::run) and
/// [`run_parallel`](crate::run::run_parallel) rather than looked up from
/// ambient state. [`Reporter::inc`] and [`Reporter::update_message`] must
/// be safe to call concurrently with other reporter calls, since every
/// operation in a batch reports its own completion.
pub trait Reporter: Send + Sync {
    /// Begins reporting with a human-readable message.
    ///
    /// `total` is the number of units the batch will complete; zero means
    /// no count is displayed.
    fn start(&self, message: &str, total: usize);

    /// Records one completed unit.
    fn inc(&self);

    /// Replaces the displayed message.
    fn update_message(&self, message: &str);

    /// Stops reporting. Called unconditionally when a run returns, even on
    /// error or timeout, and must tolerate being called without a
    /// preceding [`Reporter::start`].
    fn stop(&self);
}

/// Reporter that ignores every call. The default when the caller has no
/// progress display.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn start(&self, _message: &str, _total: usize) {}

    fn inc(&self) {}

    fn update_message(&self, _message: &str) {}

    fn stop(&self) {}
}

/// Reporter that writes progress to the active tracing subscriber instead
/// of drawing a spinner. Useful for non-interactive environments such as
/// CI logs.
#[derive(Debug, Default)]
pub struct LogReporter {
    state: Mutex<LogState>,
}

#[derive(Debug, Default)]
struct LogState {
    completed: usize,
    total: usize,
}

impl LogReporter {
    /// Creates a reporter with no progress recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Units completed since the last [`Reporter::start`].
    pub fn completed(&self) -> usize {
        self.state.lock_ignore_poison().completed
    }
}

impl Reporter for LogReporter {
    fn start(&self, message: &str, total: usize) {
        {
            let mut state = self.state.lock_ignore_poison();
            state.completed = 0;
            state.total = total;
        }
        if total > 0 {
            info!(total, "{message}");
        } else if !message.is_empty() {
            info!("{message}");
        }
    }

    fn inc(&self) {
        let (completed, total) = {
            let mut state = self.state.lock_ignore_poison();
            state.completed += 1;
            (state.completed, state.total)
        };
        debug!(completed, total, "progress");
    }

    fn update_message(&self, message: &str) {
        info!("{message}");
    }

    fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_reporter_accepts_every_call() {
        let reporter = NoopReporter;
        reporter.start("doing work", 3);
        reporter.inc();
        reporter.update_message("still working");
        reporter.stop();
    }

    #[test]
    fn test_log_reporter_counts_completions() {
        let reporter = LogReporter::new();
        reporter.start("updating services", 2);
        reporter.inc();
        reporter.inc();
        assert_eq!(reporter.completed(), 2);

        // start resets the count for the next batch.
        reporter.start("next batch", 1);
        assert_eq!(reporter.completed(), 0);
    }
}
