//! Progress-reporting façade over the corral task group.
//!
//! [`run`] executes a single operation and [`run_parallel`] executes a
//! batch of operations through [`corral_core::Group`], driving a
//! caller-supplied [`Reporter`] so the user can see progress while
//! timeouts and cancellation are handled uniformly.

/// The progress reporter capability and stock implementations.
pub mod reporter;
/// The run / run-parallel façade.
pub mod run;

pub use reporter::{LogReporter, NoopReporter, Reporter};
pub use run::{
    DEFAULT_TIMEOUT, RunOptions, RunParallelOptions, default_concurrency, run, run_parallel,
};
