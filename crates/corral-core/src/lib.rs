//! Bounded concurrent task coordination.
//!
//! This crate provides [`Group`], a coordinator that runs a batch of
//! independent, fallible operations concurrently under a concurrency cap,
//! a batch-wide deadline, and a configurable error policy, returning
//! results in submission order. [`RunContext`] is the cancellation scope
//! handed to every operation.

/// Cancellable execution scopes.
pub mod context;
/// Error types and result definitions.
pub mod error;
/// The bounded concurrent task group.
pub mod group;
/// Synchronized group variant for cross-task use.
pub mod shared;
/// Lock helpers.
pub mod sync;

pub use context::{CancelReason, RunContext};
pub use error::{Error, ErrorList, Result};
pub use group::{Group, Outcome};
pub use shared::SharedGroup;
