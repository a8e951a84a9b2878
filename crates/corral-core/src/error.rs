//! Error types for task group coordination.

use core::result::Result as CoreResult;
use core::slice::Iter as SliceIter;
use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::vec::IntoIter as VecIntoIter;

use thiserror::Error;

/// Result type for task group operations.
pub type Result<T> = CoreResult<T, Error>;

/// Errors produced by queued operations and the coordinator.
///
/// The coordinator never recovers from an operation's own error; it only
/// aggregates or short-circuits per the configured policy.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation observed cancellation of its execution scope.
    #[error("operation cancelled")]
    Cancelled,

    /// The batch-wide deadline elapsed before the operation finished.
    #[error("batch deadline exceeded")]
    DeadlineExceeded,

    /// Multiple operations failed and every failure was collected.
    #[error(transparent)]
    Aggregate(#[from] ErrorList),

    /// An opaque error returned by an operation.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Returns true if this error was caused by the execution scope being
    /// cancelled rather than by the operation itself.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

/// A list of errors collected from multiple operations.
///
/// Allows a batch to keep track of every individual failure and return
/// them as a single error value. Displays as one error per line.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<Error>);

impl ErrorList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends an error to the list.
    pub fn push(&mut self, error: Error) {
        self.0.push(error);
    }

    /// Number of errors in the list.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the list contains no errors.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the errors in the order they were collected.
    pub fn iter(&self) -> impl Iterator<Item = &Error> {
        self.0.iter()
    }
}

impl From<Vec<Error>> for ErrorList {
    fn from(errors: Vec<Error>) -> Self {
        Self(errors)
    }
}

impl IntoIterator for ErrorList {
    type Item = Error;
    type IntoIter = VecIntoIter<Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'list> IntoIterator for &'list ErrorList {
    type Item = &'list Error;
    type IntoIter = SliceIter<'list, Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Display for ErrorList {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (index, error) in self.0.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl StdError for ErrorList {}
