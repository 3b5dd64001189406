//! Error types for the batching executor.
//!
//! Errors are cloneable so a single failure can be delivered to every
//! waiter of a shared computation (a batch group, a memoized call).

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::bridge::ThreadPoolError;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by computations and by the executor itself.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A computation failed with a user-supplied error.
    #[error("{0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync>),

    #[error("Deferred already resolved")]
    AlreadyResolved,

    #[error("Deferred not resolved yet")]
    NotResolved,

    #[error("Batch returned {actual} results for {expected} calls")]
    BatchSizeMismatch { expected: usize, actual: usize },

    #[error("Wait requested {requested} resolved handles out of {available}")]
    WaitCountExceeded { requested: usize, available: usize },

    #[error("Scheduler deadlock: {pending} task(s) pending, nothing runnable and no hooks")]
    Deadlock { pending: usize },

    #[error("Usage error: {0}")]
    Usage(&'static str),

    #[error("Value is not of type {expected}")]
    TypeMismatch { expected: &'static str },

    #[error("Computation awaited a future the executor does not drive")]
    ForeignAwait,

    #[error("External work dropped before completing")]
    Abandoned,

    #[error("External work panicked: {0}")]
    Panicked(String),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] ThreadPoolError),
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

impl Error {
    /// Wraps an arbitrary error as a computation failure.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Failed(Arc::new(error))
    }

    /// Builds a computation failure from a message.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self::Failed(Arc::new(Message(message.to_string())))
    }

    /// Returns the wrapped user error if it has type `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Self::Failed(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Returns true if this error signals misuse of the executor rather than
    /// a failure inside a computation. These are never worth retrying.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::AlreadyResolved
                | Self::NotResolved
                | Self::BatchSizeMismatch { .. }
                | Self::WaitCountExceeded { .. }
                | Self::Deadlock { .. }
                | Self::Usage(_)
                | Self::ForeignAwait
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Boom(u32);

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "boom {}", self.0)
        }
    }

    impl std::error::Error for Boom {}

    #[test]
    fn test_downcast_user_error() {
        let err = Error::new(Boom(7));
        assert_eq!(err.downcast_ref::<Boom>(), Some(&Boom(7)));
        assert_eq!(err.to_string(), "boom 7");
    }

    #[test]
    fn test_msg_display() {
        let err = Error::msg("backend unavailable");
        assert_eq!(err.to_string(), "backend unavailable");
        assert!(err.downcast_ref::<Boom>().is_none());
    }

    #[test]
    fn test_clone_shares_inner_error() {
        let err = Error::new(Boom(1));
        let copy = err.clone();
        assert_eq!(copy.downcast_ref::<Boom>(), Some(&Boom(1)));
    }

    #[test]
    fn test_contract_violations() {
        assert!(Error::AlreadyResolved.is_contract_violation());
        assert!(Error::Deadlock { pending: 2 }.is_contract_violation());
        assert!(Error::BatchSizeMismatch { expected: 3, actual: 2 }.is_contract_violation());
        assert!(!Error::msg("x").is_contract_violation());
        assert!(!Error::Abandoned.is_contract_violation());
    }
}
