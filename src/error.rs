use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The error produced by a query or mutation function.
///
/// The cache does not perform I/O itself, so the only thing it knows about a
/// failure is what the fetcher reports. Errors are retained in entity state
/// across retries (`failure_reason`) and must therefore be cheap to clone and
/// serializable for cache snapshots.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct FetchError {
    message: String,
}

impl FetchError {
    /// Create an error from a display message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The failure message reported by the fetcher.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for FetchError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for FetchError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// How an in-flight operation should be torn down.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CancelOptions {
    /// Roll the entity state back to the snapshot taken when the fetch began.
    pub revert: bool,
    /// Suppress error callbacks and state dispatches for this cancellation.
    pub silent: bool,
}

impl CancelOptions {
    /// Cancellation that restores the pre-fetch state. This is the default for
    /// client-level `cancel_queries`.
    pub fn reverting() -> Self {
        Self {
            revert: true,
            silent: false,
        }
    }

    /// Cancellation that leaves no trace in entity state. Used internally when
    /// a fetch is superseded by a restart.
    pub fn silent() -> Self {
        Self {
            revert: false,
            silent: true,
        }
    }
}

/// The outcome of an operation run through the retryer.
///
/// Cancellation is deliberately a distinct variant: a cancelled fetch must
/// never be confused with a fetch that failed, since it does not overwrite
/// `data`/`error` in entity state.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum QueryError {
    /// The underlying fetch or mutation function failed (after retries, if
    /// any were configured).
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// The operation was cancelled before it settled.
    #[error("operation was cancelled")]
    Cancelled(CancelOptions),
}

impl QueryError {
    /// Whether this outcome is a cancellation rather than a fetch failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled(_))
    }
}

/// An error from a [`Persister`](crate::Persister) backend.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct PersistError {
    message: String,
}

impl PersistError {
    /// Create a persistence error from a display message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
