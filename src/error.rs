//! Error types shared by the query engine and the atom store.

use thiserror::Error;

use crate::store::Suspense;

/// Error type for query and mutation operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Fetch failed: {0}")]
    FetchError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    /// The fetch was cancelled before it settled.
    #[error("Query was cancelled")]
    Cancelled,

    /// A fetch was requested for a query that has no query function.
    #[error("Missing query function for {0}")]
    MissingQueryFn(String),
}

impl QueryError {
    /// Returns `true` if this error only reports a cancellation.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// The outcome of an atom read that did not produce a value.
///
/// Reads either *suspend* (the value is not available yet and the caller should
/// wait for the [`Suspense`] to settle before reading again) or *throw* (an error
/// is raised into the evaluation, to be handled by whoever consumes the atom).
#[derive(Error, Debug, Clone)]
pub enum AtomError {
    #[error("atom read suspended")]
    Suspended(Suspense),

    #[error(transparent)]
    Query(#[from] QueryError),
}

impl AtomError {
    /// Returns the suspension if this read suspended.
    pub const fn suspense(&self) -> Option<&Suspense> {
        match self {
            Self::Suspended(suspense) => Some(suspense),
            Self::Query(_) => None,
        }
    }

    /// Returns the thrown error if this read failed.
    pub const fn query_error(&self) -> Option<&QueryError> {
        match self {
            Self::Query(error) => Some(error),
            Self::Suspended(_) => None,
        }
    }
}
