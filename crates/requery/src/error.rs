use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// An opaque failure reported by a query or mutation function.
///
/// The engine never interprets failures: a fetch function translates whatever
/// went wrong (transport error, non-ok response, application error) into a
/// [`FetchError`] and the engine carries it verbatim to the entry and its
/// subscribers. The error is cheap to clone so it can live in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct FetchError(Arc<str>);

impl FetchError {
    /// Creates an error from any displayable value.
    pub fn new(message: impl fmt::Display) -> Self {
        Self(message.to_string().into())
    }

    /// Wraps an arbitrary error, recording where it was converted.
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::debug!(error = dynerr, "fetch function failed");
        Self(e.to_string().into())
    }

    /// The failure message as reported by the caller.
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FetchError {
    fn from(message: &str) -> Self {
        Self(message.into())
    }
}

impl From<String> for FetchError {
    fn from(message: String) -> Self {
        Self(message.into())
    }
}

/// Outcome of a fetch attempt, either `Ok(T)` or the opaque failure reported
/// by the caller's function.
pub type FetchResult<T = ()> = Result<T, FetchError>;
