//! The per-term service instance a proxy forwards calls to.

use std::fmt;

use crate::error::{BoxError, NotCurrentLeader};

/// A service instance that backs the proxy for one leadership term.
///
/// The proxy owns the delegate for the duration of the term and calls
/// [`close`](Self::close) exactly once when the term ends, whether by
/// shutdown or by detected loss of leadership. Callers may still hold a
/// snapshot reference after that; it must not be relied upon.
pub trait Delegate: Send + Sync + 'static {
    /// Release resources held for the term. No-op by default.
    fn close(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Builds a fresh delegate after leadership is won.
///
/// Called again after every failure until it succeeds or the proxy
/// closes, so it should be cheap.
pub trait DelegateFactory<D>: Send + Sync + 'static {
    /// Build a delegate for a new term.
    fn create(&self) -> Result<D, BoxError>;
}

impl<D, F, E> DelegateFactory<D> for F
where
    F: Fn() -> Result<D, E> + Send + Sync + 'static,
    E: Into<BoxError>,
{
    fn create(&self) -> Result<D, BoxError> {
        self().map_err(Into::into)
    }
}

/// How a delegate failure relates to leadership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The delegate reports it is not authoritative (not leader, or the
    /// backing service is unavailable). Ends the term.
    NotLeading,
    /// The operation was interrupted. Becomes a leadership error if the
    /// term changed meanwhile.
    Interrupted,
    /// An ordinary business error, returned to the caller verbatim.
    Other,
}

/// Lets the dispatcher spot leadership signals in delegate errors.
pub trait ClassifyFailure: fmt::Display {
    /// Classify this error. Defaults to [`FailureKind::Other`].
    fn failure_kind(&self) -> FailureKind {
        FailureKind::Other
    }
}

impl ClassifyFailure for NotCurrentLeader {
    fn failure_kind(&self) -> FailureKind {
        FailureKind::NotLeading
    }
}

impl ClassifyFailure for std::io::Error {
    fn failure_kind(&self) -> FailureKind {
        match self.kind() {
            std::io::ErrorKind::Interrupted => FailureKind::Interrupted,
            _ => FailureKind::Other,
        }
    }
}
