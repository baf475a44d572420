//! The core's typed error taxonomy.
//!
//! Every rejection the core itself produces carries one of the nine
//! [`ErrorKind`]s below. Handler-thrown errors pass through unchanged
//! unless they are not already a [`StoreError`], in which case they are
//! wrapped as [`ErrorKind::Rejected`] with the original error chained as
//! the cause.

use std::fmt;
use std::sync::Arc;

/// The nine taxonomy kinds a [`StoreError`] can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorKind {
    /// The operation's abort signal was tripped by an explicit `abort(key)`.
    #[error("aborted")]
    Aborted,
    /// Routine cooperative cancellation, distinct from an explicit abort.
    #[error("cancelled")]
    Cancelled,
    /// The store or queue has been permanently destroyed.
    #[error("destroyed")]
    Destroyed,
    /// The store's target was detached while the operation was in flight.
    #[error("detached")]
    Detached,
    /// A request was issued with no target attached.
    #[error("no target attached")]
    NoTarget,
    /// A guard evaluated to false, or rejected with a non-taxonomy error.
    #[error("rejected")]
    Rejected,
    /// The task was removed from the queue before it started.
    #[error("removed")]
    Removed,
    /// A newer same-key enqueue replaced this task before it settled.
    #[error("superseded")]
    Superseded,
    /// A guard's [`crate::guard::timeout`] bound elapsed.
    #[error("timeout")]
    Timeout,
}

/// A `dyn Error` wrapped in an [`Arc`] so it can be cloned cheaply and
/// shared across multiple task records without cloning the underlying
/// error value itself.
#[derive(Clone)]
pub struct ArcError(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl ArcError {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Arc::new(err))
    }
}

impl fmt::Debug for ArcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for ArcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for ArcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl<E> From<E> for ArcError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self::new(err)
    }
}

/// The core's single error type: a taxonomy [`ErrorKind`], a human-readable
/// message (defaulted from the kind when not supplied), and an optional
/// cause chain.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StoreError {
    pub kind: ErrorKind,
    pub message: Arc<str>,
    #[source]
    pub cause: Option<ArcError>,
}

impl StoreError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            message: Arc::from(kind.to_string()),
            kind,
            cause: None,
        }
    }

    pub fn with_message(kind: ErrorKind, message: impl Into<Arc<str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<ArcError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn aborted() -> Self {
        Self::new(ErrorKind::Aborted)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled)
    }

    pub fn destroyed() -> Self {
        Self::new(ErrorKind::Destroyed)
    }

    pub fn detached() -> Self {
        Self::new(ErrorKind::Detached)
    }

    pub fn no_target() -> Self {
        Self::new(ErrorKind::NoTarget)
    }

    pub fn rejected() -> Self {
        Self::new(ErrorKind::Rejected)
    }

    pub fn removed() -> Self {
        Self::new(ErrorKind::Removed)
    }

    pub fn superseded() -> Self {
        Self::new(ErrorKind::Superseded)
    }

    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout)
    }

    /// Wraps a handler-thrown error that is not already a [`StoreError`] as
    /// [`ErrorKind::Rejected`] with the original chained as the cause. A
    /// `StoreError` is passed through unchanged rather than wrapped again.
    pub fn from_handler_error<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let any = &err as &dyn std::any::Any;
        if let Some(store_err) = any.downcast_ref::<StoreError>() {
            return store_err.clone();
        }
        Self::rejected().with_cause(err)
    }
}

/// Tests whether a type-erased error is (or wraps, via its source chain) a
/// [`StoreError`].
pub fn is_store_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cursor: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cursor {
        if e.downcast_ref::<StoreError>().is_some() {
            return true;
        }
        cursor = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_message_matches_kind_display() {
        let err = StoreError::new(ErrorKind::Timeout);
        assert_eq!(err.message.as_ref(), "timeout");
        assert_eq!(err.to_string(), "timeout: timeout");
    }

    #[test]
    fn custom_message_is_kept() {
        let err = StoreError::with_message(ErrorKind::Rejected, "ready was false");
        assert_eq!(err.to_string(), "rejected: ready was false");
    }

    #[test]
    fn is_store_error_detects_wrapped_and_plain() {
        let plain = StoreError::aborted();
        assert!(is_store_error(&plain));

        #[derive(Debug, thiserror::Error)]
        #[error("boom")]
        struct Boom;
        assert!(!is_store_error(&Boom));
    }

    #[test]
    fn from_handler_error_passes_through_store_errors() {
        let original = StoreError::timeout();
        let wrapped = StoreError::from_handler_error(original.clone());
        assert_eq!(wrapped.kind, ErrorKind::Timeout);
    }

    #[test]
    fn from_handler_error_wraps_foreign_errors() {
        #[derive(Debug, thiserror::Error)]
        #[error("domain failure")]
        struct Domain;
        let wrapped = StoreError::from_handler_error(Domain);
        assert_eq!(wrapped.kind, ErrorKind::Rejected);
        assert!(wrapped.cause.is_some());
    }
}
