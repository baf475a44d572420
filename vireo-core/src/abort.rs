//! Cooperative cancellation: an [`AbortController`]/[`AbortSignal`] pair
//! carrying a taxonomy-kind reason, shared by guards, the queue and the
//! store wherever an in-flight operation needs to be told to stop.
//!
//! Waiting asynchronously for an abort reuses [`event_listener::Event`],
//! the same async-waitable single-writer-many-reader notification
//! primitive used elsewhere in this workspace for its intended purpose.

use std::sync::Arc;

use event_listener::Event;
use parking_lot::Mutex;

use crate::error::StoreError;

struct Inner {
    reason: Mutex<Option<StoreError>>,
    event: Event,
}

/// Owns the write-half of an abort relationship: call [`abort`](Self::abort)
/// once to trip every [`AbortSignal`] cloned from [`signal`](Self::signal).
#[derive(Clone)]
pub struct AbortController {
    inner: Arc<Inner>,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                reason: Mutex::new(None),
                event: Event::new(),
            }),
        }
    }

    #[must_use]
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            inner: self.inner.clone(),
        }
    }

    /// Trips the signal with `kind`. A no-op if already aborted — the
    /// first reason wins.
    pub fn abort(&self, kind: crate::error::ErrorKind) {
        self.abort_with(StoreError::new(kind));
    }

    /// Trips the signal with an arbitrary [`StoreError`]. A no-op if
    /// already aborted.
    pub fn abort_with(&self, reason: StoreError) {
        let mut guard = self.inner.reason.lock();
        if guard.is_none() {
            *guard = Some(reason);
            drop(guard);
            self.inner.event.notify(usize::MAX);
        }
    }
}

/// The read-half: a cheaply-cloneable handle guards, handlers and
/// subscriptions check (or await) to observe cancellation.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<Inner>,
}

impl AbortSignal {
    /// An already-tripped signal carrying `reason`, for call sites that
    /// need to hand out a signal without an owning controller (e.g. a
    /// synchronously-rejected queued task).
    #[must_use]
    pub fn already_aborted(reason: StoreError) -> Self {
        let controller = AbortController::new();
        controller.abort_with(reason);
        controller.signal()
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.reason.lock().is_some()
    }

    #[must_use]
    pub fn reason(&self) -> Option<StoreError> {
        self.inner.reason.lock().clone()
    }

    /// Resolves once the signal is tripped, yielding its reason.
    pub async fn wait_aborted(&self) -> StoreError {
        loop {
            if let Some(reason) = self.reason() {
                return reason;
            }
            let listener = self.inner.event.listen();
            // Re-check after registering the listener: closes the race
            // where `abort` runs between the first check and `listen()`.
            if let Some(reason) = self.reason() {
                return reason;
            }
            listener.await;
        }
    }
}
