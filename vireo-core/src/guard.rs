//! Request guards: predicates over `(target, signal)` gating whether a
//! queued task may start, plus the `all`/`any`/`timeout` combinators.
//!
//! A guard conceptually resolves to a truthy/falsy outcome, with a
//! resolved-but-falsy result treated the same as an outright `false`.
//! Rust has no implicit truthy coercion, so a guard here resolves to
//! `Result<bool, StoreError>` directly: `Ok(true)` passes, `Ok(false)`
//! becomes `REJECTED` at the call site, `Err(e)` propagates `e` verbatim
//! (the guard's own rejection reason) — recorded as an Open Question
//! resolution in DESIGN.md.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_lite::future::race;

use crate::abort::AbortSignal;
use crate::error::StoreError;

/// A guard's raw outcome, before the `Ok(false)` → `REJECTED` mapping the
/// combinators and the store's request resolution apply.
pub type GuardOutcome = Result<bool, StoreError>;

/// A boxed future, the common currency for guard evaluation since `dyn
/// Guard` cannot return an associated type.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A gating predicate over `(target, signal)`. `Target` is left generic
/// since a guard reads whatever capabilities the feature it belongs to
/// needs — naturally a generic parameter here rather than a duck-typed
/// contract.
pub trait Guard<Target>: Send + Sync {
    fn check<'a>(&'a self, target: &'a Target, signal: &'a AbortSignal) -> BoxFuture<'a, GuardOutcome>;
}

impl<Target, F, Fut> Guard<Target> for F
where
    F: Fn(&Target, &AbortSignal) -> Fut + Send + Sync,
    Fut: Future<Output = GuardOutcome> + Send + 'static,
    Target: Send + Sync,
{
    fn check<'a>(&'a self, target: &'a Target, signal: &'a AbortSignal) -> BoxFuture<'a, GuardOutcome> {
        Box::pin(self(target, signal))
    }
}

/// Adapts a synchronous `Fn(&Target) -> bool` into a [`Guard`] that never
/// reads the signal, for the common case of a guard that only consults
/// target/store state.
pub fn predicate<Target, F>(f: F) -> impl Guard<Target>
where
    Target: Send + Sync,
    F: Fn(&Target) -> bool + Send + Sync,
{
    move |target: &Target, _signal: &AbortSignal| {
        let ok = f(target);
        async move { Ok(ok) }
    }
}

async fn wait_aborted_as_err(signal: &AbortSignal) -> GuardOutcome {
    Err(signal.wait_aborted().await)
}

/// Evaluates one guard, racing it against `signal`'s abort so that a
/// signal tripped while the guard is pending rejects `ABORTED` rather
/// than waiting for (or reporting) whatever the guard itself resolves to.
pub async fn run_guard<'a, Target>(
    guard: &'a (dyn Guard<Target> + 'a),
    target: &'a Target,
    signal: &'a AbortSignal,
) -> GuardOutcome {
    race(guard.check(target, signal), Box::pin(wait_aborted_as_err(signal))).await
}

/// Runs every guard in order, short-circuiting on the first falsy result
/// or error. Does not race guards against each other, so a slow early
/// guard delays evaluation of later ones.
pub async fn all<Target>(
    guards: &[Arc<dyn Guard<Target>>],
    target: &Target,
    signal: &AbortSignal,
) -> Result<(), StoreError> {
    for guard in guards {
        match run_guard(guard.as_ref(), target, signal).await {
            Ok(true) => {}
            Ok(false) => return Err(StoreError::rejected()),
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Runs every guard concurrently, resolving as soon as one is truthy
/// without waiting for the rest — a guard that never resolves must not
/// block an `any` that already has a truthy result from another guard —
/// and rejecting with the last failure once every guard has settled
/// falsy or errored.
pub async fn any<'a, Target>(
    guards: &'a [Arc<dyn Guard<Target>>],
    target: &'a Target,
    signal: &'a AbortSignal,
) -> Result<(), StoreError> {
    if guards.is_empty() {
        return Ok(());
    }
    let mut futures: Vec<BoxFuture<'a, GuardOutcome>> = guards
        .iter()
        .map(|g| -> BoxFuture<'a, GuardOutcome> { Box::pin(run_guard(g.as_ref(), target, signal)) })
        .collect();
    let mut last_err = None;
    loop {
        match poll_any(&mut futures).await {
            Some(Ok(true)) => return Ok(()),
            Some(Ok(false)) => last_err = Some(StoreError::rejected()),
            Some(Err(err)) => last_err = Some(err),
            None => return Err(last_err.unwrap_or_else(StoreError::rejected)),
        }
    }
}

/// Polls every live future in `futures` on each wake, removing and
/// returning the output of the first one that resolves. `None` once
/// `futures` is empty. Settled slots are swap-removed, so remaining
/// futures may change position between calls — fine here since callers
/// only care about aggregate outcomes, not which index resolved.
async fn poll_any<'a, T>(futures: &mut Vec<BoxFuture<'a, T>>) -> Option<T> {
    std::future::poll_fn(move |cx| {
        for i in 0..futures.len() {
            if let std::task::Poll::Ready(value) = futures[i].as_mut().poll(cx) {
                futures.swap_remove(i);
                return std::task::Poll::Ready(Some(value));
            }
        }
        if futures.is_empty() {
            std::task::Poll::Ready(None)
        } else {
            std::task::Poll::Pending
        }
    })
    .await
}

/// Wraps `guard` with a deadline: if it has not resolved within
/// `duration`, the wrapped guard rejects with [`crate::error::ErrorKind::Timeout`],
/// its message set to `name` so a request gating on more than one
/// timeout-wrapped guard can tell which one fired.
/// Clearing the pending timer as soon as the signal aborts falls out for
/// free here — when [`run_guard`] races this guard against the signal and
/// the signal wins, this future (and the `Delay` inside it) is dropped,
/// which cancels it.
pub fn timeout<Target, G>(guard: G, duration: Duration, name: impl Into<Arc<str>>) -> impl Guard<Target>
where
    Target: Send + Sync + 'static,
    G: Guard<Target> + 'static,
{
    TimeoutGuard {
        guard: Arc::new(guard),
        duration,
        name: name.into(),
        _target: std::marker::PhantomData,
    }
}

struct TimeoutGuard<Target, G> {
    guard: Arc<G>,
    duration: Duration,
    name: Arc<str>,
    _target: std::marker::PhantomData<Target>,
}

async fn elapse(duration: Duration, name: Arc<str>) -> GuardOutcome {
    futures_timer::Delay::new(duration).await;
    Err(StoreError::with_message(crate::error::ErrorKind::Timeout, name))
}

impl<Target, G> Guard<Target> for TimeoutGuard<Target, G>
where
    Target: Send + Sync,
    G: Guard<Target>,
{
    fn check<'a>(&'a self, target: &'a Target, signal: &'a AbortSignal) -> BoxFuture<'a, GuardOutcome> {
        Box::pin(async move {
            race(
                self.guard.check(target, signal),
                Box::pin(elapse(self.duration, self.name.clone())),
            )
            .await
        })
    }
}
