//! The pluggable scheduling contract.
//!
//! A synchronous callback-based scheduler — the caller hands it a flush
//! callback, and it decides when to invoke it — has no bridge into Rust's
//! future-driven async model without assuming a specific executor, so
//! this crate instead models a scheduler as an awaitable wait point:
//! `Scheduler::wait()` returns a future that resolves once the caller may
//! proceed. Composing that with the task's abort signal (via
//! `futures_lite::future::race`) gives "cancel while waiting to be
//! scheduled" behavior without needing a cancel callback at all. See
//! DESIGN.md, Open Question 1.

use std::future::Future;
use std::pin::Pin;

/// A boxed, `'static` future — the common currency between schedulers and
/// their callers, since `dyn Scheduler` cannot return an associated type.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A pluggable scheduling policy. `wait()` resolves once the policy
/// permits the caller to proceed; it is re-invoked for every scheduling
/// decision (the queue calls it once per task, the state container once
/// per batch).
pub trait Scheduler: Send + Sync {
    fn wait(&self) -> BoxFuture<()>;
}

/// The default scheduler: resolves immediately. A "run on the next
/// microtask" policy is already approximated by this crate's synchronous
/// reentrancy-guarded batching (see `state::ReactiveState`) without
/// needing the scheduler itself to introduce any delay.
#[derive(Clone, Copy, Debug, Default)]
pub struct Immediate;

impl Scheduler for Immediate {
    fn wait(&self) -> BoxFuture<()> {
        Box::pin(async {})
    }
}

/// A cancel handle for a scheduled flush, returned by
/// [`FlushScheduler::schedule`]. Dropping it without calling it leaves the
/// flush scheduled.
pub type CancelFlush = Box<dyn FnOnce() + Send>;

/// The reactive state container's scheduling contract. Unlike
/// [`Scheduler`], this one stays synchronous and callback-based —
/// `(flush) -> Option<cancel>` — because [`crate::state::ReactiveState`]'s
/// mutators (`set`/`patch`/`delete`) are themselves synchronous calls with
/// no natural await point to hang an async contract off of. The task
/// queue needed an async contract because `enqueue` already returns a
/// future; the state container doesn't, so it keeps this synchronous
/// shape instead of forcing one translation onto both components.
pub trait FlushScheduler: Send + Sync {
    fn schedule(&self, flush: Box<dyn FnOnce() + Send>) -> Option<CancelFlush>;
}

/// The default flush scheduler: invokes `flush` synchronously, in place.
/// Combined with [`crate::state::ReactiveState`]'s own reentrancy-guarded
/// dirty tracking, this reproduces "coalesce same-microtask mutations"
/// using the call stack as the microtask boundary instead of an actual
/// microtask queue, which Rust has no built-in equivalent of.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImmediateFlush;

impl FlushScheduler for ImmediateFlush {
    fn schedule(&self, flush: Box<dyn FnOnce() + Send>) -> Option<CancelFlush> {
        flush();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_resolves_without_yielding() {
        futures_lite::future::block_on(async {
            Immediate.wait().await;
        });
    }

    #[test]
    fn immediate_flush_runs_synchronously() {
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran.clone();
        let cancel = ImmediateFlush.schedule(Box::new(move || {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }));
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
        assert!(cancel.is_none());
    }
}
