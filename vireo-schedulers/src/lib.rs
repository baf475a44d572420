//! Concrete [`vireo_core::scheduler::Scheduler`] implementations beyond the
//! immediate default `vireo-core` ships: a fixed delay, a frame-paced
//! tick, and an idle-with-timeout policy.
//!
//! None of these schedulers depend on a specific async runtime — they're
//! built on `futures-timer`, which backs its own timers with a small
//! internal thread rather than requiring tokio or async-std, matching the
//! executor-agnostic stance of the rest of this workspace.

use std::time::Duration;

use futures_lite::future::race;
use vireo_core::scheduler::{BoxFuture, Scheduler};

/// Waits a fixed duration before letting the caller proceed.
#[derive(Clone, Copy, Debug)]
pub struct Delay(Duration);

impl Delay {
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self(duration)
    }

    #[must_use]
    pub fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }
}

impl Scheduler for Delay {
    fn wait(&self) -> BoxFuture<()> {
        let duration = self.0;
        Box::pin(async move {
            futures_timer::Delay::new(duration).await;
        })
    }
}

/// A frame-paced scheduler: there is no display compositor to synchronize
/// with outside a browser, so this waits one frame interval (defaulting
/// to 60Hz, ~16.67ms) as a stand-in vsync tick. A platform adapter with a
/// real frame clock should implement its own [`Scheduler`] instead of
/// using this one.
#[derive(Clone, Copy, Debug)]
pub struct AnimationFrame(Duration);

impl AnimationFrame {
    #[must_use]
    pub fn new() -> Self {
        Self(Duration::from_nanos(16_666_667))
    }

    #[must_use]
    pub fn with_frame_duration(duration: Duration) -> Self {
        Self(duration)
    }
}

impl Default for AnimationFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for AnimationFrame {
    fn wait(&self) -> BoxFuture<()> {
        let duration = self.0;
        Box::pin(async move {
            futures_timer::Delay::new(duration).await;
        })
    }
}

/// An idle-callback-style scheduler. There is no host idle queue to hook
/// into outside a browser, so this yields immediately — the closest a
/// cooperative, no-internal-executor crate can get to "whenever the host
/// is otherwise idle" — while still honoring an optional `timeout` as an
/// upper bound: whichever of the immediate yield or the timeout elapses
/// first wins, so passing a timeout never makes this scheduler wait
/// *longer* than an unbounded one.
#[derive(Clone, Copy, Debug)]
pub struct Idle(Option<Duration>);

impl Idle {
    #[must_use]
    pub fn new() -> Self {
        Self(None)
    }

    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self(Some(timeout))
    }
}

impl Default for Idle {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for Idle {
    fn wait(&self) -> BoxFuture<()> {
        match self.0 {
            None => Box::pin(std::future::ready(())),
            Some(timeout) => Box::pin(async move {
                race(
                    Box::pin(std::future::ready(())),
                    Box::pin(async move {
                        futures_timer::Delay::new(timeout).await;
                    }),
                )
                .await;
            }),
        }
    }
}
