//! Reactive state, cooperative cancellation, request metadata, guards and
//! the scheduling contracts they share. This crate is the dependency-free
//! foundation `vireo`'s task queue and feature/store composition build on.

pub mod abort;
pub mod error;
pub mod guard;
pub mod meta;
pub mod scheduler;
pub mod state;

pub use abort::{AbortController, AbortSignal};
pub use error::{ArcError, ErrorKind, StoreError};
pub use guard::{Guard, GuardOutcome};
pub use meta::{MetaBuilder, MetaSource, RequestMeta};
pub use scheduler::{FlushScheduler, ImmediateFlush, Immediate, Scheduler};
pub use state::{ReactiveState, Snapshot, Subscription, Value};
