//! Feature composition: the trait a feature implements to contribute
//! state and requests to a [`crate::store::Store`], plus request-config
//! normalization.
//!
//! A bare-function request normalizes to `{key: name, guard: [], handler}`.
//! Here there is no duck-typed config object to normalize at runtime —
//! [`RequestConfig::new`] starts from that same default shape and the
//! builder methods (`key`/`guard`/`guards`/`cancel`/`schedule`) narrow it,
//! so the normalization happens at the type level instead of by
//! inspecting what was passed.

use std::collections::HashMap;
use std::sync::Arc;

use vireo_core::abort::AbortSignal;
use vireo_core::error::StoreError;
use vireo_core::guard::Guard;
use vireo_core::scheduler::{BoxFuture, Scheduler};
use vireo_core::state::{Key, ReactiveState, Value};

use crate::queue::{AnyValue, TaskKey};

/// How a request's [`TaskKey`] is derived: fixed at registration, or
/// computed from the request's input.
#[derive(Clone)]
pub enum KeySpec {
    Fixed(TaskKey),
    FromInput(Arc<dyn Fn(&AnyValue) -> TaskKey + Send + Sync>),
}

impl KeySpec {
    #[must_use]
    pub fn resolve(&self, input: &AnyValue) -> TaskKey {
        match self {
            KeySpec::Fixed(key) => key.clone(),
            KeySpec::FromInput(f) => f(input),
        }
    }
}

/// Which other queued keys a request's invocation cancels before its own
/// task is enqueued. Empty by default.
#[derive(Clone)]
pub enum CancelSpec {
    None,
    Fixed(Vec<TaskKey>),
    FromInput(Arc<dyn Fn(&AnyValue) -> Vec<TaskKey> + Send + Sync>),
}

impl CancelSpec {
    #[must_use]
    pub fn resolve(&self, input: &AnyValue) -> Vec<TaskKey> {
        match self {
            CancelSpec::None => Vec::new(),
            CancelSpec::Fixed(keys) => keys.clone(),
            CancelSpec::FromInput(f) => f(input),
        }
    }
}

/// A request's handler: `(input, ctx) -> Result<output, StoreError>`, run
/// only after every guard in [`RequestConfig::guards`] has passed.
pub type RequestHandler<Target> =
    Arc<dyn Fn(AnyValue, RequestContext<Target>) -> BoxFuture<Result<AnyValue, StoreError>> + Send + Sync>;

/// What a request's guards and handler see: the attached target, the
/// per-task abort signal, and the caller-stamped request metadata.
#[derive(Clone)]
pub struct RequestContext<Target> {
    pub target: Arc<Target>,
    pub signal: AbortSignal,
    pub meta: vireo_core::meta::RequestMeta,
}

/// One request a feature exposes, normalized into a fixed shape at
/// registration instead of at call time.
pub struct RequestConfig<Target> {
    pub name: Arc<str>,
    pub key: KeySpec,
    pub guards: Vec<Arc<dyn Guard<Target>>>,
    pub cancel: CancelSpec,
    pub handler: RequestHandler<Target>,
    pub schedule: Option<Arc<dyn Scheduler>>,
}

impl<Target> RequestConfig<Target> {
    /// Starts from the bare-function default: `{key: name, guard: [],
    /// cancel: none, handler}`.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, handler: RequestHandler<Target>) -> Self {
        let name = name.into();
        Self {
            key: KeySpec::Fixed(TaskKey::Str(name.clone())),
            guards: Vec::new(),
            cancel: CancelSpec::None,
            handler,
            schedule: None,
            name,
        }
    }

    #[must_use]
    pub fn key(mut self, key: KeySpec) -> Self {
        self.key = key;
        self
    }

    /// Appends one guard, preserving registration order — the "a single
    /// guard becomes a singleton list; multiple preserve order" rule
    /// falls out of calling this once versus [`RequestConfig::guards`].
    #[must_use]
    pub fn guard(mut self, guard: Arc<dyn Guard<Target>>) -> Self {
        self.guards.push(guard);
        self
    }

    #[must_use]
    pub fn guards(mut self, guards: impl IntoIterator<Item = Arc<dyn Guard<Target>>>) -> Self {
        self.guards.extend(guards);
        self
    }

    #[must_use]
    pub fn cancel(mut self, cancel: CancelSpec) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn schedule(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.schedule = Some(scheduler);
        self
    }
}

/// What a feature's `subscribe`/`get_snapshot` see: the attached target,
/// the per-attach abort signal, direct state patching (`set`), and
/// `update` — re-derive the feature's slice via `get_snapshot` and patch
/// it, for features that want to resync from target state on some event
/// rather than compute the whole patch inline.
pub struct FeatureContext<Target> {
    pub target: Arc<Target>,
    pub signal: AbortSignal,
    state: ReactiveState,
    update_fn: Arc<dyn Fn() + Send + Sync>,
}

impl<Target> Clone for FeatureContext<Target> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            signal: self.signal.clone(),
            state: self.state.clone(),
            update_fn: self.update_fn.clone(),
        }
    }
}

impl<Target> FeatureContext<Target> {
    #[must_use]
    pub fn new(
        target: Arc<Target>,
        signal: AbortSignal,
        state: ReactiveState,
        update_fn: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            target,
            signal,
            state,
            update_fn,
        }
    }

    pub fn set(&self, partial: impl IntoIterator<Item = (Key, Value)>) {
        self.state.patch(partial);
    }

    pub fn update(&self) {
        (self.update_fn)();
    }
}

/// A unit of state + requests a [`crate::store::Store`] composes onto a
/// target.
pub trait Feature<Target>: Send + Sync {
    /// The slice of merged store state this feature contributes before
    /// any target is attached.
    fn initial_state(&self) -> HashMap<Key, Value>;

    /// Derives this feature's current slice from `ctx.target`, for the
    /// post-subscribe full resync and for [`FeatureContext::update`].
    fn get_snapshot(&self, ctx: &FeatureContext<Target>) -> HashMap<Key, Value>;

    /// Wires this feature's target listeners. Errors are routed to the
    /// store's `on_error`, not propagated to the caller of `attach`.
    fn subscribe(&self, ctx: &FeatureContext<Target>) -> Result<(), StoreError>;

    /// The requests this feature exposes, keyed by name in the merged
    /// store request map.
    fn requests(&self) -> Vec<RequestConfig<Target>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use vireo_core::abort::AbortController;

    struct Player {
        volume: std::sync::atomic::AtomicI64,
    }

    struct VolumeFeature;

    impl Feature<Player> for VolumeFeature {
        fn initial_state(&self) -> HashMap<Key, Value> {
            HashMap::from([(Key::from("volume"), Value::I64(100))])
        }

        fn get_snapshot(&self, ctx: &FeatureContext<Player>) -> HashMap<Key, Value> {
            let volume = ctx.target.volume.load(std::sync::atomic::Ordering::SeqCst);
            HashMap::from([(Key::from("volume"), Value::I64(volume))])
        }

        fn subscribe(&self, ctx: &FeatureContext<Player>) -> Result<(), StoreError> {
            ctx.set(self.get_snapshot(ctx));
            Ok(())
        }

        fn requests(&self) -> Vec<RequestConfig<Player>> {
            vec![RequestConfig::new(
                "setVolume",
                Arc::new(|input: AnyValue, ctx: RequestContext<Player>| {
                    Box::pin(async move {
                        let level = *input.downcast::<i64>().map_err(|_| StoreError::rejected())?;
                        ctx.target.volume.store(level, std::sync::atomic::Ordering::SeqCst);
                        Ok(Arc::new(()) as AnyValue)
                    })
                }),
            )]
        }
    }

    #[test]
    fn initial_state_carries_the_declared_default() {
        let feature = VolumeFeature;
        let state = feature.initial_state();
        assert_eq!(state.get("volume").unwrap().as_i64(), Some(100));
    }

    #[test]
    fn request_defaults_to_its_own_name_as_key_with_no_guards() {
        let feature = VolumeFeature;
        let requests = feature.requests();
        let request = &requests[0];
        assert_eq!(request.name.as_ref(), "setVolume");
        assert!(request.guards.is_empty());
        let key = request.key.resolve(&(Arc::new(()) as AnyValue));
        assert_eq!(key, TaskKey::from("setVolume"));
    }

    #[test]
    fn guards_preserve_registration_order() {
        let a = Arc::new(vireo_core::guard::predicate::<Player, _>(|_| true));
        let b = Arc::new(vireo_core::guard::predicate::<Player, _>(|_| false));
        let config = RequestConfig::new(
            "play",
            Arc::new(|_input: AnyValue, _ctx: RequestContext<Player>| {
                Box::pin(async move { Ok(Arc::new(()) as AnyValue) })
            }),
        )
        .guards(vec![a.clone() as Arc<dyn Guard<Player>>, b.clone() as Arc<dyn Guard<Player>>]);
        assert_eq!(config.guards.len(), 2);
    }

    #[test]
    fn subscribe_patches_state_from_target_snapshot() {
        let player = Arc::new(Player {
            volume: std::sync::atomic::AtomicI64::new(42),
        });
        let state = ReactiveState::new();
        let ctx = FeatureContext::new(
            player,
            AbortController::new().signal(),
            state.clone(),
            Arc::new(|| {}),
        );
        let feature = VolumeFeature;
        feature.subscribe(&ctx).unwrap();
        assert_eq!(state.get("volume").unwrap().as_i64(), Some(42));
    }
}
