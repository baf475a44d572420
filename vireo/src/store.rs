//! The store: binds a set of [`crate::feature::Feature`]s to one attached
//! target, owning the merged reactive state and the request proxy that
//! turns a request name into a guarded, queued call.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use vireo_core::abort::{AbortController, AbortSignal};
use vireo_core::error::{ErrorKind, StoreError};
use vireo_core::meta::RequestMeta;
use vireo_core::scheduler::BoxFuture;
use vireo_core::state::{Key, ReactiveState, Value};

use crate::feature::{Feature, FeatureContext, RequestConfig, RequestContext};
use crate::queue::{self, AnyValue, Task, TaskHandler, TaskQueue};

/// Routed to [`StoreConfig::on_error`] on any request rejection. The
/// store itself is implicit: callers already hold the `Store` they
/// registered the callback on.
pub struct ErrorEvent {
    pub request: Option<Arc<str>>,
    pub error: StoreError,
}

/// Construction-time tunables: the feature set plus optional queue,
/// state container, and setup/attach/error observer callbacks.
pub struct StoreConfig<Target> {
    pub features: Vec<Arc<dyn Feature<Target>>>,
    pub queue: Option<TaskQueue>,
    pub state: Option<ReactiveState>,
    pub on_setup: Option<Arc<dyn Fn(&AbortSignal) + Send + Sync>>,
    pub on_attach: Option<Arc<dyn Fn(&Arc<Target>, &AbortSignal) + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(&ErrorEvent) + Send + Sync>>,
}

impl<Target> Default for StoreConfig<Target> {
    fn default() -> Self {
        Self {
            features: Vec::new(),
            queue: None,
            state: None,
            on_setup: None,
            on_attach: None,
            on_error: None,
        }
    }
}

struct AttachState<Target> {
    target: Arc<Target>,
    controller: AbortController,
}

struct Inner<Target> {
    attach: Option<AttachState<Target>>,
    destroyed: bool,
}

/// Binds features to one attached target. Cheap to clone: every clone
/// shares the same underlying store.
pub struct Store<Target> {
    inner: Arc<Mutex<Inner<Target>>>,
    features: Arc<Vec<Arc<dyn Feature<Target>>>>,
    requests: Arc<HashMap<Arc<str>, Arc<RequestConfig<Target>>>>,
    merged_initial: Arc<HashMap<Key, Value>>,
    queue: TaskQueue,
    state: ReactiveState,
    setup_controller: AbortController,
    on_attach: Option<Arc<dyn Fn(&Arc<Target>, &AbortSignal) + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(&ErrorEvent) + Send + Sync>>,
}

impl<Target> Clone for Store<Target> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            features: self.features.clone(),
            requests: self.requests.clone(),
            merged_initial: self.merged_initial.clone(),
            queue: self.queue.clone(),
            state: self.state.clone(),
            setup_controller: self.setup_controller.clone(),
            on_attach: self.on_attach.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

/// A handle returned by [`Store::attach`], wrapping a detach call.
/// Equivalent to calling [`Store::detach`] directly; kept as its own type
/// for callers who only hold the attachment, not the store.
pub struct Attachment<Target> {
    store: Store<Target>,
}

impl<Target: Send + Sync + 'static> Attachment<Target> {
    pub fn detach(&self) {
        self.store.detach();
    }
}

impl<Target: Send + Sync + 'static> Store<Target> {
    /// Merges every feature's initial state (rejecting overlapping keys —
    /// Open Question resolution #4 in DESIGN.md), builds the request map,
    /// and fires `on_setup`.
    pub fn new(config: StoreConfig<Target>) -> Result<Self, StoreError> {
        let mut merged_initial = HashMap::new();
        for feature in &config.features {
            for (key, value) in feature.initial_state() {
                if merged_initial.insert(key.clone(), value).is_some() {
                    return Err(StoreError::with_message(
                        ErrorKind::Rejected,
                        format!("overlapping state key across features: {key}"),
                    ));
                }
            }
        }

        let mut requests = HashMap::new();
        for feature in &config.features {
            for request in feature.requests() {
                requests.insert(request.name.clone(), Arc::new(request));
            }
        }

        let state = config.state.unwrap_or_default();
        state.patch(merged_initial.iter().map(|(k, v)| (k.clone(), v.clone())));

        let setup_controller = AbortController::new();
        if let Some(on_setup) = &config.on_setup {
            let signal = setup_controller.signal();
            queue::run_catching(|| on_setup(&signal));
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                attach: None,
                destroyed: false,
            })),
            features: Arc::new(config.features),
            requests: Arc::new(requests),
            merged_initial: Arc::new(merged_initial),
            queue: config.queue.unwrap_or_default(),
            state,
            setup_controller,
            on_attach: config.on_attach,
            on_error: config.on_error,
        })
    }

    #[must_use]
    pub fn state(&self) -> &ReactiveState {
        &self.state
    }

    #[must_use]
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    #[must_use]
    pub fn current_target(&self) -> Option<Arc<Target>> {
        self.inner.lock().attach.as_ref().map(|a| a.target.clone())
    }

    /// Attaches `target`: detaches any prior target first, resets state to
    /// the merged initial state, subscribes every feature, then does a
    /// full `get_snapshot` resync — strictly after subscription, so no
    /// feature observes a pre-snapshot state.
    pub fn attach(&self, target: Target) -> Attachment<Target> {
        self.detach();

        let target = Arc::new(target);
        let controller = AbortController::new();
        let signal = controller.signal();
        {
            let mut inner = self.inner.lock();
            inner.attach = Some(AttachState {
                target: target.clone(),
                controller,
            });
        }

        self.reset_state();

        for feature in self.features.iter() {
            let ctx = self.build_feature_ctx(target.clone(), signal.clone(), feature.clone());
            if let Err(err) = feature.subscribe(&ctx) {
                self.report_error(None, err);
            }
        }

        self.state.batch(|| {
            for feature in self.features.iter() {
                let ctx = self.build_feature_ctx(target.clone(), signal.clone(), feature.clone());
                let snapshot = feature.get_snapshot(&ctx);
                self.state.patch(snapshot);
            }
        });

        if let Some(on_attach) = &self.on_attach {
            let target = target.clone();
            let signal = signal.clone();
            queue::run_catching(|| on_attach(&target, &signal));
        }

        Attachment { store: self.clone() }
    }

    /// Tears down the current target, if any: aborts its per-attach signal
    /// (`DETACHED`), aborts every queued/pending task (`DETACHED`), clears
    /// the target, and resets state to the merged initial state. A no-op
    /// beyond the (already idempotent) state reset if nothing is attached.
    pub fn detach(&self) {
        let prior = self.inner.lock().attach.take();
        if let Some(state) = prior {
            state.controller.abort(ErrorKind::Detached);
        }
        self.queue.abort_all_with(StoreError::new(ErrorKind::Detached));
        self.reset_state();
    }

    /// Aborts the setup signal, destroys the queue (which aborts every
    /// active task `DESTROYED`), and detaches. Idempotent; subsequent
    /// `attach`/request calls reject `DESTROYED`.
    pub fn destroy(&self) {
        let was_destroyed = {
            let mut inner = self.inner.lock();
            std::mem::replace(&mut inner.destroyed, true)
        };
        if was_destroyed {
            return;
        }
        self.setup_controller.abort(ErrorKind::Destroyed);
        self.queue.destroy();
        self.detach();
    }

    fn reset_state(&self) {
        let merged = self.merged_initial.clone();
        let state = self.state.clone();
        state.batch(|| {
            let stale: Vec<Key> = state
                .snapshot()
                .keys()
                .filter(|k| !merged.contains_key(*k))
                .cloned()
                .collect();
            for key in &stale {
                state.delete(key);
            }
            state.patch(merged.iter().map(|(k, v)| (k.clone(), v.clone())));
        });
    }

    fn build_feature_ctx(
        &self,
        target: Arc<Target>,
        signal: AbortSignal,
        feature: Arc<dyn Feature<Target>>,
    ) -> FeatureContext<Target> {
        let state = self.state.clone();
        let update_target = target.clone();
        let update_signal = signal.clone();
        let update_state = state.clone();
        let update_fn: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            let inert = FeatureContext::new(
                update_target.clone(),
                update_signal.clone(),
                update_state.clone(),
                Arc::new(|| {}),
            );
            let snapshot = feature.get_snapshot(&inert);
            update_state.patch(snapshot);
        });
        FeatureContext::new(target, signal, state, update_fn)
    }

    fn report_error(&self, request: Option<Arc<str>>, error: StoreError) -> StoreError {
        if let Some(on_error) = &self.on_error {
            let event = ErrorEvent {
                request,
                error: error.clone(),
            };
            queue::run_catching(|| on_error(&event));
        }
        error
    }

    /// The request proxy: resolves the task key, aborts any declared
    /// cancel keys, builds a handler that checks the live target and
    /// every guard before calling the user handler, and enqueues it.
    /// Every rejection is routed to `on_error` before being returned.
    pub fn request(
        &self,
        name: &str,
        input: AnyValue,
        meta: Option<RequestMeta>,
    ) -> BoxFuture<Result<AnyValue, StoreError>> {
        if self.is_destroyed() {
            let err = self.report_error(Some(Arc::from(name)), StoreError::new(ErrorKind::Destroyed));
            return Box::pin(async move { Err(err) });
        }

        let Some(config) = self.requests.get(name).cloned() else {
            let err = self.report_error(
                Some(Arc::from(name)),
                StoreError::with_message(ErrorKind::Rejected, format!("unknown request: {name}")),
            );
            return Box::pin(async move { Err(err) });
        };

        let key = config.key.resolve(&input);
        for cancel_key in config.cancel.resolve(&input) {
            self.queue.abort(&cancel_key);
        }

        let store = self.clone();
        let guards = config.guards.clone();
        let user_handler = config.handler.clone();
        let meta = meta.unwrap_or_default();
        let request_name = config.name.clone();

        let handler: TaskHandler = Arc::new(move |input: AnyValue, signal: AbortSignal| {
            let store = store.clone();
            let guards = guards.clone();
            let user_handler = user_handler.clone();
            let meta = meta.clone();
            let request_name = request_name.clone();
            Box::pin(async move {
                let target = store.current_target().ok_or_else(|| {
                    tracing::warn!(request = %request_name, "request issued with no target attached");
                    StoreError::new(ErrorKind::NoTarget)
                })?;
                if let Some(reason) = signal.reason() {
                    return Err(reason);
                }
                if let Err(err) = vireo_core::guard::all(guards.as_slice(), &target, &signal).await {
                    tracing::debug!(request = %request_name, kind = ?err.kind, "request guard rejected");
                    return Err(err);
                }
                let ctx = RequestContext {
                    target,
                    signal,
                    meta,
                };
                (user_handler)(input, ctx).await
            })
        });

        let task = Task {
            name: config.name.clone(),
            key,
            input,
            handler,
            schedule: config.schedule.clone(),
        };
        let enqueued = self.queue.enqueue(task);
        let store = self.clone();
        let name: Arc<str> = config.name.clone();
        Box::pin(async move {
            match enqueued.await {
                Ok(output) => Ok(output),
                Err(err) => Err(store.report_error(Some(name), err)),
            }
        })
    }
}
