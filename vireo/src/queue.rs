//! The keyed task queue: serializes async work by [`TaskKey`], supersedes
//! same-key work, and settles each task into a subscribable,
//! last-writer-wins-by-id `tasks` map.
//!
//! **Driving model.** [`TaskQueue::enqueue`] performs every piece of
//! synchronous bookkeeping — supersession, `active`-map bookkeeping —
//! immediately, before returning. The future it returns then carries out
//! the scheduler wait, dispatch and handler run. That future makes no
//! progress until the caller polls, awaits or spawns it: this crate never
//! spawns its own tasks, so driving every future `enqueue` returns is the
//! caller's responsibility. A same-key supersede still reaches a task
//! that hasn't been polled yet — its abort controller trips immediately,
//! so the very first poll resolves it to `Err(Superseded)` rather than
//! ever running its handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use event_listener::Event;
use futures_lite::future::race;
use parking_lot::Mutex;

use vireo_core::abort::{AbortController, AbortSignal};
use vireo_core::error::{ErrorKind, StoreError};
use vireo_core::scheduler::{BoxFuture, Immediate, Scheduler};

/// A unique token minted per [`TaskQueue::enqueue`] call, used to decide
/// whether a settling task is still the current occupant of its key
/// (last-writer-wins by task id).
pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SYMBOL: AtomicU64 = AtomicU64::new(1);

fn next_task_id() -> TaskId {
    NEXT_TASK_ID.fetch_add(1, Ordering::SeqCst)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The unit of serialization: a string key, or an opaque unique symbol
/// minted by [`TaskKey::symbol`], using an `AtomicU64` counter to mint
/// each new id.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum TaskKey {
    Str(Arc<str>),
    Symbol(u64),
}

impl TaskKey {
    #[must_use]
    pub fn symbol() -> Self {
        TaskKey::Symbol(NEXT_SYMBOL.fetch_add(1, Ordering::SeqCst))
    }
}

impl From<&str> for TaskKey {
    fn from(s: &str) -> Self {
        TaskKey::Str(Arc::from(s))
    }
}

impl From<String> for TaskKey {
    fn from(s: String) -> Self {
        TaskKey::Str(Arc::from(s))
    }
}

impl From<Arc<str>> for TaskKey {
    fn from(s: Arc<str>) -> Self {
        TaskKey::Str(s)
    }
}

/// A type-erased task input/output. A task record carries whatever
/// input/output value a given request name produces; since one queue
/// serves every request name in a store, this crate erases the type the
/// same way [`vireo_core::state::Value::Opaque`] does for state.
pub type AnyValue = Arc<dyn std::any::Any + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Success,
    Error,
}

/// One entry of the queue's `tasks` map, represented as a single tagged
/// struct rather than a union of three — every field a pending, settled
/// or errored task might need is present, written once by the same code
/// path regardless of status.
#[derive(Clone)]
pub struct TaskRecord {
    pub status: TaskStatus,
    pub id: TaskId,
    pub name: Arc<str>,
    pub key: TaskKey,
    pub input: AnyValue,
    pub started_at: u64,
    pub settled_at: Option<u64>,
    pub duration_ms: Option<u64>,
    pub output: Option<AnyValue>,
    pub error: Option<StoreError>,
    pub cancelled: bool,
}

/// A handler run by the queue once a task is dispatched: `(input, signal)
/// -> Result<output, StoreError>`.
pub type TaskHandler =
    Arc<dyn Fn(AnyValue, AbortSignal) -> BoxFuture<Result<AnyValue, StoreError>> + Send + Sync>;

/// One unit of work submitted to [`TaskQueue::enqueue`].
pub struct Task {
    pub name: Arc<str>,
    pub key: TaskKey,
    pub input: AnyValue,
    pub handler: TaskHandler,
    /// Overrides the queue's default scheduler for this task only.
    pub schedule: Option<Arc<dyn Scheduler>>,
}

/// An immutable, cheaply-cloneable view of the `tasks` map.
#[derive(Clone)]
pub struct TasksView(Arc<HashMap<TaskKey, Arc<TaskRecord>>>);

impl TasksView {
    #[must_use]
    pub fn get(&self, key: &TaskKey) -> Option<&Arc<TaskRecord>> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TaskKey, &Arc<TaskRecord>)> {
        self.0.iter()
    }
}

/// An immutable, cheaply-cloneable view of the currently-queued (not yet
/// dispatched) task ids, by key.
#[derive(Clone)]
pub struct QueuedView(Arc<HashMap<TaskKey, TaskId>>);

impl QueuedView {
    #[must_use]
    pub fn contains(&self, key: &TaskKey) -> bool {
        self.0.contains_key(key)
    }
}

/// The per-key bookkeeping kept for a task from the moment it's enqueued
/// until it either aborts pre-dispatch or is dispatched and settles.
struct ActiveTask {
    id: TaskId,
    controller: AbortController,
    force: Arc<ForceFlush>,
    dispatched: bool,
}

/// A one-shot "dispatch now" signal a queued task races its scheduler
/// against, backing [`TaskQueue::flush`]. Same `event_listener::Event` +
/// re-check-after-listen idiom as [`vireo_core::abort::AbortSignal`].
struct ForceFlush {
    flag: std::sync::atomic::AtomicBool,
    event: Event,
}

impl ForceFlush {
    fn new() -> Self {
        Self {
            flag: std::sync::atomic::AtomicBool::new(false),
            event: Event::new(),
        }
    }

    fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.event.notify(usize::MAX);
    }

    async fn wait(&self) {
        loop {
            if self.flag.load(Ordering::SeqCst) {
                return;
            }
            let listener = self.event.listen();
            if self.flag.load(Ordering::SeqCst) {
                return;
            }
            listener.await;
        }
    }
}

type TaskListener = Arc<dyn Fn(&TasksView) + Send + Sync>;

struct SubscriberEntry {
    alive: bool,
    callback: TaskListener,
}

struct Inner {
    default_scheduler: Arc<dyn Scheduler>,
    on_dispatch: Option<Arc<dyn Fn(&TaskRecord) + Send + Sync>>,
    on_settled: Option<Arc<dyn Fn(&TaskRecord) + Send + Sync>>,
    active: HashMap<TaskKey, ActiveTask>,
    tasks: HashMap<TaskKey, Arc<TaskRecord>>,
    subscribers: Vec<SubscriberEntry>,
    destroyed: bool,
}

/// Construction-time tunables: an optional default scheduler plus
/// dispatch/settle observer callbacks.
#[derive(Default)]
pub struct QueueConfig {
    pub scheduler: Option<Arc<dyn Scheduler>>,
    pub on_dispatch: Option<Arc<dyn Fn(&TaskRecord) + Send + Sync>>,
    pub on_settled: Option<Arc<dyn Fn(&TaskRecord) + Send + Sync>>,
}

/// Keyed, serializing task queue. Cheap to clone: every clone shares the
/// same underlying queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Mutex<Inner>>,
}

pub struct Subscription {
    inner: std::sync::Weak<Mutex<Inner>>,
    index: usize,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut guard = inner.lock();
            if let Some(entry) = guard.subscribers.get_mut(self.index) {
                entry.alive = false;
            }
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    #[must_use]
    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                default_scheduler: config.scheduler.unwrap_or_else(|| Arc::new(Immediate)),
                on_dispatch: config.on_dispatch,
                on_settled: config.on_settled,
                active: HashMap::new(),
                tasks: HashMap::new(),
                subscribers: Vec::new(),
                destroyed: false,
            })),
        }
    }

    #[must_use]
    pub fn tasks(&self) -> TasksView {
        TasksView(Arc::new(self.inner.lock().tasks.clone()))
    }

    #[must_use]
    pub fn queued(&self) -> QueuedView {
        let inner = self.inner.lock();
        QueuedView(Arc::new(
            inner
                .active
                .iter()
                .filter(|(_, a)| !a.dispatched)
                .map(|(k, a)| (k.clone(), a.id))
                .collect(),
        ))
    }

    #[must_use]
    pub fn is_queued(&self, key: &TaskKey) -> bool {
        self.inner
            .lock()
            .active
            .get(key)
            .is_some_and(|a| !a.dispatched)
    }

    #[must_use]
    pub fn is_pending(&self, key: &TaskKey) -> bool {
        self.inner
            .lock()
            .tasks
            .get(key)
            .is_some_and(|t| t.status == TaskStatus::Pending)
    }

    /// Enqueues `task`. All supersession bookkeeping happens synchronously,
    /// before this returns; the returned future carries out the scheduler
    /// wait, dispatch and handler run, and must be polled (directly,
    /// awaited, or spawned onto an executor) for the task to progress.
    pub fn enqueue(&self, task: Task) -> BoxFuture<Result<AnyValue, StoreError>> {
        let mut guard = self.inner.lock();
        if guard.destroyed {
            return Box::pin(async { Err(StoreError::destroyed()) });
        }

        if let Some(existing) = guard.active.get(&task.key) {
            existing.controller.abort(ErrorKind::Superseded);
        }

        let id = next_task_id();
        let controller = AbortController::new();
        let force = Arc::new(ForceFlush::new());
        guard.active.insert(
            task.key.clone(),
            ActiveTask {
                id,
                controller: controller.clone(),
                force: force.clone(),
                dispatched: false,
            },
        );
        let scheduler = task
            .schedule
            .clone()
            .unwrap_or_else(|| guard.default_scheduler.clone());
        drop(guard);

        let queue = self.clone();
        let Task {
            name,
            key,
            input,
            handler,
            ..
        } = task;
        let started_at = now_millis();

        Box::pin(async move {
            let signal = controller.signal();
            match wait_to_dispatch(scheduler, force, signal.clone()).await {
                DispatchOutcome::Aborted(reason) => {
                    queue.drop_active_if_mine(&key, id);
                    return Err(reason);
                }
                DispatchOutcome::Dispatch => {}
            }

            queue.mark_dispatched(&key, id, &name, &input, started_at);

            if let Some(reason) = signal.reason() {
                queue.settle(&key, id, &name, &input, started_at, Err(reason.clone()), true);
                return Err(reason);
            }

            let result = (handler)(input.clone(), signal.clone()).await;

            if let Some(reason) = signal.reason() {
                queue.settle(&key, id, &name, &input, started_at, Err(reason.clone()), true);
                return Err(reason);
            }

            queue.settle(
                &key,
                id,
                &name,
                &input,
                started_at,
                result.clone(),
                false,
            );
            result
        })
    }

    fn drop_active_if_mine(&self, key: &TaskKey, id: TaskId) {
        let mut inner = self.inner.lock();
        if inner.active.get(key).is_some_and(|a| a.id == id) {
            inner.active.remove(key);
        }
    }

    fn mark_dispatched(&self, key: &TaskKey, id: TaskId, name: &Arc<str>, input: &AnyValue, started_at: u64) {
        let record = Arc::new(TaskRecord {
            status: TaskStatus::Pending,
            id,
            name: name.clone(),
            key: key.clone(),
            input: input.clone(),
            started_at,
            settled_at: None,
            duration_ms: None,
            output: None,
            error: None,
            cancelled: false,
        });
        let (on_dispatch, snapshot) = {
            let mut inner = self.inner.lock();
            if let Some(active) = inner.active.get_mut(key) {
                if active.id == id {
                    active.dispatched = true;
                }
            }
            inner.tasks.insert(key.clone(), record.clone());
            (inner.on_dispatch.clone(), self.collect_listeners(&inner))
        };
        if let Some(cb) = on_dispatch {
            run_catching(|| cb(&record));
        }
        self.fire(snapshot);
    }

    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        key: &TaskKey,
        id: TaskId,
        name: &Arc<str>,
        input: &AnyValue,
        started_at: u64,
        result: Result<AnyValue, StoreError>,
        cancelled: bool,
    ) {
        let settled_at = now_millis();
        let record = Arc::new(match result {
            Ok(output) => TaskRecord {
                status: TaskStatus::Success,
                id,
                name: name.clone(),
                key: key.clone(),
                input: input.clone(),
                started_at,
                settled_at: Some(settled_at),
                duration_ms: Some(settled_at.saturating_sub(started_at)),
                output: Some(output),
                error: None,
                cancelled,
            },
            Err(error) => TaskRecord {
                status: TaskStatus::Error,
                id,
                name: name.clone(),
                key: key.clone(),
                input: input.clone(),
                started_at,
                settled_at: Some(settled_at),
                duration_ms: Some(settled_at.saturating_sub(started_at)),
                output: None,
                error: Some(error),
                cancelled,
            },
        });

        tracing::trace!(
            name = %record.name,
            status = ?record.status,
            duration_ms = ?record.duration_ms,
            "task settled"
        );

        let (on_settled, snapshot) = {
            let mut inner = self.inner.lock();
            if inner.active.get(key).is_some_and(|a| a.id == id) {
                inner.active.remove(key);
            }
            // Last-writer-wins by id: only publish if no newer task has
            // already overwritten this key's entry.
            let still_current = inner.tasks.get(key).map_or(true, |cur| cur.id == id);
            if still_current {
                inner.tasks.insert(key.clone(), record.clone());
            }
            (inner.on_settled.clone(), self.collect_listeners(&inner))
        };
        if let Some(cb) = on_settled {
            run_catching(|| cb(&record));
        }
        self.fire(snapshot);
    }

    fn collect_listeners(&self, inner: &Inner) -> (TasksView, Vec<TaskListener>) {
        let snapshot = TasksView(Arc::new(inner.tasks.clone()));
        let listeners = inner
            .subscribers
            .iter()
            .filter(|e| e.alive)
            .map(|e| e.callback.clone())
            .collect();
        (snapshot, listeners)
    }

    fn fire(&self, (snapshot, listeners): (TasksView, Vec<TaskListener>)) {
        for listener in listeners {
            run_catching(|| listener(&snapshot));
        }
    }

    /// Rejects the queued task at `key` with `ABORTED`, or aborts the
    /// pending task's controller with `ABORTED` if one is running.
    pub fn abort(&self, key: &TaskKey) -> bool {
        let inner = self.inner.lock();
        if let Some(active) = inner.active.get(key) {
            active.controller.abort(ErrorKind::Aborted);
            true
        } else {
            false
        }
    }

    /// Aborts every active (queued or pending) task with `ABORTED`.
    pub fn abort_all(&self) {
        self.abort_all_with(StoreError::new(ErrorKind::Aborted));
    }

    /// Aborts every active (queued or pending) task with an arbitrary
    /// reason, e.g. `DETACHED` when a store tears down a target, distinct
    /// from an explicit `abort(key)`'s `ABORTED`.
    pub fn abort_all_with(&self, reason: StoreError) {
        let inner = self.inner.lock();
        for active in inner.active.values() {
            active.controller.abort_with(reason.clone());
        }
    }

    /// Rejects the queued task at `key` with `REMOVED`, without ever
    /// invoking its handler. Returns `false` if no queued task occupies
    /// `key` (it may already be dispatched, or absent).
    pub fn dequeue(&self, key: &TaskKey) -> bool {
        let mut inner = self.inner.lock();
        if inner.active.get(key).is_some_and(|a| !a.dispatched) {
            if let Some(active) = inner.active.remove(key) {
                active.controller.abort(ErrorKind::Removed);
            }
            true
        } else {
            false
        }
    }

    /// Rejects every currently-queued (not yet dispatched) task with
    /// `REMOVED`.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let stale: Vec<TaskKey> = inner
            .active
            .iter()
            .filter(|(_, a)| !a.dispatched)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            if let Some(active) = inner.active.remove(&key) {
                active.controller.abort(ErrorKind::Removed);
            }
        }
    }

    /// Forces immediate dispatch of the queued task at `key`, or of every
    /// queued task if `key` is `None`. A no-op for keys with nothing
    /// queued; idempotent for a task whose dispatch has already started.
    pub fn flush(&self, key: Option<&TaskKey>) {
        let inner = self.inner.lock();
        match key {
            Some(key) => {
                if let Some(active) = inner.active.get(key) {
                    active.force.trigger();
                }
            }
            None => {
                for active in inner.active.values() {
                    active.force.trigger();
                }
            }
        }
    }

    /// Aborts every active task with `DESTROYED` and permanently rejects
    /// further `enqueue` calls. Idempotent.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return;
        }
        inner.destroyed = true;
        for active in inner.active.values() {
            active.controller.abort(ErrorKind::Destroyed);
        }
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    pub fn subscribe(&self, listener: impl Fn(&TasksView) + Send + Sync + 'static) -> Subscription {
        let mut inner = self.inner.lock();
        let index = inner.subscribers.len();
        inner.subscribers.push(SubscriberEntry {
            alive: true,
            callback: Arc::new(listener),
        });
        Subscription {
            inner: Arc::downgrade(&self.inner),
            index,
        }
    }
}

enum DispatchOutcome {
    Dispatch,
    Aborted(StoreError),
}

async fn wait_dispatch(scheduler: Arc<dyn Scheduler>, force: Arc<ForceFlush>) -> DispatchOutcome {
    race(scheduler.wait(), force.wait()).await;
    DispatchOutcome::Dispatch
}

async fn wait_abort(signal: AbortSignal) -> DispatchOutcome {
    DispatchOutcome::Aborted(signal.wait_aborted().await)
}

async fn wait_to_dispatch(
    scheduler: Arc<dyn Scheduler>,
    force: Arc<ForceFlush>,
    signal: AbortSignal,
) -> DispatchOutcome {
    race(
        Box::pin(wait_dispatch(scheduler, force)),
        Box::pin(wait_abort(signal)),
    )
    .await
}

pub(crate) fn run_catching(f: impl FnOnce()) {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        tracing::error!(panic = ?payload, "task queue listener panicked; isolating and continuing");
    }
}
