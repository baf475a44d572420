//! The reactive state container: a key-scoped, batched, equality-gated
//! store of [`Value`]s with three subscription shapes — whole-store,
//! key-scoped, and selector-derived.
//!
//! Mutations (`set`/`patch`/`delete`) are plain synchronous calls.
//! Coalescing multiple mutations into one notification pass is done with
//! a reentrancy-guarded dirty set rather than an actual microtask queue,
//! which Rust has no built-in equivalent of: the first mutation in a call
//! stack schedules a flush via [`FlushScheduler`]: inside `batch`, that
//! flush is deferred until the outermost `batch` call returns; outside
//! one, the default [`ImmediateFlush`] runs it in place.

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::scheduler::{FlushScheduler, ImmediateFlush};

pub type Key = Arc<str>;

/// A dynamic value stored under a state key. Features keep whatever
/// JSON-ish data they need; this closed enum covers the common shapes,
/// with an [`Value::Opaque`] escape hatch for feature-specific payloads
/// that don't fit the other variants.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    Map(Arc<HashMap<Key, Value>>),
    Opaque(Arc<dyn std::any::Any + Send + Sync>),
}

impl Value {
    #[must_use]
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Value::Str(s.into())
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// `Object.is`-equivalent equality: primitives compare by value (with
/// `F64` using bit-pattern comparison so `NaN` equals `NaN` and `+0.0`
/// differs from `-0.0`, matching `Object.is` rather than IEEE `==`);
/// `Map` and `Opaque` compare by reference identity, matching how
/// `Object.is` treats two distinct objects as unequal even with identical
/// contents.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(a, b),
            (Value::Opaque(a), Value::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// An `Object.is`-style comparator, exposed as a free function for callers
/// that want it as a pluggable equality (e.g. a selector subscription's
/// custom `equals`).
#[must_use]
pub fn object_is(a: &Value, b: &Value) -> bool {
    a == b
}

/// An immutable, cheaply-cloneable view of the store's contents at one
/// flush boundary. Handed to whole-store and key-scoped subscribers.
#[derive(Clone)]
pub struct Snapshot(Arc<HashMap<Key, Value>>);

impl Snapshot {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

impl Deref for Snapshot {
    type Target = HashMap<Key, Value>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

type SnapshotCallback = Arc<dyn Fn(&Snapshot) + Send + Sync>;
type SelectorCallback = Arc<dyn Fn(&Value) + Send + Sync>;
type Selector = Arc<dyn Fn(&Snapshot) -> Value + Send + Sync>;
type Equality = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

enum SubKind {
    All(SnapshotCallback),
    Keys(HashSet<Key>, SnapshotCallback),
    Selector {
        selector: Selector,
        equality: Equality,
        callback: SelectorCallback,
        last: Option<Value>,
    },
}

struct SubscriberEntry {
    alive: bool,
    kind: SubKind,
}

enum FireAction {
    Snapshot(SnapshotCallback, Snapshot),
    Selector(SelectorCallback, Value),
}

struct Inner {
    values: HashMap<Key, Value>,
    dirty: HashSet<Key>,
    /// The value each dirty key held just before its *first* mutation
    /// since the last flush (`None` if the key didn't exist yet). Lets
    /// `flush` tell a real change from a same-window `set(K, v)` then
    /// `set(K, prior)` round trip, which must notify nobody.
    baseline: HashMap<Key, Option<Value>>,
    subscribers: Vec<SubscriberEntry>,
    batch_depth: u32,
    scheduled: bool,
}

fn capture_baseline(inner: &mut Inner, key: &Key) {
    if !inner.baseline.contains_key(key) {
        let existing = inner.values.get(key).cloned();
        inner.baseline.insert(key.clone(), existing);
    }
}

fn values_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// A key-scoped, batched, equality-gated reactive store. Cheap to clone:
/// every clone shares the same underlying state and subscriber list.
#[derive(Clone)]
pub struct ReactiveState {
    inner: Arc<Mutex<Inner>>,
    scheduler: Arc<dyn FlushScheduler>,
}

/// A live subscription. Call [`Subscription::unsubscribe`] to stop
/// receiving notifications. Alive flags are snapshotted before any
/// callback in a flush runs, so unsubscribing from within a callback
/// stops only *future* flushes, not the one already in progress.
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

impl Default for ReactiveState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReactiveState {
    #[must_use]
    pub fn new() -> Self {
        Self::with_scheduler(ImmediateFlush)
    }

    #[must_use]
    pub fn with_scheduler(scheduler: impl FlushScheduler + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                values: HashMap::new(),
                dirty: HashSet::new(),
                baseline: HashMap::new(),
                subscribers: Vec::new(),
                batch_depth: 0,
                scheduled: false,
            })),
            scheduler: Arc::new(scheduler),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot(Arc::new(self.inner.lock().values.clone()))
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().values.get(key).cloned()
    }

    /// Sets `key` to `value`. A no-op (no dirty mark, no notification) if
    /// the new value is [`object_is`]-equal to the current one.
    pub fn set(&self, key: impl Into<Key>, value: Value) {
        let key = key.into();
        let mut inner = self.inner.lock();
        if inner.values.get(&key).is_some_and(|cur| *cur == value) {
            return;
        }
        capture_baseline(&mut inner, &key);
        inner.values.insert(key.clone(), value);
        inner.dirty.insert(key);
        self.mark_and_maybe_schedule(inner);
    }

    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.lock();
        if inner.values.contains_key(key) {
            let key: Key = Arc::from(key);
            capture_baseline(&mut inner, &key);
            inner.values.remove(&key);
            inner.dirty.insert(key);
            self.mark_and_maybe_schedule(inner);
        }
    }

    /// Applies every entry in `patch`, gating each one through the same
    /// equality check as [`set`](Self::set), then schedules at most one
    /// flush for the whole batch.
    pub fn patch(&self, patch: impl IntoIterator<Item = (Key, Value)>) {
        let mut inner = self.inner.lock();
        let mut changed = false;
        for (key, value) in patch {
            if inner.values.get(&key).is_some_and(|cur| *cur == value) {
                continue;
            }
            capture_baseline(&mut inner, &key);
            inner.values.insert(key.clone(), value);
            inner.dirty.insert(key);
            changed = true;
        }
        if changed {
            self.mark_and_maybe_schedule(inner);
        }
    }

    /// Runs `f`, deferring any flush triggered by mutations inside it until
    /// `f` returns, then flushing once. Nested batches coalesce into the
    /// outermost one.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        {
            let mut inner = self.inner.lock();
            inner.batch_depth += 1;
        }
        let result = f();
        let should_flush = {
            let mut inner = self.inner.lock();
            inner.batch_depth -= 1;
            inner.batch_depth == 0 && !inner.dirty.is_empty()
        };
        if should_flush {
            self.flush();
        }
        result
    }

    fn mark_and_maybe_schedule(&self, mut inner: parking_lot::MutexGuard<'_, Inner>) {
        if inner.batch_depth > 0 || inner.scheduled {
            return;
        }
        inner.scheduled = true;
        drop(inner);
        let this = self.clone();
        self.scheduler.schedule(Box::new(move || this.flush()));
    }

    /// Runs one notification pass over every dirty key, firing whichever
    /// subscribers are affected, then clears the dirty set. Subscriber
    /// callbacks are invoked with the state's internal lock released, so
    /// they may freely call back into `self` (read a snapshot, subscribe,
    /// unsubscribe) without deadlocking.
    pub fn flush(&self) {
        let actions = {
            let mut inner = self.inner.lock();
            inner.scheduled = false;
            if inner.dirty.is_empty() {
                return;
            }
            let dirty = std::mem::take(&mut inner.dirty);
            let baseline = std::mem::take(&mut inner.baseline);
            let truly_dirty: HashSet<Key> = dirty
                .into_iter()
                .filter(|key| {
                    let before = baseline.get(key).cloned().flatten();
                    let after = inner.values.get(key).cloned();
                    !values_equal(before.as_ref(), after.as_ref())
                })
                .collect();
            if truly_dirty.is_empty() {
                return;
            }
            let snapshot = Snapshot(Arc::new(inner.values.clone()));
            let mut actions = Vec::new();
            for entry in &mut inner.subscribers {
                if !entry.alive {
                    continue;
                }
                match &mut entry.kind {
                    SubKind::All(cb) => {
                        actions.push(FireAction::Snapshot(cb.clone(), snapshot.clone()));
                    }
                    SubKind::Keys(keys, cb) => {
                        if keys.iter().any(|k| truly_dirty.contains(k)) {
                            actions.push(FireAction::Snapshot(cb.clone(), snapshot.clone()));
                        }
                    }
                    SubKind::Selector {
                        selector,
                        equality,
                        callback,
                        last,
                    } => {
                        let new_value = selector(&snapshot);
                        let changed = last.as_ref().map_or(true, |l| !equality(l, &new_value));
                        if changed {
                            *last = Some(new_value.clone());
                            actions.push(FireAction::Selector(callback.clone(), new_value));
                        }
                    }
                }
            }
            actions
        };
        for action in actions {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| match action {
                FireAction::Snapshot(cb, snap) => cb(&snap),
                FireAction::Selector(cb, val) => cb(&val),
            }));
            if let Err(payload) = outcome {
                tracing::error!(panic = ?payload, "state subscriber panicked; isolating and continuing");
            }
        }
    }

    /// Subscribes to every flush, regardless of which keys changed.
    pub fn subscribe_all(&self, callback: impl Fn(&Snapshot) + Send + Sync + 'static) -> Subscription {
        self.push_subscriber(SubKind::All(Arc::new(callback)))
    }

    /// Subscribes to flushes where at least one of `keys` is dirty.
    pub fn subscribe_keys(
        &self,
        keys: impl IntoIterator<Item = Key>,
        callback: impl Fn(&Snapshot) + Send + Sync + 'static,
    ) -> Subscription {
        self.push_subscriber(SubKind::Keys(keys.into_iter().collect(), Arc::new(callback)))
    }

    /// Subscribes to a derived value. Fires only when `selector`'s output
    /// changes under `equality` (defaulting to [`object_is`]), not on
    /// every flush.
    pub fn subscribe_selector(
        &self,
        selector: impl Fn(&Snapshot) -> Value + Send + Sync + 'static,
        callback: impl Fn(&Value) + Send + Sync + 'static,
        equality: Option<Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>>,
    ) -> Subscription {
        self.push_subscriber(SubKind::Selector {
            selector: Arc::new(selector),
            equality: equality.unwrap_or_else(|| Arc::new(object_is)),
            callback: Arc::new(callback),
            last: None,
        })
    }

    fn push_subscriber(&self, kind: SubKind) -> Subscription {
        let mut inner = self.inner.lock();
        let index = inner.subscribers.len();
        inner.subscribers.push(SubscriberEntry { alive: true, kind });
        Subscription {
            inner: Arc::downgrade(&self.inner),
            index,
        }
    }
}
