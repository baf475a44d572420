//! State-level invariants, round-trip/idempotence properties, boundary
//! behavior, and a batched key-subscription scenario, exercised against
//! the public `ReactiveState`/`guard` surface rather than through
//! internal unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proptest::prelude::*;

use vireo_core::state::{Key, ReactiveState, Value};

fn calls() -> (Arc<AtomicUsize>, impl Fn(&vireo_core::state::Snapshot) + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    (count, move |_: &vireo_core::state::Snapshot| {
        c.fetch_add(1, Ordering::SeqCst);
    })
}

// Invariant: mutations whose final value is Object.is-equal to the prior
// one produce zero notifications, across a range of value kinds.
proptest! {
    #[test]
    fn equal_sets_never_notify(n in any::<i64>(), repeats in 1usize..5) {
        let state = ReactiveState::new();
        state.set("k", Value::I64(n));
        let (count, cb) = calls();
        state.subscribe_all(cb);
        for _ in 0..repeats {
            state.set("k", Value::I64(n));
        }
        prop_assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}

// Invariant: a batch touching N distinct keys fires each subscribed
// key-listener at most once, regardless of N.
#[test]
fn batch_with_n_distinct_keys_fires_each_key_listener_once() {
    let state = ReactiveState::new();
    let keys: Vec<Key> = (0..8).map(|i| Key::from(format!("k{i}"))).collect();
    let mut counters = Vec::new();
    for key in &keys {
        let (count, cb) = calls();
        state.subscribe_keys([key.clone()], cb);
        counters.push(count);
    }
    state.batch(|| {
        for (i, key) in keys.iter().enumerate() {
            state.set(key.clone(), Value::I64(i as i64));
        }
    });
    for count in &counters {
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

// Batched key-subscription: two subscribers on disjoint keys, one `patch`
// touching both — each fires exactly once, seeing its own key.
#[test]
fn scenario_batched_key_subscription() {
    let state = ReactiveState::new();
    state.patch([
        (Key::from("volume"), Value::I64(1)),
        (Key::from("muted"), Value::Bool(false)),
    ]);

    let volume_calls = Arc::new(AtomicUsize::new(0));
    let vc = volume_calls.clone();
    state.subscribe_keys([Key::from("volume")], move |snap| {
        assert_eq!(snap.get("volume").unwrap().as_i64(), Some(0));
        vc.fetch_add(1, Ordering::SeqCst);
    });

    let muted_calls = Arc::new(AtomicUsize::new(0));
    let mc = muted_calls.clone();
    state.subscribe_keys([Key::from("muted")], move |snap| {
        assert_eq!(snap.get("muted").unwrap().as_bool(), Some(true));
        mc.fetch_add(1, Ordering::SeqCst);
    });

    state.patch([
        (Key::from("volume"), Value::I64(0)),
        (Key::from("muted"), Value::Bool(true)),
    ]);

    assert_eq!(volume_calls.load(Ordering::SeqCst), 1);
    assert_eq!(muted_calls.load(Ordering::SeqCst), 1);
}

// Round-trip / idempotence: flush() with an empty pending set is a no-op
// (no panic, no spurious notification).
#[test]
fn flush_with_nothing_pending_is_a_no_op() {
    let state = ReactiveState::new();
    let (count, cb) = calls();
    state.subscribe_all(cb);
    state.flush();
    state.flush();
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

// Boundary: same-tick set(K, v) then set(K, prior) notifies nobody.
#[test]
fn revert_within_a_batch_notifies_nobody() {
    let state = ReactiveState::new();
    state.set("volume", Value::I64(1));
    let (count, cb) = calls();
    state.subscribe_keys([Key::from("volume")], cb);
    state.batch(|| {
        state.set("volume", Value::I64(2));
        state.set("volume", Value::I64(1));
    });
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(state.get("volume").unwrap().as_i64(), Some(1));
}

// Boundary: a guard whose promise resolves after the signal aborts
// rejects ABORTED, not the guard's own eventual result.
#[test]
fn guard_resolving_after_abort_still_reports_aborted() {
    use vireo_core::abort::AbortController;
    use vireo_core::error::ErrorKind;
    use vireo_core::guard::{run_guard, Guard};

    struct SlowTrue;
    impl Guard<()> for SlowTrue {
        fn check<'a>(
            &'a self,
            _target: &'a (),
            _signal: &'a vireo_core::abort::AbortSignal,
        ) -> vireo_core::guard::BoxFuture<'a, vireo_core::guard::GuardOutcome> {
            Box::pin(async { std::future::pending::<()>().await; Ok(true) })
        }
    }

    futures_lite::future::block_on(async {
        let controller = AbortController::new();
        let signal = controller.signal();
        controller.abort(ErrorKind::Aborted);
        let result = run_guard(&SlowTrue, &(), &signal).await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::Aborted);
    });
}

// Boundary: `any` with one synchronous true and one pending guard resolves
// without waiting for the pending one.
#[test]
fn any_with_one_sync_true_ignores_a_pending_guard() {
    use vireo_core::abort::AbortController;
    use vireo_core::guard::{any, predicate, Guard, GuardOutcome};

    let pending = |_: &(), _: &vireo_core::abort::AbortSignal| std::future::pending::<GuardOutcome>();
    let guards: Vec<Arc<dyn Guard<()>>> = vec![Arc::new(predicate::<(), _>(|_| true)), Arc::new(pending)];
    futures_lite::future::block_on(async {
        let signal = AbortController::new().signal();
        assert!(any(&guards, &(), &signal).await.is_ok());
    });
}
