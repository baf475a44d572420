//! End-to-end scenarios exercising a full `Store` (features + queue +
//! state) together, one test per named walkthrough.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vireo::{
    CancelSpec, Feature, FeatureContext, KeySpec, RequestConfig, RequestContext, TaskKey,
};
use vireo::{AnyValue, ErrorEvent, Store, StoreConfig};
use vireo_core::error::ErrorKind;
use vireo_core::guard::{predicate, Guard};
use vireo_core::state::{Key, Value};

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    futures_lite::future::block_on(fut)
}

// Scenario: guard-gated play. A request guarded by a predicate rejects
// while the guard is falsy and succeeds once it flips true.
struct Player {
    ready: AtomicBool,
}

struct PlaybackFeature;

impl Feature<Player> for PlaybackFeature {
    fn initial_state(&self) -> HashMap<Key, Value> {
        HashMap::new()
    }

    fn get_snapshot(&self, _ctx: &FeatureContext<Player>) -> HashMap<Key, Value> {
        HashMap::new()
    }

    fn subscribe(&self, _ctx: &FeatureContext<Player>) -> Result<(), vireo_core::error::StoreError> {
        Ok(())
    }

    fn requests(&self) -> Vec<RequestConfig<Player>> {
        vec![RequestConfig::new(
            "play",
            Arc::new(|_input: AnyValue, _ctx: RequestContext<Player>| {
                Box::pin(async move { Ok(Arc::new(true) as AnyValue) })
            }),
        )
        .guard(Arc::new(predicate::<Player, _>(|target| {
            target.ready.load(Ordering::SeqCst)
        })) as Arc<dyn Guard<Player>>)]
    }
}

#[test]
fn guard_gated_play_rejects_then_succeeds_once_ready() {
    block_on(async {
        let store = Store::new(StoreConfig {
            features: vec![Arc::new(PlaybackFeature)],
            ..StoreConfig::default()
        })
        .unwrap();
        let player = Player {
            ready: AtomicBool::new(false),
        };
        let attachment = store.attach(player);

        let rejected = store.request("play", Arc::new(()) as AnyValue, None).await;
        assert_eq!(rejected.unwrap_err().kind, ErrorKind::Rejected);

        store.current_target().unwrap().ready.store(true, Ordering::SeqCst);
        let ok = store.request("play", Arc::new(()) as AnyValue, None).await.unwrap();
        assert!(*ok.downcast::<bool>().unwrap());

        attachment.detach();
    });
}

// Scenario: cancel chain. `stop` declares `cancel: ["load"]`; issuing it
// while `load` is in flight aborts `load` before `stop` itself settles,
// and `load`'s handler observes its own signal tripped before returning.
struct Loader {
    aborted_before_return: Arc<AtomicBool>,
}

struct LoaderFeature {
    aborted_before_return: Arc<AtomicBool>,
}

impl Feature<Loader> for LoaderFeature {
    fn initial_state(&self) -> HashMap<Key, Value> {
        HashMap::new()
    }

    fn get_snapshot(&self, _ctx: &FeatureContext<Loader>) -> HashMap<Key, Value> {
        HashMap::new()
    }

    fn subscribe(&self, _ctx: &FeatureContext<Loader>) -> Result<(), vireo_core::error::StoreError> {
        Ok(())
    }

    fn requests(&self) -> Vec<RequestConfig<Loader>> {
        let aborted_before_return = self.aborted_before_return.clone();
        vec![
            RequestConfig::new(
                "load",
                Arc::new(move |_input: AnyValue, ctx: RequestContext<Loader>| {
                    let aborted_before_return = aborted_before_return.clone();
                    Box::pin(async move {
                        let long_wait = async {
                            futures_timer::Delay::new(Duration::from_millis(500)).await;
                            Ok(Arc::new(()) as AnyValue)
                        };
                        let watch_abort = async {
                            let reason = ctx.signal.wait_aborted().await;
                            Err(reason)
                        };
                        let result = futures_lite::future::race(long_wait, watch_abort).await;
                        if result.is_err() {
                            aborted_before_return.store(true, Ordering::SeqCst);
                        }
                        result
                    })
                }),
            )
            .key(KeySpec::Fixed(TaskKey::from("load"))),
            RequestConfig::new(
                "stop",
                Arc::new(|_input: AnyValue, _ctx: RequestContext<Loader>| {
                    Box::pin(async move { Ok(Arc::new(()) as AnyValue) })
                }),
            )
            .key(KeySpec::Fixed(TaskKey::from("stop")))
            .cancel(CancelSpec::Fixed(vec![TaskKey::from("load")])),
        ]
    }
}

#[test]
fn stop_cancels_an_in_flight_load() {
    block_on(async {
        let aborted_before_return = Arc::new(AtomicBool::new(false));
        let store = Store::new(StoreConfig {
            features: vec![Arc::new(LoaderFeature {
                aborted_before_return: aborted_before_return.clone(),
            })],
            ..StoreConfig::default()
        })
        .unwrap();
        let attachment = store.attach(Loader {
            aborted_before_return: aborted_before_return.clone(),
        });

        let load = store.request("load", Arc::new(()) as AnyValue, None);
        let stop = async {
            futures_timer::Delay::new(Duration::from_millis(10)).await;
            store.request("stop", Arc::new(()) as AnyValue, None).await
        };
        let (load_result, stop_result) = futures_lite::future::zip(load, stop).await;

        assert_eq!(load_result.unwrap_err().kind, ErrorKind::Aborted);
        assert!(stop_result.is_ok());
        assert!(aborted_before_return.load(Ordering::SeqCst));

        attachment.detach();
    });
}

// Scenario: attach resync. A feature's `get_snapshot` reads straight off
// the target; `attach` must patch that slice synchronously before
// returning, and a later `ctx.update()` call must resync it again.
struct Amplifier {
    volume: AtomicI64,
    on_change: Mutex<Option<Box<dyn Fn() + Send>>>,
}

struct VolumeFeature;

impl Feature<Amplifier> for VolumeFeature {
    fn initial_state(&self) -> HashMap<Key, Value> {
        HashMap::from([(Key::from("volume"), Value::I64(0))])
    }

    fn get_snapshot(&self, ctx: &FeatureContext<Amplifier>) -> HashMap<Key, Value> {
        HashMap::from([(Key::from("volume"), Value::I64(ctx.target.volume.load(Ordering::SeqCst)))])
    }

    fn subscribe(&self, ctx: &FeatureContext<Amplifier>) -> Result<(), vireo_core::error::StoreError> {
        let ctx = ctx.clone();
        *ctx.target.on_change.lock().unwrap() = Some(Box::new(move || ctx.update()));
        Ok(())
    }

    fn requests(&self) -> Vec<RequestConfig<Amplifier>> {
        Vec::new()
    }
}

#[test]
fn attach_resyncs_state_synchronously_and_update_resyncs_again() {
    let store = Store::new(StoreConfig {
        features: vec![Arc::new(VolumeFeature)],
        ..StoreConfig::default()
    })
    .unwrap();
    let amp = Amplifier {
        volume: AtomicI64::new(30),
        on_change: Mutex::new(None),
    };
    let attachment = store.attach(amp);

    assert_eq!(store.state().get("volume").unwrap().as_i64(), Some(30));

    let target = store.current_target().unwrap();
    target.volume.store(80, Ordering::SeqCst);
    (target.on_change.lock().unwrap().as_ref().unwrap())();

    assert_eq!(store.state().get("volume").unwrap().as_i64(), Some(80));

    attachment.detach();
}

#[test]
fn on_error_observes_a_rejected_guard_gated_request() {
    block_on(async {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = calls.clone();
        let store = Store::new(StoreConfig {
            features: vec![Arc::new(PlaybackFeature) as Arc<dyn Feature<Player>>],
            on_error: Some(Arc::new(move |event: &ErrorEvent| {
                assert_eq!(event.error.kind, ErrorKind::Rejected);
                c.fetch_add(1, Ordering::SeqCst);
            })),
            ..StoreConfig::default()
        })
        .unwrap();
        store.attach(Player {
            ready: AtomicBool::new(false),
        });
        let _ = store.request("play", Arc::new(()) as AnyValue, None).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    });
}
