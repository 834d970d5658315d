//! Router persistence across process lifetimes.

use std::time::Duration;

use engram_core::{AddIntent, IntentRouter, Metadata, RouterConfig};
use engram_e2e_tests::unit;

fn add(router: &mut IntentRouter, name: &str, axis: usize) {
    router
        .add_intent(AddIntent {
            name: name.to_string(),
            exemplars: vec![unit(64, axis), unit(64, axis)],
            metadata: Metadata::new(),
        })
        .unwrap();
}

/// Create a router, add three intents, flush, destroy; a fresh router on
/// the same path sees the same intents and routes each centroid home.
#[test]
fn router_state_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("router.json");

    {
        let mut router = IntentRouter::new(RouterConfig::new(64));
        router.set_path(&path).unwrap();
        add(&mut router, "intent-a", 0);
        add(&mut router, "intent-b", 7);
        add(&mut router, "intent-c", 21);
        router.persist().unwrap();
    }

    let restored = IntentRouter::load(&path, RouterConfig::new(64)).unwrap();
    assert_eq!(
        restored.intent_names(),
        vec!["intent-a", "intent-b", "intent-c"]
    );
    for (name, axis) in [("intent-a", 0), ("intent-b", 7), ("intent-c", 21)] {
        let centroid = restored.intent(name).unwrap().centroid.clone();
        assert_eq!(centroid, unit(64, axis));
        let matches = restored.route(&centroid, 1).unwrap();
        assert_eq!(matches[0].intent, name);
        assert!((matches[0].score - 1.0).abs() < 1e-6);
    }
}

/// The debounce timer flushes on its own once the quiet period elapses.
#[test]
fn debounced_flush_fires_after_quiet_period() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("router.json");

    let mut router = IntentRouter::new(RouterConfig {
        debounce: Duration::from_millis(50),
        ..RouterConfig::new(64)
    });
    router.set_path(&path).unwrap();
    add(&mut router, "only", 3);

    assert!(router.persist_pending());
    assert!(!path.exists());
    std::thread::sleep(Duration::from_millis(80));
    assert!(router.tick().unwrap());
    assert!(path.exists());

    let restored = IntentRouter::load(&path, RouterConfig::new(64)).unwrap();
    assert_eq!(restored.intent_names(), vec!["only"]);
}

/// Every write re-arms the timer; close() flushes whatever is pending.
#[test]
fn close_flushes_pending_writes() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("router.json");

    let mut router = IntentRouter::new(RouterConfig::new(64));
    router.set_path(&path).unwrap();
    add(&mut router, "late", 9);
    // Debounce (default 5 s) has not fired; close must not lose the write
    router.close().unwrap();

    let restored = IntentRouter::load(&path, RouterConfig::new(64)).unwrap();
    assert_eq!(restored.intent_names(), vec!["late"]);
}
