//! Bandit posteriors through the store surface: export/import, invariants.

use engram_e2e_tests::memory_store;

const TIERS: [&str; 5] = ["none", "half", "pq8", "pq4", "binary"];

/// R3: export → import preserves every posterior exactly.
#[test]
fn export_import_preserves_posteriors() {
    let store = memory_store(4);
    for i in 0..30 {
        let arm = TIERS[i % TIERS.len()];
        let reward = (i % 10) as f64 / 10.0;
        store
            .bandit_reward("warm", arm, reward, Some(0.1 * (i % 3) as f64))
            .unwrap();
    }
    let exported = store.bandit_export().unwrap();

    let fresh = memory_store(4);
    fresh.bandit_import(&exported).unwrap();
    assert_eq!(fresh.bandit_export().unwrap(), exported);
}

/// Selection always lands on a supplied arm, and rewards keep the
/// posteriors proper.
#[test]
fn selection_and_reward_loop() {
    let store = memory_store(4);
    for _ in 0..100 {
        let arm = store.bandit_select("hot", &TIERS).unwrap();
        assert!(TIERS.contains(&arm.as_str()));
        store.bandit_reward("hot", &arm, 0.7, None).unwrap();
    }
    // Exported state parses as the versioned document
    let exported = store.bandit_export().unwrap();
    let doc: serde_json::Value = serde_json::from_str(&exported).unwrap();
    assert_eq!(doc["version"], 1);
    for (_, arm_stats) in doc["contexts"]["hot"].as_object().unwrap() {
        assert!(arm_stats["alpha"].as_f64().unwrap() >= 1.0);
        assert!(arm_stats["beta"].as_f64().unwrap() >= 1.0);
        assert!(arm_stats["pulls"].as_u64().unwrap() >= 1);
    }
}

/// Bad documents are rejected as corrupt, leaving current state alone.
#[test]
fn import_rejects_garbage() {
    let store = memory_store(4);
    store.bandit_reward("ctx", "arm", 0.5, None).unwrap();
    let before = store.bandit_export().unwrap();

    assert!(store.bandit_import("{not json").is_err());
    assert!(store.bandit_import(r#"{"version": 9, "config": {}, "contexts": {}}"#).is_err());
    assert_eq!(store.bandit_export().unwrap(), before);
}

/// Rewards outside [0, 1] are validation errors.
#[test]
fn reward_range_enforced() {
    let store = memory_store(4);
    assert!(store.bandit_reward("ctx", "arm", 1.01, None).is_err());
    assert!(store.bandit_reward("ctx", "arm", -0.01, None).is_err());
}
