//! Compression tier round trips through the store facade.

use engram_core::{Tier, TieredCompressor, cosine_distance};
use engram_e2e_tests::{memory_store, pseudo_vector};

/// pq8 keeps an alternating-sign vector within its cosine bound.
#[test]
fn pq8_round_trip_within_bound() {
    let v = vec![1.0f32, -1.0, 2.0, -2.0, 3.0, -3.0, 4.0, -4.0];
    let mut compressor = TieredCompressor::new(8);
    compressor.compress_as("v", &v, Tier::Pq8, 0.5).unwrap();
    let restored = compressor.decompress("v").unwrap();
    assert!(cosine_distance(&restored, &v) < 0.01);
}

/// The binary tier truncates to the leading half, encodes the mean-split
/// pattern there, and zero-pads the tail on decompression.
#[test]
fn binary_tier_truncates_and_zero_pads() {
    // D=16 so truncation keeps the leading 8; positive-leaning values so
    // the truncated mean is nonzero
    let v: Vec<f32> = (0..16).map(|i| 0.5 + ((i as f32) * 0.9).sin() * 0.4).collect();
    let mut compressor = TieredCompressor::new(16);
    compressor.compress_as("v", &v, Tier::Binary, 0.05).unwrap();

    let entry = compressor.entry("v").unwrap();
    assert_eq!(entry.truncated_dim, Some(8));

    let restored = compressor.decompress("v").unwrap();
    assert_eq!(restored.len(), 16);
    assert!(restored[8..].iter().all(|&x| x == 0.0));

    let mean = v[..8].iter().sum::<f32>() / 8.0;
    for i in 0..8 {
        let expected = if v[i] >= mean { mean * 1.1 } else { mean * 0.9 };
        assert!((restored[i] - expected).abs() < 1e-6);
    }
}

/// Every lossy tier respects its cosine bound on realistic vectors.
#[test]
fn all_tiers_respect_cosine_bounds() {
    let v = pseudo_vector(64, 5).iter().map(|x| x + 0.3).collect::<Vec<f32>>();
    for tier in [Tier::None, Tier::Half, Tier::Pq8, Tier::Pq4, Tier::Binary] {
        let mut compressor = TieredCompressor::new(64);
        compressor.compress_as("v", &v, tier, 0.5).unwrap();
        let restored = compressor.decompress("v").unwrap();
        if tier == Tier::None {
            assert_eq!(restored, v, "none tier must be bit-exact");
        } else {
            let d = cosine_distance(&restored, &v);
            assert!(
                d <= tier.cosine_bound(),
                "{}: {d} > {}",
                tier.as_str(),
                tier.cosine_bound()
            );
        }
    }
}

/// Frequency updates through the store re-tier entries; repeating the
/// same update is a no-op.
#[test]
fn store_frequency_updates_are_idempotent() {
    let store = memory_store(8);
    let v = pseudo_vector(8, 1);
    store.insert("e", &v, None, None).unwrap();

    // Fresh entries are hot
    let stats = store.status();
    assert_eq!(stats.compression.entries_per_tier["none"], 1);

    let tier = store.update_frequency("e", 0.5).unwrap();
    assert_eq!(tier, Tier::Pq8);
    let once = store.decompress("e").unwrap();

    let tier = store.update_frequency("e", 0.5).unwrap();
    assert_eq!(tier, Tier::Pq8);
    assert_eq!(store.decompress("e").unwrap(), once);

    assert!(store.update_frequency("ghost", 0.5).is_none());
}

/// Savings estimate follows the tier mix.
#[test]
fn savings_track_tier_mix() {
    let store = memory_store(8);
    for i in 0..4 {
        store.insert(&format!("e{i}"), &pseudo_vector(8, i), None, None).unwrap();
    }
    let _ = store.update_frequency("e0", 0.1); // binary
    let _ = store.update_frequency("e1", 0.3); // pq4
    let stats = store.status();
    assert_eq!(stats.compression.entries_per_tier["none"], 2);
    assert_eq!(stats.compression.entries_per_tier["binary"], 1);
    assert_eq!(stats.compression.entries_per_tier["pq4"], 1);
    // (0 + 0 + 96 + 87.5) / 4
    assert!((stats.compression.estimated_savings_percent - 45.875).abs() < 1e-6);
}
