//! Contrastive training through the store facade.

use std::collections::HashSet;

use engram_core::{MiningRequest, TrainingSample};
use engram_e2e_tests::{memory_store, pseudo_vector};

fn normalize(v: &[f32]) -> Vec<f32> {
    let n = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-12);
    v.iter().map(|x| x / n).collect()
}

/// InfoNCE falls over 200 batches: the mean of the last 20 losses is
/// below the mean of the first 20.
#[test]
fn info_nce_loss_decreases() {
    let store = memory_store(8);

    // Anchor a, positive a + 0.01·u, negatives pseudo-random
    let mut batch = Vec::new();
    for s in 0..8 {
        let anchor = normalize(&pseudo_vector(8, s + 1));
        let direction = normalize(&pseudo_vector(8, s + 100));
        let positive: Vec<f32> = anchor
            .iter()
            .zip(direction.iter())
            .map(|(a, u)| a + 0.01 * u)
            .collect();
        let negatives: Vec<Vec<f32>> = (0..4)
            .map(|n| normalize(&pseudo_vector(8, 1000 + s * 10 + n)))
            .collect();
        batch.push(TrainingSample {
            anchor,
            positive,
            negatives,
        });
    }

    let mut losses = Vec::with_capacity(200);
    for _ in 0..200 {
        losses.push(store.train_batch(&batch, None).unwrap());
    }

    let first: f32 = losses[..20].iter().sum::<f32>() / 20.0;
    let last: f32 = losses[180..].iter().sum::<f32>() / 20.0;
    assert!(
        last < first,
        "expected loss to fall: first-20 avg {first}, last-20 avg {last}"
    );
}

/// Every batch publishes a new projection generation.
#[test]
fn generations_advance_with_training() {
    let store = memory_store(4);
    assert_eq!(store.projection_generation(), 0);
    let sample = TrainingSample {
        anchor: vec![1.0, 0.0, 0.0, 0.0],
        positive: vec![0.9, 0.1, 0.0, 0.0],
        negatives: vec![vec![0.0, 0.0, 1.0, 0.0]],
    };
    for expected in 1..=3 {
        store.train_batch(std::slice::from_ref(&sample), None).unwrap();
        assert_eq!(store.projection_generation(), expected);
    }
}

/// Mining through the store respects the stage threshold and exclusions;
/// an empty pool yields an empty result.
#[test]
fn store_level_mining() {
    let store = memory_store(4);
    let anchor = vec![1.0, 0.0, 0.0, 0.0];

    let exclude = HashSet::new();
    let empty: Vec<Vec<f32>> = Vec::new();
    let mined = store.mine_hard_negatives(&MiningRequest {
        anchor: &anchor,
        pool: &empty,
        exclude: &exclude,
        known_positives: &[],
    });
    assert!(mined.is_empty());

    let pool = vec![
        vec![0.95, 0.05, 0.0, 0.0], // hard
        vec![0.0, 1.0, 0.0, 0.0],   // below stage-0 threshold (0.5)
    ];
    let mined = store.mine_hard_negatives(&MiningRequest {
        anchor: &anchor,
        pool: &pool,
        exclude: &exclude,
        known_positives: &[],
    });
    assert_eq!(mined, vec![0]);

    let exclude: HashSet<usize> = [0].into();
    let mined = store.mine_hard_negatives(&MiningRequest {
        anchor: &anchor,
        pool: &pool,
        exclude: &exclude,
        known_positives: &[],
    });
    assert!(mined.is_empty());
}

/// Stage 0 of the default curriculum is (4 negatives, 0.5 threshold).
#[test]
fn default_curriculum_stage_zero() {
    let store = memory_store(4);
    let stage = store.trainer_stage();
    assert_eq!(stage.negative_count, 4);
    assert!((stage.hard_negative_threshold - 0.5).abs() < 1e-6);
    assert_eq!(stage.batches, 100);
}
