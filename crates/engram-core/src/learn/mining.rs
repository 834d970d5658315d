//! Curriculum-scheduled hard-negative mining.
//!
//! Scores pool candidates by cosine similarity to the anchor, keeps those
//! at or above the stage threshold, and rejects any candidate within 0.85
//! cosine of a known positive (the positive-aware false-negative filter).
//! The result is the top `negative_count` candidates, hardest first,
//! bounded by [`MAX_NEGATIVES`](super::MAX_NEGATIVES) and the pool size.
//!
//! A bandit can arbitrate between mining strategies per batch; the
//! deterministic `hard` strategy is the default.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::bandit::ThompsonBandit;
use crate::learn::{CurriculumStage, MAX_NEGATIVES};
use crate::vector::cosine_similarity;

/// Candidates this close to a known positive are assumed to be unlabeled
/// positives and are never used as negatives
pub const POSITIVE_AWARE_THRESHOLD: f32 = 0.85;

/// Bandit context key for strategy selection
const MINING_CONTEXT: &str = "mining";

/// How negatives are drawn from the surviving candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiningStrategy {
    /// Highest-scoring candidates first
    Hard,
    /// Candidates closest to the stage threshold (easier than `Hard`)
    SemiHard,
    /// Uniform draw from the surviving candidates
    Random,
}

impl MiningStrategy {
    const ARMS: [&'static str; 3] = ["hard", "semi-hard", "random"];

    fn from_arm(arm: &str) -> Self {
        match arm {
            "semi-hard" => Self::SemiHard,
            "random" => Self::Random,
            _ => Self::Hard,
        }
    }
}

/// One mining call
pub struct MiningRequest<'a> {
    /// Query-side vector
    pub anchor: &'a [f32],
    /// Candidate embeddings
    pub pool: &'a [Vec<f32>],
    /// Pool indices that must not be returned (the anchor itself, the
    /// labeled positive)
    pub exclude: &'a HashSet<usize>,
    /// Known positives for the false-negative filter
    pub known_positives: &'a [Vec<f32>],
}

/// Positive-aware hard-negative miner
#[derive(Debug)]
pub struct HardNegativeMiner {
    rng: StdRng,
}

impl HardNegativeMiner {
    /// Seeded miner (the seed only affects the `Random` strategy)
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Mine with the deterministic `Hard` strategy.
    ///
    /// Returns pool indices, hardest first. An empty pool yields an
    /// empty result.
    pub fn mine(&mut self, request: &MiningRequest<'_>, stage: &CurriculumStage) -> Vec<usize> {
        self.mine_with_strategy(request, stage, MiningStrategy::Hard)
    }

    /// Mine with the strategy a bandit picks for this batch; callers
    /// reward the arm with the observed training signal
    pub fn mine_with_bandit(
        &mut self,
        request: &MiningRequest<'_>,
        stage: &CurriculumStage,
        bandit: &mut ThompsonBandit,
    ) -> (Vec<usize>, MiningStrategy) {
        let strategy = bandit
            .select_arm(MINING_CONTEXT, &MiningStrategy::ARMS)
            .map(|arm| MiningStrategy::from_arm(&arm))
            .unwrap_or(MiningStrategy::Hard);
        (self.mine_with_strategy(request, stage, strategy), strategy)
    }

    fn mine_with_strategy(
        &mut self,
        request: &MiningRequest<'_>,
        stage: &CurriculumStage,
        strategy: MiningStrategy,
    ) -> Vec<usize> {
        if request.pool.is_empty() || stage.negative_count == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(f32, usize)> = request
            .pool
            .iter()
            .enumerate()
            .filter(|(i, _)| !request.exclude.contains(i))
            .map(|(i, candidate)| (cosine_similarity(request.anchor, candidate), i))
            .filter(|(score, _)| *score >= stage.hard_negative_threshold)
            .filter(|(_, i)| {
                !request.known_positives.iter().any(|p| {
                    cosine_similarity(&request.pool[*i], p) > POSITIVE_AWARE_THRESHOLD
                })
            })
            .collect();

        let want = stage.negative_count.min(MAX_NEGATIVES).min(scored.len());
        match strategy {
            MiningStrategy::Hard => {
                scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            }
            MiningStrategy::SemiHard => {
                let pivot = stage.hard_negative_threshold;
                scored.sort_by(|a, b| {
                    (a.0 - pivot)
                        .abs()
                        .partial_cmp(&(b.0 - pivot).abs())
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
            MiningStrategy::Random => {
                scored.shuffle(&mut self.rng);
            }
        }
        scored.truncate(want);
        scored.into_iter().map(|(_, i)| i).collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
