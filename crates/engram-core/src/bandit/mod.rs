//! Contextual Thompson-sampling bandit.
//!
//! Per `(context, arm)` pair a Beta(α, β) posterior plus an exponential
//! moving average of cost. Used by the tiered compressor to pick
//! quantization tiers and by the trainer's hard-negative miner to pick
//! mining strategies.
//!
//! Sampling: Jöhnk's algorithm when both α and β are below 1,
//! gamma-ratio via Marsaglia-Tsang otherwise. Arms never pulled in a
//! context sample from U(0,1) plus an exploration bonus.
//!
//! State round-trips through a versioned JSON document.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngramError, Result};

/// Serialization format version
const STATE_VERSION: u32 = 1;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Bandit tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditConfig {
    /// Added to the uniform sample of never-pulled arms
    pub exploration_bonus: f64,
    /// How strongly the cost EMA subtracts from the sampled score
    pub cost_weight: f64,
    /// EMA decay for cost updates
    pub cost_decay: f64,
    /// RNG seed (deterministic runs pass a fixed seed)
    pub seed: u64,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            exploration_bonus: 0.1,
            cost_weight: 0.1,
            cost_decay: 0.1,
            seed: 0x5EED_BA2D,
        }
    }
}

/// Posterior state for one `(context, arm)` pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmStats {
    /// Beta success parameter; never below 1
    pub alpha: f64,
    /// Beta failure parameter; never below 1
    pub beta: f64,
    /// Times this arm was rewarded
    pub pulls: u64,
    /// Exponential moving average of observed cost
    pub cost_ema: f64,
}

impl Default for ArmStats {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            pulls: 0,
            cost_ema: 0.0,
        }
    }
}

/// Serialized bandit state
#[derive(Serialize, Deserialize)]
struct BanditState {
    version: u32,
    config: BanditConfig,
    contexts: HashMap<String, HashMap<String, ArmStats>>,
}

// ============================================================================
// BANDIT
// ============================================================================

/// Contextual Thompson-sampling arm selector
#[derive(Debug)]
pub struct ThompsonBandit {
    config: BanditConfig,
    contexts: HashMap<String, HashMap<String, ArmStats>>,
    rng: StdRng,
}

impl ThompsonBandit {
    /// Create with default configuration
    pub fn new() -> Self {
        Self::with_config(BanditConfig::default())
    }

    /// Create with explicit configuration (and seed)
    pub fn with_config(config: BanditConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            contexts: HashMap::new(),
            rng,
        }
    }

    /// Pick an arm for a context by Thompson sampling.
    ///
    /// Returns `None` only when `arms` is empty.
    pub fn select_arm(&mut self, context: &str, arms: &[&str]) -> Option<String> {
        if arms.is_empty() {
            return None;
        }
        let mut best: Option<(f64, &str)> = None;
        for &arm in arms {
            let (sample, cost_ema) = match self
                .contexts
                .get(context)
                .and_then(|c| c.get(arm))
                .filter(|s| s.pulls > 0)
            {
                Some(stats) => (
                    sample_beta(&mut self.rng, stats.alpha, stats.beta),
                    stats.cost_ema,
                ),
                None => (
                    self.rng.r#gen::<f64>() + self.config.exploration_bonus,
                    0.0,
                ),
            };
            let score = sample - self.config.cost_weight * cost_ema;
            if best.map(|(s, _)| score > s).unwrap_or(true) {
                best = Some((score, arm));
            }
        }
        best.map(|(_, arm)| arm.to_string())
    }

    /// Record a reward in [0, 1] (and optionally a cost) for an arm
    pub fn record_reward(
        &mut self,
        context: &str,
        arm: &str,
        reward: f64,
        cost: Option<f64>,
    ) -> Result<()> {
        if !(0.0..=1.0).contains(&reward) {
            return Err(EngramError::validation(format!(
                "reward must be in [0, 1], got {reward}"
            )));
        }
        let stats = self
            .contexts
            .entry(context.to_string())
            .or_default()
            .entry(arm.to_string())
            .or_default();
        stats.alpha += reward;
        stats.beta += 1.0 - reward;
        stats.pulls += 1;
        if let Some(cost) = cost {
            stats.cost_ema =
                (1.0 - self.config.cost_decay) * stats.cost_ema + self.config.cost_decay * cost;
        }
        debug!(context, arm, reward, pulls = stats.pulls, "bandit reward");
        Ok(())
    }

    /// Posterior for a `(context, arm)` pair, if ever rewarded
    pub fn arm_stats(&self, context: &str, arm: &str) -> Option<&ArmStats> {
        self.contexts.get(context)?.get(arm)
    }

    /// Number of known contexts
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Export state as a versioned JSON document
    pub fn serialize(&self) -> Result<String> {
        let state = BanditState {
            version: STATE_VERSION,
            config: self.config.clone(),
            contexts: self.contexts.clone(),
        };
        Ok(serde_json::to_string(&state)?)
    }

    /// Reconstruct from a document produced by [`Self::serialize`]
    pub fn deserialize(json: &str) -> Result<Self> {
        let state: BanditState = serde_json::from_str(json)
            .map_err(|e| EngramError::corrupt("bandit state", e.to_string()))?;
        if state.version != STATE_VERSION {
            return Err(EngramError::corrupt(
                "bandit state",
                format!("unsupported version {}", state.version),
            ));
        }
        let rng = StdRng::seed_from_u64(state.config.seed);
        Ok(Self {
            config: state.config,
            contexts: state.contexts,
            rng,
        })
    }
}

impl Default for ThompsonBandit {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// SAMPLING
// ============================================================================

/// Draw from Beta(α, β)
fn sample_beta(rng: &mut StdRng, alpha: f64, beta: f64) -> f64 {
    if alpha < 1.0 && beta < 1.0 {
        // Jöhnk: valid and efficient for both shapes below 1
        loop {
            let u: f64 = rng.r#gen::<f64>();
            let v: f64 = rng.r#gen::<f64>();
            let x = u.powf(1.0 / alpha);
            let y = v.powf(1.0 / beta);
            if x + y <= 1.0 && x + y > 0.0 {
                return x / (x + y);
            }
        }
    }
    let x = sample_gamma(rng, alpha);
    let y = sample_gamma(rng, beta);
    if x + y == 0.0 { 0.5 } else { x / (x + y) }
}

/// Draw from Gamma(shape, 1) via Marsaglia-Tsang
fn sample_gamma(rng: &mut StdRng, shape: f64) -> f64 {
    if shape < 1.0 {
        // Boost: Gamma(a) = Gamma(a + 1) * U^(1/a)
        let u: f64 = rng.r#gen::<f64>().max(f64::MIN_POSITIVE);
        return sample_gamma(rng, shape + 1.0) * u.powf(1.0 / shape);
    }
    let d = shape - 1.0 / 3.0;
    let c = 1.0 / (9.0 * d).sqrt();
    loop {
        let x = standard_normal(rng);
        let v = (1.0 + c * x).powi(3);
        if v <= 0.0 {
            continue;
        }
        let u: f64 = rng.r#gen::<f64>().max(f64::MIN_POSITIVE);
        if u.ln() < 0.5 * x * x + d - d * v + d * v.ln() {
            return d * v;
        }
    }
}

/// Standard normal draw (Box-Muller)
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.r#gen::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.r#gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> ThompsonBandit {
        ThompsonBandit::with_config(BanditConfig {
            seed: 42,
            ..BanditConfig::default()
        })
    }

    #[test]
    fn test_select_from_empty_arms() {
        let mut bandit = seeded();
        assert_eq!(bandit.select_arm("hot", &[]), None);
    }

    #[test]
    fn test_posteriors_stay_proper() {
        let mut bandit = seeded();
        for i in 0..50 {
            let reward = if i % 3 == 0 { 1.0 } else { 0.25 };
            bandit.record_reward("warm", "pq8", reward, Some(0.2)).unwrap();
        }
        let stats = bandit.arm_stats("warm", "pq8").unwrap();
        assert!(stats.alpha >= 1.0);
        assert!(stats.beta >= 1.0);
        assert_eq!(stats.pulls, 50);
    }

    #[test]
    fn test_reward_out_of_range_rejected() {
        let mut bandit = seeded();
        assert!(bandit.record_reward("hot", "none", 1.5, None).is_err());
        assert!(bandit.record_reward("hot", "none", -0.1, None).is_err());
        // Rejected rewards leave no trace
        assert!(bandit.arm_stats("hot", "none").is_none());
    }

    #[test]
    fn test_converges_to_better_arm() {
        let mut bandit = seeded();
        for _ in 0..200 {
            bandit.record_reward("ctx", "good", 0.95, None).unwrap();
            bandit.record_reward("ctx", "bad", 0.05, None).unwrap();
        }
        let picks = (0..100)
            .filter(|_| bandit.select_arm("ctx", &["good", "bad"]).unwrap() == "good")
            .count();
        assert!(picks > 85, "expected mostly 'good', got {picks}/100");
    }

    #[test]
    fn test_cost_penalizes_expensive_arm() {
        let mut bandit = ThompsonBandit::with_config(BanditConfig {
            cost_weight: 1.0,
            seed: 7,
            ..BanditConfig::default()
        });
        for _ in 0..100 {
            bandit.record_reward("ctx", "cheap", 0.6, Some(0.0)).unwrap();
            bandit.record_reward("ctx", "pricey", 0.6, Some(1.0)).unwrap();
        }
        let picks = (0..100)
            .filter(|_| bandit.select_arm("ctx", &["cheap", "pricey"]).unwrap() == "cheap")
            .count();
        assert!(picks > 80, "expected mostly 'cheap', got {picks}/100");
    }

    #[test]
    fn test_serialize_roundtrip_preserves_posteriors() {
        let mut bandit = seeded();
        bandit.record_reward("hot", "none", 0.8, Some(0.3)).unwrap();
        bandit.record_reward("cold", "binary", 0.2, None).unwrap();

        let json = bandit.serialize().unwrap();
        let restored = ThompsonBandit::deserialize(&json).unwrap();

        for (ctx, arm) in [("hot", "none"), ("cold", "binary")] {
            let a = bandit.arm_stats(ctx, arm).unwrap();
            let b = restored.arm_stats(ctx, arm).unwrap();
            assert_eq!(a.alpha, b.alpha);
            assert_eq!(a.beta, b.beta);
            assert_eq!(a.pulls, b.pulls);
            assert_eq!(a.cost_ema, b.cost_ema);
        }
    }

    #[test]
    fn test_deserialize_rejects_bad_version() {
        let json = r#"{"version": 99, "config": {"exploration_bonus": 0.1,
            "cost_weight": 0.1, "cost_decay": 0.1, "seed": 1}, "contexts": {}}"#;
        assert!(matches!(
            ThompsonBandit::deserialize(json).unwrap_err(),
            EngramError::Corrupt { .. }
        ));
    }

    #[test]
    fn test_beta_sampler_in_unit_interval() {
        let mut rng = StdRng::seed_from_u64(3);
        for (a, b) in [(0.5, 0.5), (1.0, 1.0), (5.0, 2.0), (0.3, 4.0)] {
            for _ in 0..200 {
                let s = sample_beta(&mut rng, a, b);
                assert!((0.0..=1.0).contains(&s), "Beta({a},{b}) gave {s}");
            }
        }
    }

    #[test]
    fn test_beta_mean_tracks_parameters() {
        let mut rng = StdRng::seed_from_u64(11);
        let n = 3000;
        let mean: f64 = (0..n).map(|_| sample_beta(&mut rng, 8.0, 2.0)).sum::<f64>() / n as f64;
        // E[Beta(8,2)] = 0.8
        assert!((mean - 0.8).abs() < 0.03, "mean {mean}");
    }
}
