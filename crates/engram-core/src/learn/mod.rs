//! Contrastive retrieval learning.
//!
//! Learns a D×D projection `W` and bias `b` (initialized `W = I + ε·U`,
//! `b = 0`) applied to queries and keys before search. Training minimizes
//! InfoNCE over `{anchor, positive, negatives[]}` triples:
//!
//! ```text
//! L = -log( exp(sim(Wa, Wp)/τ) / Σ_x exp(sim(Wa, Wx)/τ) )
//! ```
//!
//! with cosine `sim` and temperature τ (default 0.07). Gradients are
//! analytic; parameters update in place with AdamW (decoupled weight
//! decay). A curriculum schedules negative counts and mining thresholds;
//! the hard-negative miner is positive-aware, rejecting candidates too
//! close to any known positive.
//!
//! Readers never see a half-written projection: each weight write
//! publishes a fresh immutable snapshot and bumps a generation counter;
//! in-flight searches keep the snapshot they started with.

pub mod mining;

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{EngramError, Result};
use crate::vector::{check_dimension, cosine_similarity};

pub use mining::{HardNegativeMiner, MiningRequest};

/// Hard ceiling on negatives per sample
pub const MAX_NEGATIVES: usize = 128;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// One curriculum stage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurriculumStage {
    /// Negatives mined per sample in this stage
    pub negative_count: usize,
    /// Minimum anchor-candidate cosine for a candidate to count as hard
    pub hard_negative_threshold: f32,
    /// Batches before advancing
    pub batches: usize,
}

/// Trainer hyperparameters
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// Vector dimensionality (projection is D×D)
    pub dimension: usize,
    /// InfoNCE temperature, in [0.01, 1.0]
    pub temperature: f32,
    /// AdamW learning rate
    pub learning_rate: f32,
    /// Decoupled weight decay (applied to W, not b)
    pub weight_decay: f32,
    /// AdamW β1
    pub beta1: f32,
    /// AdamW β2
    pub beta2: f32,
    /// AdamW ε
    pub epsilon: f32,
    /// Scale of the uniform noise added to the identity at init
    pub init_noise: f32,
    /// RNG seed for init noise
    pub seed: u64,
    /// Curriculum stages, easiest first; never regresses
    pub curriculum: Vec<CurriculumStage>,
}

impl TrainerConfig {
    /// Defaults for a given dimensionality
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            temperature: 0.07,
            learning_rate: 1e-3,
            weight_decay: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            init_noise: 1e-3,
            seed: 0xC0FFEE,
            curriculum: vec![
                CurriculumStage { negative_count: 4, hard_negative_threshold: 0.5, batches: 100 },
                CurriculumStage { negative_count: 8, hard_negative_threshold: 0.3, batches: 100 },
                CurriculumStage { negative_count: 16, hard_negative_threshold: 0.1, batches: 100 },
            ],
        }
    }

    fn validate(&self) -> Result<()> {
        if !(0.01..=1.0).contains(&self.temperature) {
            return Err(EngramError::validation(format!(
                "temperature must be in [0.01, 1.0], got {}",
                self.temperature
            )));
        }
        if self.curriculum.is_empty() {
            return Err(EngramError::validation("curriculum must have at least one stage"));
        }
        Ok(())
    }
}

// ============================================================================
// PROJECTION SNAPSHOT
// ============================================================================

/// An immutable projection snapshot (`W`, `b`, generation)
#[derive(Debug, Clone)]
pub struct Projection {
    /// Row-major D×D weight matrix
    pub weight: Vec<f32>,
    /// Bias vector
    pub bias: Vec<f32>,
    /// Dimensionality
    pub dimension: usize,
    /// Increments on every weight write
    pub generation: u64,
}

impl Projection {
    /// Apply `Wv + b`
    pub fn project(&self, v: &[f32]) -> Result<Vec<f32>> {
        check_dimension(self.dimension, v)?;
        let d = self.dimension;
        let mut out = self.bias.clone();
        for (i, out_i) in out.iter_mut().enumerate() {
            let row = &self.weight[i * d..(i + 1) * d];
            *out_i += row.iter().zip(v.iter()).map(|(w, x)| w * x).sum::<f32>();
        }
        Ok(out)
    }
}

// ============================================================================
// SAMPLES
// ============================================================================

/// One InfoNCE training triple
#[derive(Debug, Clone)]
pub struct TrainingSample {
    /// Query-side vector
    pub anchor: Vec<f32>,
    /// Key that should rank first
    pub positive: Vec<f32>,
    /// Keys that should rank below the positive
    pub negatives: Vec<Vec<f32>>,
}

// ============================================================================
// TRAINER
// ============================================================================

/// InfoNCE projection learner with AdamW and a curriculum
#[derive(Debug)]
pub struct ContrastiveTrainer {
    config: TrainerConfig,
    /// Published snapshot; readers clone the Arc and keep it
    snapshot: RwLock<Arc<Projection>>,
    generation: AtomicU64,
    // Mutable training state
    weight: Vec<f32>,
    bias: Vec<f32>,
    m_weight: Vec<f32>,
    v_weight: Vec<f32>,
    m_bias: Vec<f32>,
    v_bias: Vec<f32>,
    step: u64,
    stage_index: usize,
    batches_in_stage: usize,
}

impl ContrastiveTrainer {
    /// Create with `W = I + ε·U(-1,1)`, `b = 0`
    pub fn new(config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        let d = config.dimension;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut weight = vec![0.0f32; d * d];
        for (idx, w) in weight.iter_mut().enumerate() {
            let identity = if idx / d == idx % d { 1.0 } else { 0.0 };
            *w = identity + config.init_noise * rng.gen_range(-1.0f32..1.0);
        }
        let bias = vec![0.0f32; d];
        let snapshot = Arc::new(Projection {
            weight: weight.clone(),
            bias: bias.clone(),
            dimension: d,
            generation: 0,
        });
        Ok(Self {
            snapshot: RwLock::new(snapshot),
            generation: AtomicU64::new(0),
            weight,
            bias,
            m_weight: vec![0.0; d * d],
            v_weight: vec![0.0; d * d],
            m_bias: vec![0.0; d],
            v_bias: vec![0.0; d],
            step: 0,
            stage_index: 0,
            batches_in_stage: 0,
            config,
        })
    }

    /// Trainer hyperparameters
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Current curriculum stage
    pub fn current_stage(&self) -> CurriculumStage {
        self.config.curriculum[self.stage_index]
    }

    /// Zero-based index of the current stage
    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    /// Generation of the latest published snapshot
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Latest published snapshot; callers keep it for a whole search
    pub fn projection(&self) -> Arc<Projection> {
        self.snapshot.read().expect("projection lock poisoned").clone()
    }

    /// Train one batch; returns the mean InfoNCE loss.
    ///
    /// Advances the curriculum when the stage's batch budget is met.
    pub fn train_batch(
        &mut self,
        samples: &[TrainingSample],
        cancel: Option<&CancelToken>,
    ) -> Result<f32> {
        if samples.is_empty() {
            return Err(EngramError::validation("empty training batch"));
        }
        let d = self.config.dimension;
        let tau = self.config.temperature;

        let mut grad_weight = vec![0.0f32; d * d];
        let mut grad_bias = vec![0.0f32; d];
        let mut total_loss = 0.0f32;

        for sample in samples {
            if let Some(token) = cancel {
                token.check("train_batch")?;
            }
            check_dimension(d, &sample.anchor)?;
            check_dimension(d, &sample.positive)?;
            if sample.negatives.len() > MAX_NEGATIVES {
                return Err(EngramError::validation(format!(
                    "{} negatives exceeds the {MAX_NEGATIVES} cap",
                    sample.negatives.len()
                )));
            }

            let anchor_p = self.apply(&sample.anchor);
            let positive_p = self.apply(&sample.positive);
            let negatives_p: Vec<Vec<f32>> = sample
                .negatives
                .iter()
                .map(|n| {
                    check_dimension(d, n)?;
                    Ok(self.apply(n))
                })
                .collect::<Result<_>>()?;

            // Logits: positive first, then negatives
            let mut keys: Vec<&[f32]> = Vec::with_capacity(1 + negatives_p.len());
            keys.push(&positive_p);
            for n in &negatives_p {
                keys.push(n);
            }
            let sims: Vec<f32> = keys
                .iter()
                .map(|k| cosine_similarity(&anchor_p, k))
                .collect();
            let logits: Vec<f32> = sims.iter().map(|s| s / tau).collect();
            let max_logit = logits.iter().fold(f32::NEG_INFINITY, |m, &l| m.max(l));
            let exps: Vec<f32> = logits.iter().map(|l| (l - max_logit).exp()).collect();
            let z: f32 = exps.iter().sum();
            total_loss += -(exps[0] / z).ln();

            // dL/ds_j = (softmax_j - 1{j = positive}) / τ
            let mut anchor_grad = vec![0.0f32; d];
            for (j, key) in keys.iter().enumerate() {
                let coeff = (exps[j] / z - if j == 0 { 1.0 } else { 0.0 }) / tau;
                let (da, dk) = cosine_grads(&anchor_p, key, sims[j]);
                for i in 0..d {
                    anchor_grad[i] += coeff * da[i];
                }
                // Key-side contribution: outer(dL/dk', x_j) into W, dL/dk' into b
                let source = if j == 0 {
                    &sample.positive
                } else {
                    &sample.negatives[j - 1]
                };
                for i in 0..d {
                    let g = coeff * dk[i];
                    grad_bias[i] += g;
                    let row = &mut grad_weight[i * d..(i + 1) * d];
                    for (w, x) in row.iter_mut().zip(source.iter()) {
                        *w += g * x;
                    }
                }
            }
            // Anchor-side contribution
            for i in 0..d {
                grad_bias[i] += anchor_grad[i];
                let row = &mut grad_weight[i * d..(i + 1) * d];
                for (w, x) in row.iter_mut().zip(sample.anchor.iter()) {
                    *w += anchor_grad[i] * x;
                }
            }
        }

        let scale = 1.0 / samples.len() as f32;
        for g in grad_weight.iter_mut() {
            *g *= scale;
        }
        for g in grad_bias.iter_mut() {
            *g *= scale;
        }

        self.adamw_step(&grad_weight, &grad_bias);
        self.publish();
        self.advance_curriculum();

        Ok(total_loss / samples.len() as f32)
    }

    // ========================================================================
    // Private implementation
    // ========================================================================

    fn apply(&self, v: &[f32]) -> Vec<f32> {
        let d = self.config.dimension;
        let mut out = self.bias.clone();
        for (i, out_i) in out.iter_mut().enumerate() {
            let row = &self.weight[i * d..(i + 1) * d];
            *out_i += row.iter().zip(v.iter()).map(|(w, x)| w * x).sum::<f32>();
        }
        out
    }

    fn adamw_step(&mut self, grad_weight: &[f32], grad_bias: &[f32]) {
        self.step += 1;
        let c = &self.config;
        let bias_correction1 = 1.0 - c.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - c.beta2.powi(self.step as i32);

        for i in 0..self.weight.len() {
            let g = grad_weight[i];
            self.m_weight[i] = c.beta1 * self.m_weight[i] + (1.0 - c.beta1) * g;
            self.v_weight[i] = c.beta2 * self.v_weight[i] + (1.0 - c.beta2) * g * g;
            let m_hat = self.m_weight[i] / bias_correction1;
            let v_hat = self.v_weight[i] / bias_correction2;
            self.weight[i] -= c.learning_rate
                * (m_hat / (v_hat.sqrt() + c.epsilon) + c.weight_decay * self.weight[i]);
        }
        for i in 0..self.bias.len() {
            let g = grad_bias[i];
            self.m_bias[i] = c.beta1 * self.m_bias[i] + (1.0 - c.beta1) * g;
            self.v_bias[i] = c.beta2 * self.v_bias[i] + (1.0 - c.beta2) * g * g;
            let m_hat = self.m_bias[i] / bias_correction1;
            let v_hat = self.v_bias[i] / bias_correction2;
            // Decoupled decay applies to the matrix only
            self.bias[i] -= c.learning_rate * m_hat / (v_hat.sqrt() + c.epsilon);
        }
    }

    fn publish(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let next = Arc::new(Projection {
            weight: self.weight.clone(),
            bias: self.bias.clone(),
            dimension: self.config.dimension,
            generation,
        });
        *self.snapshot.write().expect("projection lock poisoned") = next;
    }

    fn advance_curriculum(&mut self) {
        self.batches_in_stage += 1;
        let stage = self.config.curriculum[self.stage_index];
        if self.batches_in_stage >= stage.batches
            && self.stage_index + 1 < self.config.curriculum.len()
        {
            self.stage_index += 1;
            self.batches_in_stage = 0;
            debug!(stage = self.stage_index, "curriculum advanced");
        }
    }
}

/// Gradients of `cos(a, k)` with respect to `a` and `k`
fn cosine_grads(a: &[f32], k: &[f32], sim: f32) -> (Vec<f32>, Vec<f32>) {
    let norm_a = crate::vector::norm(a).max(f32::MIN_POSITIVE);
    let norm_k = crate::vector::norm(k).max(f32::MIN_POSITIVE);
    let inv_ak = 1.0 / (norm_a * norm_k);
    let inv_aa = sim / (norm_a * norm_a);
    let inv_kk = sim / (norm_k * norm_k);
    let da: Vec<f32> = a
        .iter()
        .zip(k.iter())
        .map(|(&ai, &ki)| ki * inv_ak - ai * inv_aa)
        .collect();
    let dk: Vec<f32> = a
        .iter()
        .zip(k.iter())
        .map(|(&ai, &ki)| ai * inv_ak - ki * inv_kk)
        .collect();
    (da, dk)
}

// ============================================================================
// TESTS
// ============================================================================
