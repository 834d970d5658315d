//! LoRA-style low-rank adapters.
//!
//! An adapter perturbs an embedding with a rank-r update:
//! `v' = v + scale · U·(D·v)` where `D` is r×dim and `U` is dim×r.
//! `U` starts at zero, so a fresh adapter is the identity; consolidation
//! nudges `U` toward directions that separated high-quality trajectories.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::vector::check_dimension;

/// A named rank-r adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraAdapter {
    /// Adapter name; "default" is created at startup
    pub name: String,
    /// Low-rank width
    pub rank: usize,
    /// Embedding dimensionality
    pub dimension: usize,
    /// r×dim down-projection, row-major
    down: Vec<f32>,
    /// dim×r up-projection, row-major
    up: Vec<f32>,
    /// Update strength
    pub scale: f32,
}

impl LoraAdapter {
    /// New identity adapter: random down-projection, zero up-projection
    pub fn new(name: &str, dimension: usize, rank: usize, scale: f32, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = 1.0 / (dimension as f32).sqrt();
        let down = (0..rank * dimension)
            .map(|_| rng.gen_range(-bound..bound))
            .collect();
        let up = vec![0.0; dimension * rank];
        Self {
            name: name.to_string(),
            rank,
            dimension,
            down,
            up,
            scale,
        }
    }

    /// `v + scale · U·(D·v)`
    pub fn apply(&self, v: &[f32]) -> Result<Vec<f32>> {
        check_dimension(self.dimension, v)?;
        let mut projected = vec![0.0f32; self.rank];
        for (r, p) in projected.iter_mut().enumerate() {
            let row = &self.down[r * self.dimension..(r + 1) * self.dimension];
            *p = row.iter().zip(v.iter()).map(|(d, x)| d * x).sum();
        }
        let mut out = v.to_vec();
        for (i, out_i) in out.iter_mut().enumerate() {
            let row = &self.up[i * self.rank..(i + 1) * self.rank];
            let delta: f32 = row.iter().zip(projected.iter()).map(|(u, p)| u * p).sum();
            *out_i += self.scale * delta;
        }
        Ok(out)
    }

    /// Pull the up-projection toward a direction that paid off, scaled by
    /// the observed quality
    pub fn reinforce(&mut self, direction: &[f32], quality: f32, learning_rate: f32) -> Result<()> {
        check_dimension(self.dimension, direction)?;
        let mut projected = vec![0.0f32; self.rank];
        for (r, p) in projected.iter_mut().enumerate() {
            let row = &self.down[r * self.dimension..(r + 1) * self.dimension];
            *p = row.iter().zip(direction.iter()).map(|(d, x)| d * x).sum();
        }
        for i in 0..self.dimension {
            let row = &mut self.up[i * self.rank..(i + 1) * self.rank];
            for (u, p) in row.iter_mut().zip(projected.iter()) {
                *u += learning_rate * quality * direction[i] * p;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_adapter_is_identity() {
        let adapter = LoraAdapter::new("default", 8, 4, 0.1, 1);
        let v: Vec<f32> = (0..8).map(|i| i as f32 * 0.3 - 1.0).collect();
        assert_eq!(adapter.apply(&v).unwrap(), v);
    }

    #[test]
    fn test_reinforced_adapter_moves_output() {
        let mut adapter = LoraAdapter::new("default", 8, 4, 0.5, 1);
        let direction: Vec<f32> = (0..8).map(|i| if i == 2 { 1.0 } else { 0.0 }).collect();
        adapter.reinforce(&direction, 1.0, 0.5).unwrap();
        let out = adapter.apply(&direction).unwrap();
        assert_ne!(out, direction);
    }

    #[test]
    fn test_dimension_checked() {
        let adapter = LoraAdapter::new("default", 8, 4, 0.1, 1);
        assert!(adapter.apply(&[1.0, 2.0]).is_err());
    }
}
