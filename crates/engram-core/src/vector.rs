//! Vector math and distance metrics.
//!
//! Every store picks one [`Metric`] at creation; it is immutable for the
//! store's lifetime. Raw distances are converted to similarities with
//! [`Metric::similarity`]: cosine → `1 - d`, L2 → `exp(-d)`,
//! inner-product → `-d`. Cosine is the default and the only metric whose
//! similarity lies in [-1, 1] without transformation.

use serde::{Deserialize, Serialize};

use crate::error::{EngramError, Result};

/// Maximum supported vector dimensionality
pub const MAX_DIMENSION: usize = 4096;

/// Distance metric, chosen once per store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Cosine distance (1 - cosine similarity)
    #[default]
    Cosine,
    /// Squared-free Euclidean distance
    L2,
    /// Negative inner product
    #[serde(rename = "ip")]
    InnerProduct,
}

impl Metric {
    /// Raw distance between two equal-length vectors
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => cosine_distance(a, b),
            Metric::L2 => euclidean_distance(a, b),
            Metric::InnerProduct => -dot(a, b),
        }
    }

    /// Convert a raw distance to a similarity score
    pub fn similarity(&self, distance: f32) -> f32 {
        match self {
            Metric::Cosine => 1.0 - distance,
            Metric::L2 => (-distance).exp(),
            Metric::InnerProduct => -distance,
        }
    }
}

impl std::str::FromStr for Metric {
    type Err = EngramError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cosine" => Ok(Metric::Cosine),
            "l2" => Ok(Metric::L2),
            "ip" | "inner-product" => Ok(Metric::InnerProduct),
            other => Err(EngramError::validation(format!("unknown metric: {other}"))),
        }
    }
}

/// Dot product of two equal-length vectors
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Euclidean (L2) norm
pub fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Euclidean distance between two equal-length vectors
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Cosine similarity in [-1, 1]; 0.0 when either vector has zero magnitude
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = dot(a, b);
    let mag_a = norm(a);
    let mag_b = norm(b);
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

/// Cosine distance (1 - cosine similarity), in [0, 2]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Validate a store dimension at creation time
pub fn validate_dimension(dim: usize) -> Result<()> {
    if dim == 0 || dim > MAX_DIMENSION {
        return Err(EngramError::validation(format!(
            "dimension must be in 1..={MAX_DIMENSION}, got {dim}"
        )));
    }
    Ok(())
}

/// Reject a vector whose length differs from the store dimension
pub fn check_dimension(expected: usize, v: &[f32]) -> Result<()> {
    if v.len() != expected {
        return Err(EngramError::validation(format!(
            "dimension mismatch: expected {expected}, got {}",
            v.len()
        )));
    }
    Ok(())
}
