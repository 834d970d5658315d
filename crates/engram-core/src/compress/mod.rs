//! Temporal tiered quantization.
//!
//! Every stored vector carries a compressed copy whose tier follows its
//! access frequency: hot vectors stay lossless, cold vectors shrink to a
//! sign bitmap. Five tiers:
//!
//! | Tier   | Encoding                        | Bytes/dim | Cosine bound |
//! |--------|---------------------------------|-----------|--------------|
//! | none   | raw f32                         | 4         | bit-exact    |
//! | half   | global scale + i16              | 2         | 0.001        |
//! | pq8    | (min,max) header + u8           | 1         | 0.01         |
//! | pq4    | (min,max) header + packed u4    | 0.5       | 0.1          |
//! | binary | mean + sign bits, truncated     | 0.125     | 1.0          |
//!
//! Only the binary tier applies Matryoshka truncation (to ⌈0.5·D⌉ leading
//! components, floor 8); decompression zero-pads back to the original
//! dimensionality. Tier selection is the deterministic frequency bands
//! 0.8/0.6/0.4/0.2, or a bandit draw over {hot, warm, cold} contexts
//! when enabled.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bandit::ThompsonBandit;
use crate::error::{EngramError, Result};
use crate::vector::check_dimension;

/// Smallest dimensionality kept by Matryoshka truncation
pub const MIN_TRUNCATED_DIM: usize = 8;

// ============================================================================
// TIERS
// ============================================================================

/// Quantization level of a stored vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Raw f32, bit-exact
    None,
    /// i16 with a shared scale
    Half,
    /// Scalar uniform 8-bit
    Pq8,
    /// Scalar uniform 4-bit, two per byte
    Pq4,
    /// One sign bit per (truncated) component
    Binary,
}

impl Tier {
    /// All tiers, hottest first
    pub const ALL: [Tier; 5] = [Tier::None, Tier::Half, Tier::Pq8, Tier::Pq4, Tier::Binary];

    /// Deterministic tier from an access frequency in [0, 1]
    pub fn from_frequency(freq: f32) -> Self {
        if freq >= 0.8 {
            Tier::None
        } else if freq >= 0.6 {
            Tier::Half
        } else if freq >= 0.4 {
            Tier::Pq8
        } else if freq >= 0.2 {
            Tier::Pq4
        } else {
            Tier::Binary
        }
    }

    /// Storage saved versus raw f32, in percent
    pub fn savings_percent(&self) -> f64 {
        match self {
            Tier::None => 0.0,
            Tier::Half => 50.0,
            Tier::Pq8 => 75.0,
            Tier::Pq4 => 87.5,
            Tier::Binary => 96.0,
        }
    }

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::None => "none",
            Tier::Half => "half",
            Tier::Pq8 => "pq8",
            Tier::Pq4 => "pq4",
            Tier::Binary => "binary",
        }
    }

    /// Maximum cosine distance between a vector and its round trip
    pub fn cosine_bound(&self) -> f32 {
        match self {
            Tier::None => 0.0,
            Tier::Half => 0.001,
            Tier::Pq8 => 0.01,
            Tier::Pq4 => 0.1,
            Tier::Binary => 1.0,
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = EngramError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Tier::None),
            "half" => Ok(Tier::Half),
            "pq8" => Ok(Tier::Pq8),
            "pq4" => Ok(Tier::Pq4),
            "binary" => Ok(Tier::Binary),
            other => Err(EngramError::validation(format!("unknown tier: {other}"))),
        }
    }
}

/// Bandit context bucket derived from access frequency
pub fn frequency_context(freq: f32) -> &'static str {
    if freq >= 0.66 {
        "hot"
    } else if freq >= 0.33 {
        "warm"
    } else {
        "cold"
    }
}

// ============================================================================
// PAYLOADS
// ============================================================================

/// Tier-specific encoded bytes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    /// Raw f32 sequence
    None(Vec<f32>),
    /// Shared scale, per-component i16
    Half {
        /// max|v_i| at encode time
        scale: f32,
        /// round(v_i · 32767 / scale)
        values: Vec<i16>,
    },
    /// Per-vector uniform 8-bit
    Pq8 {
        /// Range header
        min: f32,
        /// Range header
        max: f32,
        /// round((v - min) · 255 / (max - min))
        values: Vec<u8>,
    },
    /// Per-vector uniform 4-bit, low nibble first
    Pq4 {
        /// Range header
        min: f32,
        /// Range header
        max: f32,
        /// Two 4-bit values per byte
        packed: Vec<u8>,
        /// Component count (the last byte may be half-used)
        len: usize,
    },
    /// Sign bitmap around the mean of the truncated vector
    Binary {
        /// Mean of the truncated components
        mean: f32,
        /// One bit per component, LSB first within each byte
        bits: Vec<u8>,
        /// Truncated component count
        len: usize,
    },
}

/// A compressed vector plus its bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedEntry {
    /// Encoded bytes
    pub payload: Payload,
    /// Current tier
    pub tier: Tier,
    /// Dimensionality before any truncation
    pub original_dim: usize,
    /// Matryoshka-truncated dimensionality (binary tier only)
    pub truncated_dim: Option<usize>,
    /// Access frequency in [0, 1]
    pub access_freq: f32,
    /// Last touch
    pub last_accessed: DateTime<Utc>,
}

// ============================================================================
// ENCODERS
// ============================================================================

fn encode(vector: &[f32], tier: Tier) -> (Payload, Option<usize>) {
    match tier {
        Tier::None => (Payload::None(vector.to_vec()), None),
        Tier::Half => {
            let scale = vector.iter().fold(0.0f32, |m, v| m.max(v.abs())).max(f32::MIN_POSITIVE);
            let values = vector
                .iter()
                .map(|v| (v * 32767.0 / scale).round() as i16)
                .collect();
            (Payload::Half { scale, values }, None)
        }
        Tier::Pq8 => {
            let (min, max) = min_max(vector);
            let range = (max - min).max(f32::MIN_POSITIVE);
            let values = vector
                .iter()
                .map(|v| ((v - min) * 255.0 / range).round() as u8)
                .collect();
            (Payload::Pq8 { min, max, values }, None)
        }
        Tier::Pq4 => {
            let (min, max) = min_max(vector);
            let range = (max - min).max(f32::MIN_POSITIVE);
            let quantized: Vec<u8> = vector
                .iter()
                .map(|v| ((v - min) * 15.0 / range).round() as u8)
                .collect();
            let mut packed = Vec::with_capacity(quantized.len().div_ceil(2));
            for pair in quantized.chunks(2) {
                let low = pair[0] & 0x0F;
                let high = pair.get(1).copied().unwrap_or(0) & 0x0F;
                packed.push(low | (high << 4));
            }
            (
                Payload::Pq4 {
                    min,
                    max,
                    packed,
                    len: vector.len(),
                },
                None,
            )
        }
        Tier::Binary => {
            let truncated_dim = truncated_dimension(vector.len());
            let head = &vector[..truncated_dim];
            let mean = head.iter().sum::<f32>() / truncated_dim as f32;
            let mut bits = vec![0u8; truncated_dim.div_ceil(8)];
            for (i, v) in head.iter().enumerate() {
                if *v >= mean {
                    bits[i / 8] |= 1 << (i % 8);
                }
            }
            (
                Payload::Binary {
                    mean,
                    bits,
                    len: truncated_dim,
                },
                Some(truncated_dim),
            )
        }
    }
}

fn decode(payload: &Payload, original_dim: usize) -> Vec<f32> {
    match payload {
        Payload::None(v) => v.clone(),
        Payload::Half { scale, values } => values
            .iter()
            .map(|&q| q as f32 * scale / 32767.0)
            .collect(),
        Payload::Pq8 { min, max, values } => {
            let range = (max - min).max(f32::MIN_POSITIVE);
            values
                .iter()
                .map(|&q| min + q as f32 * range / 255.0)
                .collect()
        }
        Payload::Pq4 {
            min,
            max,
            packed,
            len,
        } => {
            let range = (max - min).max(f32::MIN_POSITIVE);
            let mut out = Vec::with_capacity(*len);
            for i in 0..*len {
                let byte = packed[i / 2];
                let nibble = if i % 2 == 0 { byte & 0x0F } else { byte >> 4 };
                out.push(min + nibble as f32 * range / 15.0);
            }
            out
        }
        Payload::Binary { mean, bits, len } => {
            let mut out = Vec::with_capacity(original_dim);
            for i in 0..*len {
                let set = bits[i / 8] & (1 << (i % 8)) != 0;
                out.push(if set { mean * 1.1 } else { mean * 0.9 });
            }
            out.resize(original_dim, 0.0);
            out
        }
    }
}

fn min_max(vector: &[f32]) -> (f32, f32) {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &v in vector {
        min = min.min(v);
        max = max.max(v);
    }
    (min, max)
}

/// Binary-tier keep length: ⌈0.5·D⌉, never below [`MIN_TRUNCATED_DIM`],
/// never above D
fn truncated_dimension(dim: usize) -> usize {
    dim.div_ceil(2).max(MIN_TRUNCATED_DIM).min(dim)
}

// ============================================================================
// STATS
// ============================================================================

/// Compressor statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressionStats {
    /// Live entries per tier name
    pub entries_per_tier: HashMap<String, usize>,
    /// Tier-weighted storage savings versus raw f32, in percent
    pub estimated_savings_percent: f64,
}

// ============================================================================
// COMPRESSOR
// ============================================================================

/// Access-frequency-driven per-vector quantization table
#[derive(Debug)]
pub struct TieredCompressor {
    dimension: usize,
    entries: HashMap<String, CompressedEntry>,
}

impl TieredCompressor {
    /// Create an empty compressor for a fixed dimensionality
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: HashMap::new(),
        }
    }

    /// Live entry count
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are held
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether an id has a compressed copy
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Entry bookkeeping for an id
    pub fn entry(&self, id: &str) -> Option<&CompressedEntry> {
        self.entries.get(id)
    }

    /// Compress at the tier implied by `access_freq`
    pub fn compress(&mut self, id: &str, vector: &[f32], access_freq: f32) -> Result<Tier> {
        let tier = Tier::from_frequency(access_freq);
        self.compress_as(id, vector, tier, access_freq)?;
        Ok(tier)
    }

    /// Compress at an explicit tier
    pub fn compress_as(
        &mut self,
        id: &str,
        vector: &[f32],
        tier: Tier,
        access_freq: f32,
    ) -> Result<()> {
        check_dimension(self.dimension, vector)?;
        if !(0.0..=1.0).contains(&access_freq) {
            return Err(EngramError::validation(format!(
                "access frequency must be in [0, 1], got {access_freq}"
            )));
        }
        let (payload, truncated_dim) = encode(vector, tier);
        self.entries.insert(
            id.to_string(),
            CompressedEntry {
                payload,
                tier,
                original_dim: vector.len(),
                truncated_dim,
                access_freq,
                last_accessed: Utc::now(),
            },
        );
        Ok(())
    }

    /// Compress with the tier picked by a bandit over the frequency context
    pub fn compress_with_bandit(
        &mut self,
        id: &str,
        vector: &[f32],
        access_freq: f32,
        bandit: &mut ThompsonBandit,
    ) -> Result<Tier> {
        let context = frequency_context(access_freq);
        let arms: Vec<&str> = Tier::ALL.iter().map(Tier::as_str).collect();
        let tier = match bandit.select_arm(context, &arms) {
            Some(name) => name.parse::<Tier>()?,
            None => Tier::from_frequency(access_freq),
        };
        self.compress_as(id, vector, tier, access_freq)?;
        Ok(tier)
    }

    /// Compress many vectors, grouped by selected tier so each group is
    /// encoded in one pass
    pub fn compress_batch(&mut self, items: &[(&str, &[f32], f32)]) -> Result<Vec<Tier>> {
        let mut tiers = vec![Tier::None; items.len()];
        let mut groups: HashMap<Tier, Vec<usize>> = HashMap::new();
        for (i, (_, _, freq)) in items.iter().enumerate() {
            let tier = Tier::from_frequency(*freq);
            tiers[i] = tier;
            groups.entry(tier).or_default().push(i);
        }
        for (tier, indices) in groups {
            for i in indices {
                let (id, vector, freq) = items[i];
                self.compress_as(id, vector, tier, freq)?;
            }
        }
        Ok(tiers)
    }

    /// Reconstruct a vector; zero-padded to its original dimensionality
    pub fn decompress(&self, id: &str) -> Option<Vec<f32>> {
        let entry = self.entries.get(id)?;
        Some(decode(&entry.payload, entry.original_dim))
    }

    /// Update an entry's access frequency, re-tiering if the bands moved.
    ///
    /// Returns the resulting tier, or `None` for an unknown id. Re-tiering
    /// decompresses and recompresses, so repeated calls with the same
    /// frequency are idempotent.
    pub fn update_frequency(&mut self, id: &str, new_freq: f32) -> Option<Tier> {
        let entry = self.entries.get_mut(id)?;
        let new_tier = Tier::from_frequency(new_freq);
        if new_tier == entry.tier {
            entry.access_freq = new_freq;
            entry.last_accessed = Utc::now();
            return Some(entry.tier);
        }
        let restored = decode(&entry.payload, entry.original_dim);
        let (payload, truncated_dim) = encode(&restored, new_tier);
        entry.payload = payload;
        entry.truncated_dim = truncated_dim;
        entry.tier = new_tier;
        entry.access_freq = new_freq;
        entry.last_accessed = Utc::now();
        debug!(id, tier = new_tier.as_str(), "entry re-tiered");
        Some(new_tier)
    }

    /// Drop an entry; returns whether it was present
    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Per-tier counts and the estimated storage savings
    pub fn stats(&self) -> CompressionStats {
        let mut per_tier: HashMap<String, usize> = HashMap::new();
        let mut savings_sum = 0.0;
        for entry in self.entries.values() {
            *per_tier.entry(entry.tier.as_str().to_string()).or_default() += 1;
            savings_sum += entry.tier.savings_percent();
        }
        let estimated = if self.entries.is_empty() {
            0.0
        } else {
            savings_sum / self.entries.len() as f64
        };
        CompressionStats {
            entries_per_tier: per_tier,
            estimated_savings_percent: estimated,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
