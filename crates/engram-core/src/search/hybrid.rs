//! Hybrid result fusion (vector + keyword).
//!
//! Three strategies over the two ranked source lists:
//!
//! - **RRF**: each source contributes `w/(rrf_k + rank)`; sums are
//!   normalized so the top result scores 1.
//! - **linear**: keyword scores are normalized against the in-batch max;
//!   `score = w_v·s_v + w_kw·s_kw`.
//! - **max**: same normalization; the larger weighted contribution wins.
//!
//! Ties are order-stable: the vector source outranks the keyword source
//! as a secondary key. Each source should be over-fetched with
//! [`source_fetch_limit`] to leave fusion room; threshold and top-k cuts
//! are applied last by the caller.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Default RRF dampening constant
pub const DEFAULT_RRF_K: f32 = 60.0;

/// Per-source fetch size for a final cut of `k`: `min(3k, 1000)`
pub fn source_fetch_limit(k: usize) -> usize {
    (k * 3).min(1000)
}

/// Fusion strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionMethod {
    /// Reciprocal rank fusion
    #[default]
    Rrf,
    /// Weighted sum of normalized scores
    Linear,
    /// Max of weighted normalized scores
    Max,
}

/// Fusion knobs
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FusionOptions {
    /// Weight of the vector source
    pub vector_weight: f32,
    /// Weight of the keyword source
    pub keyword_weight: f32,
    /// Strategy
    pub method: FusionMethod,
    /// RRF dampening constant
    pub rrf_k: f32,
}

impl Default for FusionOptions {
    fn default() -> Self {
        Self {
            vector_weight: 0.5,
            keyword_weight: 0.5,
            method: FusionMethod::Rrf,
            rrf_k: DEFAULT_RRF_K,
        }
    }
}

#[derive(Clone, Copy)]
struct Contribution {
    score: f32,
    vector_rank: usize,
    keyword_rank: usize,
}

fn contribution<'m, 'a>(
    map: &'m mut HashMap<&'a str, Contribution>,
    id: &'a str,
) -> &'m mut Contribution {
    map.entry(id).or_insert(Contribution {
        score: 0.0,
        vector_rank: usize::MAX,
        keyword_rank: usize::MAX,
    })
}

/// Fuse two ranked `(id, score)` lists into one, best first.
///
/// A source absent from the query contributes nothing; when only one
/// source is supplied its results are normalized and returned as-is.
pub fn fuse(
    vector_results: &[(String, f32)],
    keyword_results: &[(String, f32)],
    options: &FusionOptions,
) -> Vec<(String, f32)> {
    let mut merged: HashMap<&str, Contribution> = HashMap::new();

    match options.method {
        FusionMethod::Rrf => {
            for (rank, (id, _)) in vector_results.iter().enumerate() {
                let c = contribution(&mut merged, id.as_str());
                c.score += options.vector_weight / (options.rrf_k + rank as f32);
                c.vector_rank = rank;
            }
            for (rank, (id, _)) in keyword_results.iter().enumerate() {
                let c = contribution(&mut merged, id.as_str());
                c.score += options.keyword_weight / (options.rrf_k + rank as f32);
                c.keyword_rank = rank;
            }
        }
        FusionMethod::Linear | FusionMethod::Max => {
            let kw_max = keyword_results
                .iter()
                .map(|(_, s)| *s)
                .fold(0.0f32, f32::max)
                .max(f32::MIN_POSITIVE);
            for (rank, (id, s)) in vector_results.iter().enumerate() {
                let c = contribution(&mut merged, id.as_str());
                c.score = options.vector_weight * s;
                c.vector_rank = rank;
            }
            for (rank, (id, s)) in keyword_results.iter().enumerate() {
                let weighted = options.keyword_weight * (s / kw_max);
                let c = contribution(&mut merged, id.as_str());
                c.keyword_rank = rank;
                match options.method {
                    FusionMethod::Linear => c.score += weighted,
                    FusionMethod::Max => c.score = c.score.max(weighted),
                    FusionMethod::Rrf => unreachable!(),
                }
            }
        }
    }

    let mut results: Vec<(String, f32, Contribution)> = merged
        .into_iter()
        .map(|(id, c)| (id.to_string(), c.score, c))
        .collect();
    results.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.2.vector_rank.cmp(&b.2.vector_rank))
            .then_with(|| a.2.keyword_rank.cmp(&b.2.keyword_rank))
            .then_with(|| a.0.cmp(&b.0))
    });

    // Normalize RRF sums so the top result scores 1
    if options.method == FusionMethod::Rrf {
        if let Some(top) = results.first().map(|(_, s, _)| *s).filter(|s| *s > 0.0) {
            for (_, s, _) in results.iter_mut() {
                *s /= top;
            }
        }
    }

    results.into_iter().map(|(id, s, _)| (id, s)).collect()
}

// ============================================================================
// TESTS
// ============================================================================
