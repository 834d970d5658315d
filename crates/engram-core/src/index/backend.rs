//! Backend detection and the uniform index contract.
//!
//! Every index implementation sits behind the [`Backend`] capability set
//! {insert, search, remove, count, memory_usage, save}. Concrete
//! implementations are a tagged sum, [`AnyBackend`]:
//!
//! - `ruvector` — the native HNSW graph (always available)
//! - `rvf` — flat exact scan (always available)
//! - `hnswlib` — USearch over FFI, behind the `backend-usearch` feature
//!
//! The `auto` policy probes in that order and reports the selection in a
//! [`Detection`] record. Requesting an unavailable backend fails with a
//! Backend error carrying the enabling hint.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngramError, Result};
use crate::index::flat::FlatIndex;
use crate::index::hnsw::{Hit, HnswConfig, HnswIndex};
use crate::vector::Metric;

#[cfg(feature = "backend-usearch")]
use crate::index::usearch_backend::UsearchIndex;

// ============================================================================
// SELECTION
// ============================================================================

/// Requested backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Probe ruvector → rvf → hnswlib and take the first available
    #[default]
    Auto,
    /// Native HNSW graph
    RuVector,
    /// Flat exact scan
    Rvf,
    /// USearch FFI index
    Hnswlib,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendKind::Auto => "auto",
            BackendKind::RuVector => "ruvector",
            BackendKind::Rvf => "rvf",
            BackendKind::Hnswlib => "hnswlib",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for BackendKind {
    type Err = EngramError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "ruvector" => Ok(Self::RuVector),
            "rvf" => Ok(Self::Rvf),
            "hnswlib" => Ok(Self::Hnswlib),
            other => Err(EngramError::validation(format!("unknown backend: {other}"))),
        }
    }
}

/// What the selected backend can do
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    /// Graph-based approximate search
    pub graph: bool,
    /// Exact (non-approximate) search
    pub exact: bool,
    /// Works with the tiered compressor
    pub compression: bool,
    /// Can save/load to disk
    pub persistence: bool,
    /// Pure Rust (no FFI)
    pub native: bool,
}

/// Outcome of backend probing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    /// The backend that will serve this store
    pub backend: BackendKind,
    /// Its capability flags
    pub capabilities: Capabilities,
    /// Implementation version string
    pub version: String,
}

/// Whether a concrete backend is linked into this build
pub fn is_available(kind: BackendKind) -> bool {
    match kind {
        BackendKind::Auto => true,
        BackendKind::RuVector | BackendKind::Rvf => true,
        BackendKind::Hnswlib => cfg!(feature = "backend-usearch"),
    }
}

/// Resolve a requested backend to a concrete one, probing on `Auto`
pub fn detect(requested: BackendKind) -> Result<Detection> {
    let resolved = match requested {
        BackendKind::Auto => [BackendKind::RuVector, BackendKind::Rvf, BackendKind::Hnswlib]
            .into_iter()
            .find(|&k| is_available(k))
            .expect("ruvector is always available"),
        concrete => {
            if !is_available(concrete) {
                return Err(EngramError::backend(
                    format!("backend {concrete} is not available in this build"),
                    "rebuild with `--features backend-usearch`",
                ));
            }
            concrete
        }
    };

    let capabilities = match resolved {
        BackendKind::RuVector => Capabilities {
            graph: true,
            exact: false,
            compression: true,
            persistence: true,
            native: true,
        },
        BackendKind::Rvf => Capabilities {
            graph: false,
            exact: true,
            compression: true,
            persistence: true,
            native: true,
        },
        BackendKind::Hnswlib => Capabilities {
            graph: true,
            exact: false,
            compression: true,
            persistence: true,
            native: false,
        },
        BackendKind::Auto => unreachable!(),
    };

    let detection = Detection {
        backend: resolved,
        capabilities,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    info!(backend = %detection.backend, "vector backend selected");
    Ok(detection)
}

// ============================================================================
// CONTRACT
// ============================================================================

/// The capability set every index backend implements
pub trait Backend {
    /// Insert or update a vector
    fn insert(&mut self, id: &str, vector: &[f32]) -> Result<()>;
    /// Nearest neighbors by raw distance, closest first
    fn search(&self, query: &[f32], k: usize, ef: Option<usize>) -> Result<Vec<Hit>>;
    /// Remove an id; returns whether it was present
    fn remove(&mut self, id: &str) -> Result<bool>;
    /// Live vector count
    fn count(&self) -> usize;
    /// Estimated resident bytes
    fn memory_usage(&self) -> usize;
    /// Persist to disk
    fn save(&self, path: &Path) -> Result<()>;
}

/// Tagged sum of the concrete backends
#[derive(Debug)]
pub enum AnyBackend {
    /// Native HNSW graph
    RuVector(HnswIndex),
    /// Flat exact scan
    Rvf(FlatIndex),
    /// USearch FFI index
    #[cfg(feature = "backend-usearch")]
    Hnswlib(UsearchIndex),
}

impl AnyBackend {
    /// Create an empty backend of the detected kind
    pub fn create(
        detection: &Detection,
        dimension: usize,
        metric: Metric,
        adaptive_expected: Option<usize>,
        capacity: Option<usize>,
    ) -> Result<Self> {
        match detection.backend {
            BackendKind::RuVector => {
                let mut config = match adaptive_expected {
                    Some(expected) => HnswConfig::adaptive(dimension, metric, expected),
                    None => HnswConfig::new(dimension, metric),
                };
                config.capacity = capacity;
                Ok(Self::RuVector(HnswIndex::new(config)))
            }
            BackendKind::Rvf => Ok(Self::Rvf(FlatIndex::new(dimension, metric, capacity))),
            #[cfg(feature = "backend-usearch")]
            BackendKind::Hnswlib => Ok(Self::Hnswlib(UsearchIndex::new(dimension, metric)?)),
            #[cfg(not(feature = "backend-usearch"))]
            BackendKind::Hnswlib => Err(EngramError::backend(
                "hnswlib backend not linked",
                "rebuild with `--features backend-usearch`",
            )),
            BackendKind::Auto => unreachable!("detect() resolves auto"),
        }
    }

    /// Load a previously saved backend of the detected kind
    pub fn load(
        detection: &Detection,
        path: &Path,
        dimension: usize,
        metric: Metric,
        capacity: Option<usize>,
    ) -> Result<Self> {
        match detection.backend {
            BackendKind::RuVector => Ok(Self::RuVector(HnswIndex::load(path)?)),
            BackendKind::Rvf => Ok(Self::Rvf(FlatIndex::load(path, capacity)?)),
            #[cfg(feature = "backend-usearch")]
            BackendKind::Hnswlib => Ok(Self::Hnswlib(UsearchIndex::load(
                path, dimension, metric,
            )?)),
            #[cfg(not(feature = "backend-usearch"))]
            BackendKind::Hnswlib => {
                let _ = (dimension, metric);
                Err(EngramError::backend(
                    "hnswlib backend not linked",
                    "rebuild with `--features backend-usearch`",
                ))
            }
            BackendKind::Auto => unreachable!("detect() resolves auto"),
        }
    }

    /// Which concrete backend this is
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::RuVector(_) => BackendKind::RuVector,
            Self::Rvf(_) => BackendKind::Rvf,
            #[cfg(feature = "backend-usearch")]
            Self::Hnswlib(_) => BackendKind::Hnswlib,
        }
    }

    /// Whether an id is present
    pub fn contains(&self, id: &str) -> bool {
        match self {
            Self::RuVector(i) => i.contains(id),
            Self::Rvf(i) => i.contains(id),
            #[cfg(feature = "backend-usearch")]
            Self::Hnswlib(i) => i.contains(id),
        }
    }

    /// Stored vector for an id, if retrievable from the backend
    pub fn vector(&self, id: &str) -> Option<Vec<f32>> {
        match self {
            Self::RuVector(i) => i.vector(id).map(<[f32]>::to_vec),
            Self::Rvf(i) => i.vector(id).map(<[f32]>::to_vec),
            #[cfg(feature = "backend-usearch")]
            Self::Hnswlib(i) => i.vector(id),
        }
    }

    /// All live ids, unordered
    pub fn ids(&self) -> Vec<String> {
        match self {
            Self::RuVector(i) => i.ids(),
            Self::Rvf(i) => i.ids(),
            #[cfg(feature = "backend-usearch")]
            Self::Hnswlib(i) => i.ids(),
        }
    }
}

impl Backend for AnyBackend {
    fn insert(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        match self {
            Self::RuVector(i) => i.insert(id, vector),
            Self::Rvf(i) => i.insert(id, vector),
            #[cfg(feature = "backend-usearch")]
            Self::Hnswlib(i) => i.insert(id, vector),
        }
    }

    fn search(&self, query: &[f32], k: usize, ef: Option<usize>) -> Result<Vec<Hit>> {
        match self {
            Self::RuVector(i) => i.search(query, k, ef),
            Self::Rvf(i) => i.search(query, k),
            #[cfg(feature = "backend-usearch")]
            Self::Hnswlib(i) => i.search(query, k),
        }
    }

    fn remove(&mut self, id: &str) -> Result<bool> {
        match self {
            Self::RuVector(i) => i.remove(id),
            Self::Rvf(i) => i.remove(id),
            #[cfg(feature = "backend-usearch")]
            Self::Hnswlib(i) => i.remove(id),
        }
    }

    fn count(&self) -> usize {
        match self {
            Self::RuVector(i) => i.count(),
            Self::Rvf(i) => i.count(),
            #[cfg(feature = "backend-usearch")]
            Self::Hnswlib(i) => i.count(),
        }
    }

    fn memory_usage(&self) -> usize {
        match self {
            Self::RuVector(i) => i.memory_usage(),
            Self::Rvf(i) => i.memory_usage(),
            #[cfg(feature = "backend-usearch")]
            Self::Hnswlib(i) => i.memory_usage(),
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        match self {
            Self::RuVector(i) => i.save(path),
            Self::Rvf(i) => i.save(path),
            #[cfg(feature = "backend-usearch")]
            Self::Hnswlib(i) => i.save(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_resolves_to_ruvector() {
        let detection = detect(BackendKind::Auto).unwrap();
        assert_eq!(detection.backend, BackendKind::RuVector);
        assert!(detection.capabilities.graph);
        assert!(detection.capabilities.native);
    }

    #[test]
    fn test_rvf_reports_exact() {
        let detection = detect(BackendKind::Rvf).unwrap();
        assert!(detection.capabilities.exact);
        assert!(!detection.capabilities.graph);
    }

    #[cfg(not(feature = "backend-usearch"))]
    #[test]
    fn test_unavailable_backend_carries_hint() {
        let err = detect(BackendKind::Hnswlib).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("backend-usearch"), "hint missing from: {msg}");
    }

    #[test]
    fn test_kind_parse_roundtrip() {
        for kind in [
            BackendKind::Auto,
            BackendKind::RuVector,
            BackendKind::Rvf,
            BackendKind::Hnswlib,
        ] {
            assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
        }
        assert!("faiss".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_variants_agree_on_nearest() {
        let detection_graph = detect(BackendKind::RuVector).unwrap();
        let detection_flat = detect(BackendKind::Rvf).unwrap();
        let mut graph =
            AnyBackend::create(&detection_graph, 4, Metric::Cosine, None, None).unwrap();
        let mut flat = AnyBackend::create(&detection_flat, 4, Metric::Cosine, None, None).unwrap();

        let vectors: &[(&str, [f32; 4])] = &[
            ("a", [1.0, 0.0, 0.0, 0.0]),
            ("b", [0.0, 1.0, 0.0, 0.0]),
            ("c", [0.9, 0.1, 0.0, 0.0]),
        ];
        for (id, v) in vectors {
            graph.insert(id, v).unwrap();
            flat.insert(id, v).unwrap();
        }

        let q = [1.0, 0.0, 0.0, 0.0];
        let from_graph = graph.search(&q, 2, None).unwrap();
        let from_flat = flat.search(&q, 2, None).unwrap();
        assert_eq!(from_graph[0].id, from_flat[0].id);
        assert_eq!(from_graph[1].id, from_flat[1].id);
    }
}
