//! USearch-backed HNSW index (FFI), behind the `backend-usearch` feature.
//!
//! Wraps `usearch::Index` with string-keyed ids. USearch requires
//! `reserve()` before `add()`; the wrapper doubles capacity as needed.
//! Raw vectors are kept in a side table so entries survive a
//! save/load round trip together with the key mapping.

#![cfg(feature = "backend-usearch")]

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::error::{EngramError, Result};
use crate::index::hnsw::Hit;
use crate::paths::validate_path;
use crate::vector::{Metric, check_dimension};

fn metric_kind(metric: Metric) -> MetricKind {
    match metric {
        Metric::Cosine => MetricKind::Cos,
        Metric::L2 => MetricKind::L2sq,
        Metric::InnerProduct => MetricKind::IP,
    }
}

#[derive(Serialize, Deserialize)]
struct Sidecar {
    key_to_id: HashMap<String, u64>,
    vectors: HashMap<String, Vec<f32>>,
    next_id: u64,
}

/// String-keyed wrapper over a USearch HNSW index
pub struct UsearchIndex {
    index: Index,
    dimension: usize,
    metric: Metric,
    key_to_id: HashMap<String, u64>,
    id_to_key: HashMap<u64, String>,
    vectors: HashMap<String, Vec<f32>>,
    next_id: u64,
}

impl UsearchIndex {
    /// Create an empty index
    pub fn new(dimension: usize, metric: Metric) -> Result<Self> {
        let options = IndexOptions {
            dimensions: dimension,
            metric: metric_kind(metric),
            quantization: ScalarKind::F32,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
            multi: false,
        };
        let index = Index::new(&options)
            .map_err(|e| EngramError::backend(format!("usearch init: {e}"), "reinstall usearch"))?;
        Ok(Self {
            index,
            dimension,
            metric,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            vectors: HashMap::new(),
            next_id: 0,
        })
    }

    /// Live vector count
    pub fn count(&self) -> usize {
        self.key_to_id.len()
    }

    /// Whether an id is present
    pub fn contains(&self, id: &str) -> bool {
        self.key_to_id.contains_key(id)
    }

    /// Stored vector for an id
    pub fn vector(&self, id: &str) -> Option<Vec<f32>> {
        self.vectors.get(id).cloned()
    }

    /// All stored ids, unordered
    pub fn ids(&self) -> Vec<String> {
        self.key_to_id.keys().cloned().collect()
    }

    /// Estimated resident bytes
    pub fn memory_usage(&self) -> usize {
        self.index.serialized_length()
            + self
                .vectors
                .values()
                .map(|v| v.len() * std::mem::size_of::<f32>())
                .sum::<usize>()
    }

    /// Insert or update a vector
    pub fn insert(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        check_dimension(self.dimension, vector)?;

        if let Some(&key) = self.key_to_id.get(id) {
            self.index
                .remove(key)
                .map_err(|e| EngramError::backend(format!("usearch remove: {e}"), ""))?;
            self.reserve_for_one()?;
            self.index
                .add(key, vector)
                .map_err(|e| EngramError::backend(format!("usearch add: {e}"), ""))?;
            self.vectors.insert(id.to_string(), vector.to_vec());
            return Ok(());
        }

        self.reserve_for_one()?;
        let key = self.next_id;
        self.next_id += 1;
        self.index
            .add(key, vector)
            .map_err(|e| EngramError::backend(format!("usearch add: {e}"), ""))?;
        self.key_to_id.insert(id.to_string(), key);
        self.id_to_key.insert(key, id.to_string());
        self.vectors.insert(id.to_string(), vector.to_vec());
        Ok(())
    }

    /// Remove an id; returns whether it was present
    pub fn remove(&mut self, id: &str) -> Result<bool> {
        let Some(key) = self.key_to_id.remove(id) else {
            return Ok(false);
        };
        self.id_to_key.remove(&key);
        self.vectors.remove(id);
        self.index
            .remove(key)
            .map_err(|e| EngramError::backend(format!("usearch remove: {e}"), ""))?;
        Ok(true)
    }

    /// Nearest neighbors by raw distance, closest first
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>> {
        check_dimension(self.dimension, query)?;
        if k == 0 || self.count() == 0 {
            return Ok(Vec::new());
        }
        let matches = self
            .index
            .search(query, k)
            .map_err(|e| EngramError::backend(format!("usearch search: {e}"), ""))?;
        Ok(matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .filter_map(|(key, &distance)| {
                self.id_to_key.get(key).map(|id| Hit {
                    id: id.clone(),
                    distance,
                })
            })
            .collect())
    }

    /// Persist the index blob plus the key/vector sidecar
    pub fn save(&self, path: &Path) -> Result<()> {
        validate_path(path)?;
        let path_str = path
            .to_str()
            .ok_or_else(|| EngramError::validation("non-utf8 path"))?;
        self.index
            .save(path_str)
            .map_err(|e| EngramError::backend(format!("usearch save: {e}"), ""))?;

        let sidecar = Sidecar {
            key_to_id: self.key_to_id.clone(),
            vectors: self.vectors.clone(),
            next_id: self.next_id,
        };
        let sidecar_path = path.with_extension("mappings.json");
        std::fs::write(&sidecar_path, serde_json::to_string(&sidecar)?)
            .map_err(|e| EngramError::backend(format!("write sidecar: {e}"), ""))?;
        Ok(())
    }

    /// Load a previously saved index
    pub fn load(path: &Path, dimension: usize, metric: Metric) -> Result<Self> {
        validate_path(path)?;
        let mut loaded = Self::new(dimension, metric)?;
        let path_str = path
            .to_str()
            .ok_or_else(|| EngramError::validation("non-utf8 path"))?;
        loaded
            .index
            .load(path_str)
            .map_err(|e| EngramError::corrupt(path.display().to_string(), e.to_string()))?;

        let sidecar_path = path.with_extension("mappings.json");
        let raw = std::fs::read_to_string(&sidecar_path).map_err(|e| {
            EngramError::corrupt(sidecar_path.display().to_string(), format!("unreadable: {e}"))
        })?;
        let sidecar: Sidecar = serde_json::from_str(&raw)
            .map_err(|e| EngramError::corrupt(sidecar_path.display().to_string(), e.to_string()))?;

        loaded.id_to_key = sidecar
            .key_to_id
            .iter()
            .map(|(id, &key)| (key, id.clone()))
            .collect();
        loaded.key_to_id = sidecar.key_to_id;
        loaded.vectors = sidecar.vectors;
        loaded.next_id = sidecar.next_id;
        Ok(loaded)
    }

    fn reserve_for_one(&mut self) -> Result<()> {
        let size = self.index.size();
        if size >= self.index.capacity() {
            let new_capacity = (self.index.capacity() * 2).max(16);
            self.index.reserve(new_capacity).map_err(|e| {
                EngramError::backend(format!("usearch reserve: {e}"), "out of memory?")
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_search_remove() {
        let mut index = UsearchIndex::new(4, Metric::Cosine).unwrap();
        index.insert("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.insert("b", &[0.0, 1.0, 0.0, 0.0]).unwrap();
        assert_eq!(index.count(), 2);

        let hits = index.search(&[1.0, 0.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].id, "a");

        assert!(index.remove("a").unwrap());
        assert_eq!(index.count(), 1);
    }
}
