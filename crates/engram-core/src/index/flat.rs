//! Flat exact-scan index.
//!
//! Brute-force O(n·D) search over an in-memory entry table. Exact by
//! construction, so it doubles as the recall oracle for the graph
//! backends in tests. The right choice for tiny stores where graph
//! traversal overhead exceeds a linear scan.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngramError, Result};
use crate::index::hnsw::Hit;
use crate::paths::validate_path;
use crate::vector::{Metric, check_dimension};

/// Serialized form written by `save`
#[derive(Serialize, Deserialize)]
struct FlatSnapshot {
    format_version: u32,
    dimension: usize,
    metric: Metric,
    entries: Vec<(String, Vec<f32>)>,
}

const SNAPSHOT_VERSION: u32 = 1;

/// Exact-scan index over string-keyed f32 vectors
#[derive(Debug)]
pub struct FlatIndex {
    dimension: usize,
    metric: Metric,
    capacity: Option<usize>,
    vectors: Vec<(String, Vec<f32>)>,
    id_to_slot: HashMap<String, usize>,
}

impl FlatIndex {
    /// Create an empty index
    pub fn new(dimension: usize, metric: Metric, capacity: Option<usize>) -> Self {
        Self {
            dimension,
            metric,
            capacity,
            vectors: Vec::new(),
            id_to_slot: HashMap::new(),
        }
    }

    /// Number of stored vectors
    pub fn count(&self) -> usize {
        self.vectors.len()
    }

    /// Whether an id is present
    pub fn contains(&self, id: &str) -> bool {
        self.id_to_slot.contains_key(id)
    }

    /// Stored vector for an id, if present
    pub fn vector(&self, id: &str) -> Option<&[f32]> {
        let &slot = self.id_to_slot.get(id)?;
        Some(self.vectors[slot].1.as_slice())
    }

    /// All stored ids, unordered
    pub fn ids(&self) -> Vec<String> {
        self.vectors.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Estimated resident bytes
    pub fn memory_usage(&self) -> usize {
        self.vectors
            .iter()
            .map(|(id, v)| id.len() + v.len() * std::mem::size_of::<f32>())
            .sum()
    }

    /// Insert a vector; an existing id is replaced
    pub fn insert(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        check_dimension(self.dimension, vector)?;
        if let Some(&slot) = self.id_to_slot.get(id) {
            self.vectors[slot].1 = vector.to_vec();
            return Ok(());
        }
        if let Some(cap) = self.capacity {
            if self.count() >= cap {
                return Err(EngramError::Capacity(format!("index full at {cap} vectors")));
            }
        }
        self.id_to_slot.insert(id.to_string(), self.vectors.len());
        self.vectors.push((id.to_string(), vector.to_vec()));
        Ok(())
    }

    /// Remove an id; returns whether it was present
    pub fn remove(&mut self, id: &str) -> Result<bool> {
        let Some(slot) = self.id_to_slot.remove(id) else {
            return Ok(false);
        };
        self.vectors.swap_remove(slot);
        if slot < self.vectors.len() {
            let moved = self.vectors[slot].0.clone();
            self.id_to_slot.insert(moved, slot);
        }
        Ok(true)
    }

    /// Exact nearest neighbors by raw distance, closest first
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>> {
        check_dimension(self.dimension, query)?;
        if k == 0 || self.vectors.is_empty() {
            return Ok(Vec::new());
        }
        let mut hits: Vec<Hit> = self
            .vectors
            .iter()
            .map(|(id, v)| Hit {
                id: id.clone(),
                distance: self.metric.distance(query, v),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    /// Persist as a JSON snapshot
    pub fn save(&self, path: &Path) -> Result<()> {
        validate_path(path)?;
        let snapshot = FlatSnapshot {
            format_version: SNAPSHOT_VERSION,
            dimension: self.dimension,
            metric: self.metric,
            entries: self.vectors.clone(),
        };
        let json = serde_json::to_string(&snapshot)?;
        std::fs::write(path, json).map_err(|e| {
            EngramError::backend(
                format!("write {}: {e}", path.display()),
                "check that the target directory exists and is writable",
            )
        })
    }

    /// Load a previously saved snapshot
    pub fn load(path: &Path, capacity: Option<usize>) -> Result<Self> {
        validate_path(path)?;
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngramError::corrupt(path.display().to_string(), format!("unreadable: {e}"))
        })?;
        let snapshot: FlatSnapshot = serde_json::from_str(&raw)
            .map_err(|e| EngramError::corrupt(path.display().to_string(), e.to_string()))?;
        if snapshot.format_version != SNAPSHOT_VERSION {
            return Err(EngramError::corrupt(
                path.display().to_string(),
                format!("unsupported snapshot version {}", snapshot.format_version),
            ));
        }
        let mut index = Self::new(snapshot.dimension, snapshot.metric, capacity);
        for (id, v) in snapshot.entries {
            if v.len() != index.dimension {
                return Err(EngramError::corrupt(
                    path.display().to_string(),
                    format!("entry {id} has wrong dimension"),
                ));
            }
            index.id_to_slot.insert(id.clone(), index.vectors.len());
            index.vectors.push((id, v));
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_search_exact_order() {
        let mut index = FlatIndex::new(2, Metric::Cosine, None);
        index.insert("x", &[1.0, 0.0]).unwrap();
        index.insert("y", &[0.0, 1.0]).unwrap();
        index.insert("d", &[0.7, 0.7]).unwrap();

        let hits = index.search(&[1.0, 0.0], 3).unwrap();
        assert_eq!(hits[0].id, "x");
        assert_eq!(hits[1].id, "d");
        assert_eq!(hits[2].id, "y");
    }

    #[test]
    fn test_swap_remove_keeps_map_consistent() {
        let mut index = FlatIndex::new(2, Metric::Cosine, None);
        index.insert("a", &[1.0, 0.0]).unwrap();
        index.insert("b", &[0.0, 1.0]).unwrap();
        index.insert("c", &[0.5, 0.5]).unwrap();

        index.remove("a").unwrap();
        assert_eq!(index.count(), 2);
        assert!(index.contains("b"));
        assert!(index.contains("c"));
        let hits = index.search(&[0.0, 1.0], 1).unwrap();
        assert_eq!(hits[0].id, "b");
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("flat.json");

        let mut index = FlatIndex::new(3, Metric::L2, None);
        index.insert("p", &[1.0, 2.0, 3.0]).unwrap();
        index.save(&path).unwrap();

        let loaded = FlatIndex::load(&path, None).unwrap();
        assert_eq!(loaded.count(), 1);
        assert_eq!(loaded.vector("p").unwrap(), &[1.0, 2.0, 3.0]);
    }
}
