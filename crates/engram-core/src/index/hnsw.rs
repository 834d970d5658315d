//! Native HNSW (Hierarchical Navigable Small World) index.
//!
//! The flagship graph backend. Layered proximity graph with greedy descent
//! through the upper layers and beam search at layer 0. Expected O(log n)
//! query time after an O(n log n) build.
//!
//! Construction parameters:
//! - `m`: max outgoing edges per node per layer (layer 0 allows `2m`)
//! - `ef_construction`: candidate-list width while inserting
//! - `ef_search`: candidate-list width while querying (overridable per call)
//!
//! Re-inserting an existing id is an update (remove-then-insert). Removal
//! unlinks the node from every layer, so dead slots are unreachable; slots
//! are recycled on later inserts.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngramError, Result};
use crate::paths::validate_path;
use crate::vector::{Metric, check_dimension};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Default connectivity (edges per node per layer)
pub const DEFAULT_M: usize = 16;

/// Default candidate-list width during insertion
pub const DEFAULT_EF_CONSTRUCTION: usize = 200;

/// Default candidate-list width during search
pub const DEFAULT_EF_SEARCH: usize = 100;

/// Similarity above which a result is treated as an exact hit; once `k`
/// exact hits are collected the traversal stops early
pub const EARLY_EXIT_SIMILARITY: f32 = 0.9999;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// HNSW construction parameters, fixed at index creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Vector dimensionality
    pub dimension: usize,
    /// Distance metric
    pub metric: Metric,
    /// Max outgoing edges per node per layer (layer 0 allows twice this)
    pub m: usize,
    /// Candidate-list width during insertion
    pub ef_construction: usize,
    /// Default candidate-list width during search
    pub ef_search: usize,
    /// Optional hard cap on live entries
    pub capacity: Option<usize>,
    /// RNG seed for layer assignment (deterministic builds)
    pub seed: u64,
}

impl HnswConfig {
    /// Config with defaults for the given dimension and metric
    pub fn new(dimension: usize, metric: Metric) -> Self {
        Self {
            dimension,
            metric,
            m: DEFAULT_M,
            ef_construction: DEFAULT_EF_CONSTRUCTION,
            ef_search: DEFAULT_EF_SEARCH,
            capacity: None,
            seed: 0x9E3779B97F4A7C15,
        }
    }

    /// Parameter triple adapted to the expected store size:
    /// (8, 100, 50) under 1 000 vectors, (16, 200, 100) up to 100 000,
    /// (32, 400, 200) above
    pub fn adaptive(dimension: usize, metric: Metric, expected_count: usize) -> Self {
        let (m, ef_c, ef_s) = if expected_count < 1_000 {
            (8, 100, 50)
        } else if expected_count <= 100_000 {
            (16, 200, 100)
        } else {
            (32, 400, 200)
        };
        Self {
            m,
            ef_construction: ef_c,
            ef_search: ef_s,
            ..Self::new(dimension, metric)
        }
    }

    fn max_neighbors(&self, layer: usize) -> usize {
        if layer == 0 { self.m * 2 } else { self.m }
    }

    /// Level normalization factor (1 / ln m)
    fn level_lambda(&self) -> f64 {
        1.0 / (self.m as f64).ln()
    }
}

/// Index statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswStats {
    /// Live vectors
    pub count: usize,
    /// Vector dimensionality
    pub dimension: usize,
    /// Highest occupied layer
    pub max_layer: usize,
    /// Estimated resident bytes (vectors + adjacency)
    pub memory_bytes: usize,
}

// ============================================================================
// INTERNALS
// ============================================================================

/// f32 distance with a total order for heap use
#[derive(Debug, Clone, Copy, PartialEq)]
struct Dist(f32);

impl Eq for Dist {}

impl PartialOrd for Dist {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Dist {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    id: String,
    vector: Vec<f32>,
    /// Adjacency per layer; `neighbors.len() - 1` is the node's top layer
    neighbors: Vec<Vec<u32>>,
    deleted: bool,
}

impl Node {
    fn top_layer(&self) -> usize {
        self.neighbors.len().saturating_sub(1)
    }
}

/// Serialized snapshot written by `save`
#[derive(Serialize, Deserialize)]
struct Snapshot {
    format_version: u32,
    config: HnswConfig,
    nodes: Vec<Node>,
    entry_point: Option<u32>,
    free_slots: Vec<u32>,
}

const SNAPSHOT_VERSION: u32 = 1;

// ============================================================================
// INDEX
// ============================================================================

/// Native HNSW index over string-keyed f32 vectors
#[derive(Debug)]
pub struct HnswIndex {
    config: HnswConfig,
    nodes: Vec<Node>,
    id_to_slot: HashMap<String, u32>,
    entry_point: Option<u32>,
    free_slots: Vec<u32>,
    rng: StdRng,
}

/// A single search hit: id plus raw distance under the index metric
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    /// Entry id
    pub id: String,
    /// Raw distance under the index metric
    pub distance: f32,
}

impl HnswIndex {
    /// Create an empty index
    pub fn new(config: HnswConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            nodes: Vec::new(),
            id_to_slot: HashMap::new(),
            entry_point: None,
            free_slots: Vec::new(),
            rng,
        }
    }

    /// Construction parameters
    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    /// Number of live vectors
    pub fn count(&self) -> usize {
        self.id_to_slot.len()
    }

    /// True when no live vectors remain
    pub fn is_empty(&self) -> bool {
        self.id_to_slot.is_empty()
    }

    /// Whether an id is present
    pub fn contains(&self, id: &str) -> bool {
        self.id_to_slot.contains_key(id)
    }

    /// Stored vector for an id, if present
    pub fn vector(&self, id: &str) -> Option<&[f32]> {
        let slot = *self.id_to_slot.get(id)?;
        Some(self.nodes[slot as usize].vector.as_slice())
    }

    /// All live ids, unordered
    pub fn ids(&self) -> Vec<String> {
        self.id_to_slot.keys().cloned().collect()
    }

    /// Estimated resident bytes
    pub fn memory_usage(&self) -> usize {
        let vectors: usize = self
            .nodes
            .iter()
            .filter(|n| !n.deleted)
            .map(|n| n.vector.len() * std::mem::size_of::<f32>() + n.id.len())
            .sum();
        let edges: usize = self
            .nodes
            .iter()
            .map(|n| n.neighbors.iter().map(|l| l.len() * 4).sum::<usize>())
            .sum();
        vectors + edges
    }

    /// Index statistics
    pub fn stats(&self) -> HnswStats {
        let max_layer = self
            .entry_point
            .map(|ep| self.nodes[ep as usize].top_layer())
            .unwrap_or(0);
        HnswStats {
            count: self.count(),
            dimension: self.config.dimension,
            max_layer,
            memory_bytes: self.memory_usage(),
        }
    }

    /// Insert a vector; an existing id is updated (remove-then-insert)
    pub fn insert(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        check_dimension(self.config.dimension, vector)?;

        if self.contains(id) {
            self.remove(id)?;
        } else if let Some(cap) = self.config.capacity {
            if self.count() >= cap {
                return Err(EngramError::Capacity(format!(
                    "index full at {cap} vectors"
                )));
            }
        }

        let level = self.sample_level();
        let slot = self.allocate(id, vector, level);

        let Some(mut ep) = self.entry_point.filter(|&ep| ep != slot) else {
            self.entry_point = Some(slot);
            return Ok(());
        };

        let max_layer = self.nodes[ep as usize].top_layer();

        // Greedy descent through layers above the new node's level
        let mut layer = max_layer;
        while layer > level {
            ep = self.greedy_closest(vector, ep, layer);
            layer -= 1;
        }

        // Beam search + link on each shared layer
        let mut layer = level.min(max_layer);
        loop {
            let candidates = self.search_layer(vector, ep, self.config.ef_construction, layer, None);
            let limit = self.config.max_neighbors(layer);
            let chosen: Vec<u32> = candidates.iter().take(limit).map(|&(_, s)| s).collect();

            for &neighbor in &chosen {
                self.link(slot, neighbor, layer);
            }
            if let Some(&(_, closest)) = candidates.first() {
                ep = closest;
            }
            if layer == 0 {
                break;
            }
            layer -= 1;
        }

        // A node above the current top layer becomes the new entry point
        if level > max_layer {
            self.entry_point = Some(slot);
        }

        Ok(())
    }

    /// Remove an id; returns whether it was present
    pub fn remove(&mut self, id: &str) -> Result<bool> {
        let Some(slot) = self.id_to_slot.remove(id) else {
            return Ok(false);
        };

        // Unlink from every adjacency list that references the slot
        let top = self.nodes[slot as usize].top_layer();
        for layer in 0..=top {
            let neighbors = self.nodes[slot as usize].neighbors[layer].clone();
            for n in neighbors {
                let list = &mut self.nodes[n as usize].neighbors[layer];
                list.retain(|&s| s != slot);
            }
        }
        // Prune any asymmetric in-links left by neighbor-list truncation
        for node in self.nodes.iter_mut() {
            if node.deleted {
                continue;
            }
            for list in node.neighbors.iter_mut() {
                list.retain(|&s| s != slot);
            }
        }

        let node = &mut self.nodes[slot as usize];
        node.deleted = true;
        node.vector = Vec::new();
        node.neighbors = vec![Vec::new()];
        self.free_slots.push(slot);

        if self.entry_point == Some(slot) {
            self.entry_point = self.pick_entry_point();
        }
        Ok(true)
    }

    /// Nearest neighbors by raw distance, closest first.
    ///
    /// `ef` overrides the configured search width; it is clamped to at
    /// least `k`. Traversal stops early once `k` exact hits
    /// (similarity above [`EARLY_EXIT_SIMILARITY`]) are found.
    pub fn search(&self, query: &[f32], k: usize, ef: Option<usize>) -> Result<Vec<Hit>> {
        check_dimension(self.config.dimension, query)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let ef = ef.unwrap_or(self.config.ef_search).max(k);
        let Some(mut ep) = self.entry_point else {
            return Ok(Vec::new());
        };

        let mut layer = self.nodes[ep as usize].top_layer();
        while layer > 0 {
            ep = self.greedy_closest(query, ep, layer);
            layer -= 1;
        }

        let found = self.search_layer(query, ep, ef, 0, Some(k));
        Ok(found
            .into_iter()
            .take(k)
            .map(|(d, slot)| Hit {
                id: self.nodes[slot as usize].id.clone(),
                distance: d.0,
            })
            .collect())
    }

    /// Persist the index as a JSON snapshot
    pub fn save(&self, path: &Path) -> Result<()> {
        validate_path(path)?;
        let snapshot = Snapshot {
            format_version: SNAPSHOT_VERSION,
            config: self.config.clone(),
            nodes: self.nodes.clone(),
            entry_point: self.entry_point,
            free_slots: self.free_slots.clone(),
        };
        let json = serde_json::to_string(&snapshot)?;
        std::fs::write(path, json).map_err(|e| {
            EngramError::backend(
                format!("write {}: {e}", path.display()),
                "check that the target directory exists and is writable",
            )
        })?;
        debug!(path = %path.display(), count = self.count(), "hnsw index saved");
        Ok(())
    }

    /// Load a previously saved snapshot
    pub fn load(path: &Path) -> Result<Self> {
        validate_path(path)?;
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngramError::corrupt(path.display().to_string(), format!("unreadable: {e}"))
        })?;
        let snapshot: Snapshot = serde_json::from_str(&raw)
            .map_err(|e| EngramError::corrupt(path.display().to_string(), e.to_string()))?;
        if snapshot.format_version != SNAPSHOT_VERSION {
            return Err(EngramError::corrupt(
                path.display().to_string(),
                format!("unsupported snapshot version {}", snapshot.format_version),
            ));
        }
        if let Some(ep) = snapshot.entry_point {
            if ep as usize >= snapshot.nodes.len() {
                return Err(EngramError::corrupt(
                    path.display().to_string(),
                    "entry point out of range",
                ));
            }
        }

        let mut id_to_slot = HashMap::new();
        for (slot, node) in snapshot.nodes.iter().enumerate() {
            if node.deleted {
                continue;
            }
            if node.vector.len() != snapshot.config.dimension {
                return Err(EngramError::corrupt(
                    path.display().to_string(),
                    format!("node {} has wrong dimension", node.id),
                ));
            }
            id_to_slot.insert(node.id.clone(), slot as u32);
        }

        let rng = StdRng::seed_from_u64(snapshot.config.seed);
        Ok(Self {
            config: snapshot.config,
            nodes: snapshot.nodes,
            id_to_slot,
            entry_point: snapshot.entry_point,
            free_slots: snapshot.free_slots,
            rng,
        })
    }

    // ========================================================================
    // Private implementation
    // ========================================================================

    fn sample_level(&mut self) -> usize {
        let u: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        (-u.ln() * self.config.level_lambda()).floor() as usize
    }

    fn allocate(&mut self, id: &str, vector: &[f32], level: usize) -> u32 {
        let node = Node {
            id: id.to_string(),
            vector: vector.to_vec(),
            neighbors: vec![Vec::new(); level + 1],
            deleted: false,
        };
        let slot = if let Some(slot) = self.free_slots.pop() {
            self.nodes[slot as usize] = node;
            slot
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1) as u32
        };
        self.id_to_slot.insert(id.to_string(), slot);
        slot
    }

    fn distance_to(&self, query: &[f32], slot: u32) -> f32 {
        self.config
            .metric
            .distance(query, &self.nodes[slot as usize].vector)
    }

    /// Greedy walk toward the query on a single layer; returns the local
    /// minimum reached from `start`
    fn greedy_closest(&self, query: &[f32], start: u32, layer: usize) -> u32 {
        let mut current = start;
        let mut current_dist = self.distance_to(query, current);
        loop {
            let mut improved = false;
            let node = &self.nodes[current as usize];
            if layer < node.neighbors.len() {
                for &n in &node.neighbors[layer] {
                    if self.nodes[n as usize].deleted {
                        continue;
                    }
                    let d = self.distance_to(query, n);
                    if d < current_dist {
                        current = n;
                        current_dist = d;
                        improved = true;
                    }
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Beam search on one layer. Returns up to `ef` `(distance, slot)`
    /// pairs sorted ascending. With `early_exit_k`, stops as soon as that
    /// many near-exact hits are collected.
    fn search_layer(
        &self,
        query: &[f32],
        entry: u32,
        ef: usize,
        layer: usize,
        early_exit_k: Option<usize>,
    ) -> Vec<(Dist, u32)> {
        let mut visited: HashSet<u32> = HashSet::new();
        // Min-heap of candidates to expand
        let mut frontier: BinaryHeap<Reverse<(Dist, u32)>> = BinaryHeap::new();
        // Max-heap of the best `ef` found so far
        let mut best: BinaryHeap<(Dist, u32)> = BinaryHeap::new();

        let entry_dist = Dist(self.distance_to(query, entry));
        visited.insert(entry);
        frontier.push(Reverse((entry_dist, entry)));
        best.push((entry_dist, entry));

        let mut exact_hits =
            usize::from(self.config.metric.similarity(entry_dist.0) > EARLY_EXIT_SIMILARITY);

        while let Some(Reverse((dist, slot))) = frontier.pop() {
            if let Some(k) = early_exit_k {
                if exact_hits >= k {
                    break;
                }
            }
            // The closest unexpanded candidate is already farther than the
            // worst kept result: the beam is done
            if best.len() >= ef {
                if let Some(&(worst, _)) = best.peek() {
                    if dist > worst {
                        break;
                    }
                }
            }

            let node = &self.nodes[slot as usize];
            if layer >= node.neighbors.len() {
                continue;
            }
            for &n in &node.neighbors[layer] {
                if !visited.insert(n) || self.nodes[n as usize].deleted {
                    continue;
                }
                let d = Dist(self.distance_to(query, n));
                let keep = best.len() < ef || best.peek().map(|&(w, _)| d < w).unwrap_or(true);
                if keep {
                    frontier.push(Reverse((d, n)));
                    best.push((d, n));
                    if best.len() > ef {
                        best.pop();
                    }
                    if self.config.metric.similarity(d.0) > EARLY_EXIT_SIMILARITY {
                        exact_hits += 1;
                    }
                }
            }
        }

        let mut out: Vec<(Dist, u32)> = best.into_iter().collect();
        out.sort();
        out
    }

    /// Link two nodes on a layer, pruning each side to its edge budget
    fn link(&mut self, a: u32, b: u32, layer: usize) {
        if a == b {
            return;
        }
        let limit = self.config.max_neighbors(layer);
        for (from, to) in [(a, b), (b, a)] {
            let from_vec = self.nodes[from as usize].vector.clone();
            let node = &mut self.nodes[from as usize];
            if layer >= node.neighbors.len() {
                continue;
            }
            if !node.neighbors[layer].contains(&to) {
                node.neighbors[layer].push(to);
            }
            if node.neighbors[layer].len() > limit {
                // Keep the closest `limit` edges
                let mut scored: Vec<(Dist, u32)> = self.nodes[from as usize].neighbors[layer]
                    .iter()
                    .map(|&s| {
                        (
                            Dist(self
                                .config
                                .metric
                                .distance(&from_vec, &self.nodes[s as usize].vector)),
                            s,
                        )
                    })
                    .collect();
                scored.sort();
                scored.truncate(limit);
                self.nodes[from as usize].neighbors[layer] =
                    scored.into_iter().map(|(_, s)| s).collect();
            }
        }
    }

    fn pick_entry_point(&self) -> Option<u32> {
        self.id_to_slot
            .values()
            .copied()
            .max_by_key(|&s| self.nodes[s as usize].top_layer())
    }
}

// ============================================================================
// TESTS
// ============================================================================
