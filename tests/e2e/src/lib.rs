//! Shared fixtures for the end-to-end suite.

use engram_core::{Store, StoreOptions, open_store};

/// Unit vector along one axis
pub fn unit(dim: usize, axis: usize) -> Vec<f32> {
    let mut v = vec![0.0; dim];
    v[axis % dim] = 1.0;
    v
}

/// Deterministic pseudo-random vector
pub fn pseudo_vector(dim: usize, seed: usize) -> Vec<f32> {
    (0..dim)
        .map(|j| ((seed * dim + j) as f32 * 0.73).sin())
        .collect()
}

/// Fresh in-memory store
pub fn memory_store(dim: usize) -> Store {
    open_store(StoreOptions::new(dim)).expect("open in-memory store")
}
