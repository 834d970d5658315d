//! Vector index backends.
//!
//! The native HNSW graph is the flagship; a flat exact-scan store and an
//! optional USearch FFI index sit behind the same [`Backend`] contract.

pub mod backend;
pub mod flat;
pub mod hnsw;

#[cfg(feature = "backend-usearch")]
pub mod usearch_backend;

pub use backend::{AnyBackend, Backend, BackendKind, Capabilities, Detection, detect, is_available};
pub use flat::FlatIndex;
pub use hnsw::{Hit, HnswConfig, HnswIndex, HnswStats};
