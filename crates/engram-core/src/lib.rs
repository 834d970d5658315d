//! # Engram Core
//!
//! Agent memory substrate: a persistent, queryable vector store that lets
//! long-running agents remember episodes, skills, and learned routes, and
//! that improves its own retrieval from usage.
//!
//! - **HNSW Vector Search**: native layered-graph ANN, plus flat-scan and
//!   USearch backends behind one contract
//! - **Tiered Quantization**: access-frequency-driven per-vector
//!   compression (raw → i16 → 8-bit → 4-bit → sign bits) with Matryoshka
//!   truncation on the coldest tier
//! - **Hybrid Search**: BM25 inverted index fused with vector results via
//!   RRF, linear, or max
//! - **Contrastive Learning**: InfoNCE projection trained with AdamW and
//!   a hard-negative curriculum, published lock-free to readers
//! - **Intent Routing**: centroid-per-intent router with debounced
//!   persistence
//! - **Auditable Recall**: SHA-256 content hashes, Merkle proofs,
//!   minimal-why hitting sets, and a SHAKE-256 witness chain
//! - **Federated Sessions**: per-session trajectory agents aggregated
//!   into cross-session patterns, with LoRA-style adapters
//! - **Thompson Bandit**: contextual Beta-posterior arm selection for
//!   tier and mining-strategy choice
//!
//! ## Quick Start
//!
//! ```rust
//! use engram_core::{StoreOptions, SearchRequest, open_store};
//!
//! # fn main() -> engram_core::Result<()> {
//! let store = open_store(StoreOptions::new(4))?;
//! store.insert("a", &[1.0, 0.0, 0.0, 0.0], None, Some("alpha beta"))?;
//!
//! let hits = store.search(&SearchRequest::new(vec![1.0, 0.0, 0.0, 0.0], 3))?;
//! assert_eq!(hits[0].id, "a");
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `backend-usearch`: link the USearch FFI index as the `hnswlib`
//!   backend

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod bandit;
pub mod cancel;
pub mod compress;
pub mod error;
pub mod federated;
pub mod index;
pub mod learn;
pub mod metadata;
pub mod paths;
pub mod router;
pub mod search;
pub mod storage;
pub mod store;
pub mod vector;
pub mod witness;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use error::{EngramError, Result};

pub use cancel::CancelToken;
pub use vector::{Metric, cosine_distance, cosine_similarity, euclidean_distance};

// Index backends
pub use index::{
    AnyBackend, Backend, BackendKind, Capabilities, Detection, FlatIndex, Hit, HnswConfig,
    HnswIndex, HnswStats, detect,
};

// Tiered compression
pub use compress::{CompressedEntry, CompressionStats, Tier, TieredCompressor};

// Metadata & filters
pub use metadata::{
    FieldBuilder, FilterExpr, FilterOp, FilterPredicate, MAX_FILTER_LEAVES, Metadata,
    MetadataStore, Value,
};

// Hybrid search
pub use search::{Bm25Params, FusionMethod, FusionOptions, KeywordIndex, fuse, source_fetch_limit};

// Contrastive learning
pub use learn::{
    ContrastiveTrainer, CurriculumStage, HardNegativeMiner, MAX_NEGATIVES, MiningRequest,
    Projection, TrainerConfig, TrainingSample,
};

// Intent routing
pub use router::{AddIntent, Intent, IntentRouter, RouteMatch, RouterConfig};

// Witness chain & certificates
pub use witness::{
    AccessLevel, Certificate, CertificateConfig, CertificateRequest, ChunkInput,
    JustificationPath, MerkleProof, SourceHash, SourceResolver, VerifyOutcome, WitnessChain,
    verify_chain,
};

// Federated aggregation
pub use federated::{
    FederatedAggregator, FederatedConfig, LoraAdapter, Pattern, Session, SessionStats,
};

// Bandit
pub use bandit::{ArmStats, BanditConfig, ThompsonBandit};

// Store facade
pub use store::{
    HybridHit, HybridRequest, SearchHit, SearchRequest, Store, StoreOptions, StoreStats,
    open_store, run_ticker,
};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Witness-chain record stride in bytes
pub const WITNESS_RECORD_SIZE: usize = witness::RECORD_SIZE;

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        AddIntent, BackendKind, CancelToken, CertificateRequest, ChunkInput, EngramError,
        FilterExpr, FilterPredicate, FusionMethod, FusionOptions, HybridRequest, Metadata, Metric,
        Result, SearchRequest, Store, StoreOptions, Tier, Value, open_store,
    };
}
