//! Hybrid search: BM25 keyword retrieval fused with vector results.

pub mod hybrid;
pub mod keyword;

pub use hybrid::{DEFAULT_RRF_K, FusionMethod, FusionOptions, fuse, source_fetch_limit};
pub use keyword::{Bm25Params, KeywordIndex, tokenize};
