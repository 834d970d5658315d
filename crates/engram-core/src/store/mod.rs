//! The store facade.
//!
//! [`open_store`] is the single entry point: it probes backends, wires
//! every subsystem (index, compressor, metadata, keyword index, trainer,
//! router, witness chain, bandit, federated aggregator, certificate
//! rows), and returns a thread-safe [`Store`]. Each subsystem sits
//! behind its own guard — a vector search never blocks a metadata patch,
//! and no lock is held across another subsystem's file I/O.
//!
//! On-disk layout under the store directory:
//!
//! | File                  | Contents                         |
//! |-----------------------|----------------------------------|
//! | `index.bin`           | backend snapshot                 |
//! | `index.bin.meta.json` | metadata sidecar (C3)            |
//! | `keyword.json`        | BM25 inverted index              |
//! | `witness.bin`         | witness chain, 73-byte stride    |
//! | `bandit.json`         | bandit posteriors, versioned     |
//! | `router.json`         | intent centroids                 |
//! | `certificates.db`     | certificate/justification rows   |
//!
//! `save` writes each file to a temp path and renames, so a crash leaves
//! the previous snapshot intact.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use lru::LruCache;
use tracing::{debug, info};

use crate::bandit::ThompsonBandit;
use crate::cancel::CancelToken;
use crate::compress::{CompressionStats, Tier, TieredCompressor};
use crate::error::{EngramError, Result};
use crate::index::{AnyBackend, Backend, BackendKind, Detection, detect};
use crate::learn::{
    ContrastiveTrainer, CurriculumStage, HardNegativeMiner, MiningRequest, TrainerConfig,
    TrainingSample,
};
use crate::metadata::{FilterExpr, Metadata, MetadataStore};
use crate::paths::validate_path;
use crate::router::{AddIntent, IntentRouter, RouteMatch, RouterConfig};
use crate::search::{FusionOptions, KeywordIndex, fuse, source_fetch_limit};
use crate::federated::{FederatedAggregator, FederatedConfig};
use crate::storage::CertificateStore;
use crate::vector::{Metric, check_dimension, validate_dimension};
use crate::witness::{
    Certificate, CertificateConfig, CertificateRequest, SourceResolver, VerifyOutcome,
    WitnessChain, create_certificate, verify_certificate, verify_chain,
};

const INDEX_FILE: &str = "index.bin";
const KEYWORD_FILE: &str = "keyword.json";
const WITNESS_FILE: &str = "witness.bin";
const BANDIT_FILE: &str = "bandit.json";
const ROUTER_FILE: &str = "router.json";
const CERTIFICATES_FILE: &str = "certificates.db";

/// Projected-query LRU capacity
const QUERY_CACHE_SIZE: usize = 256;

// ============================================================================
// OPTIONS
// ============================================================================

/// Parameters for [`open_store`]
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Store directory; `None` keeps everything in memory
    pub path: Option<PathBuf>,
    /// Vector dimensionality, immutable for the store's lifetime
    pub dimension: usize,
    /// Distance metric, immutable for the store's lifetime
    pub metric: Metric,
    /// Requested backend
    pub backend: BackendKind,
    /// Pick HNSW parameters from `expected_count`
    pub adaptive: bool,
    /// Expected entry count, used when `adaptive`
    pub expected_count: Option<usize>,
    /// Optional hard cap on entries
    pub capacity: Option<usize>,
    /// Let the bandit pick compression tiers instead of the bands
    pub bandit_tiering: bool,
}

impl StoreOptions {
    /// Defaults for a dimensionality: cosine metric, auto backend
    pub fn new(dimension: usize) -> Self {
        Self {
            path: None,
            dimension,
            metric: Metric::Cosine,
            backend: BackendKind::Auto,
            adaptive: false,
            expected_count: None,
            capacity: None,
            bandit_tiering: false,
        }
    }

    /// Platform-specific default store directory for an application name
    pub fn default_path(app: &str) -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", app).map(|dirs| dirs.data_dir().join("store"))
    }
}

/// One vector search hit with its joined metadata
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// Entry id
    pub id: String,
    /// Raw distance under the store metric
    pub distance: f32,
    /// Derived similarity
    pub similarity: f32,
    /// Joined metadata, when the entry has any
    pub metadata: Option<Metadata>,
}

/// A vector search
#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// Query vector
    pub vector: Vec<f32>,
    /// Result budget
    pub k: usize,
    /// Per-call override of the search beam width
    pub ef: Option<usize>,
    /// Drop results below this similarity
    pub min_similarity: Option<f32>,
    /// Metadata filter, applied post-index
    pub filter: Option<FilterExpr>,
    /// Run the query through the learned projection
    pub project: bool,
}

impl SearchRequest {
    /// A plain top-k query
    pub fn new(vector: Vec<f32>, k: usize) -> Self {
        Self {
            vector,
            k,
            ef: None,
            min_similarity: None,
            filter: None,
            project: false,
        }
    }
}

/// A hybrid (text and/or vector) search
#[derive(Debug, Clone)]
pub struct HybridRequest {
    /// Keyword-side query
    pub text: Option<String>,
    /// Vector-side query
    pub vector: Option<Vec<f32>>,
    /// Result budget
    pub limit: usize,
    /// Fusion strategy and weights
    pub fusion: FusionOptions,
    /// Drop fused results below this score
    pub min_score: Option<f32>,
    /// Metadata filter, applied post-fusion
    pub filter: Option<FilterExpr>,
}

/// One fused hybrid hit
#[derive(Debug, Clone)]
pub struct HybridHit {
    /// Entry id
    pub id: String,
    /// Fused score
    pub score: f32,
    /// Joined metadata, when the entry has any
    pub metadata: Option<Metadata>,
}

/// Aggregate store statistics for the `status` surface
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// The backend serving this store
    pub backend: BackendKind,
    /// Live entries
    pub entries: usize,
    /// Estimated index bytes
    pub index_memory_bytes: usize,
    /// Keyword-indexed documents
    pub keyword_documents: usize,
    /// Persisted certificates
    pub certificates: usize,
    /// Witness-chain records
    pub witness_records: usize,
    /// Registered intents
    pub intents: usize,
    /// Cross-session patterns
    pub federated_patterns: usize,
    /// Compressor tier counts and savings
    pub compression: CompressionStats,
    /// Trainer snapshot generation
    pub projection_generation: u64,
}

// ============================================================================
// STORE
// ============================================================================

/// A single agent-memory store; thread-safe, exclusively owns its state
#[derive(Debug)]
pub struct Store {
    options: StoreOptions,
    detection: Mutex<Detection>,
    index: RwLock<AnyBackend>,
    metadata: RwLock<MetadataStore>,
    compressor: RwLock<TieredCompressor>,
    keyword: RwLock<KeywordIndex>,
    chain: Mutex<WitnessChain>,
    bandit: Mutex<ThompsonBandit>,
    trainer: RwLock<ContrastiveTrainer>,
    miner: Mutex<HardNegativeMiner>,
    router: Mutex<IntentRouter>,
    federated: FederatedAggregator,
    certificates: CertificateStore,
    certificate_config: CertificateConfig,
    query_cache: Mutex<LruCache<u64, (u64, Vec<f32>)>>,
}

/// Open (or create) a store; the single constructor of the core
pub fn open_store(options: StoreOptions) -> Result<Store> {
    Store::open(options)
}

impl Store {
    fn open(options: StoreOptions) -> Result<Store> {
        validate_dimension(options.dimension)?;
        let detection = detect(options.backend)?;

        let mut db_path = None;
        let mut router = IntentRouter::new(RouterConfig::new(options.dimension));
        let (index, metadata, keyword, chain, bandit) = match &options.path {
            Some(dir) => {
                validate_path(dir)?;
                std::fs::create_dir_all(dir).map_err(|e| {
                    EngramError::backend(
                        format!("create {}: {e}", dir.display()),
                        "check directory permissions",
                    )
                })?;
                db_path = Some(dir.join(CERTIFICATES_FILE));
                let index_path = dir.join(INDEX_FILE);
                let loaded = if index_path.exists() {
                    let index = AnyBackend::load(
                        &detection,
                        &index_path,
                        options.dimension,
                        options.metric,
                        options.capacity,
                    )?;
                    let metadata = MetadataStore::load(&sidecar_path(&index_path))?;
                    let keyword = load_keyword(&dir.join(KEYWORD_FILE))?;
                    let chain = load_chain(&dir.join(WITNESS_FILE))?;
                    let bandit = load_bandit(&dir.join(BANDIT_FILE))?;
                    (index, metadata, keyword, chain, bandit)
                } else {
                    (
                        AnyBackend::create(
                            &detection,
                            options.dimension,
                            options.metric,
                            options.adaptive.then(|| options.expected_count.unwrap_or(0)),
                            options.capacity,
                        )?,
                        MetadataStore::new(),
                        KeywordIndex::new(),
                        WitnessChain::new(),
                        ThompsonBandit::new(),
                    )
                };
                let router_path = dir.join(ROUTER_FILE);
                router = if router_path.exists() {
                    IntentRouter::load(&router_path, RouterConfig::new(options.dimension))?
                } else {
                    let mut fresh = IntentRouter::new(RouterConfig::new(options.dimension));
                    fresh.set_path(&router_path)?;
                    fresh
                };
                loaded
            }
            None => (
                AnyBackend::create(
                    &detection,
                    options.dimension,
                    options.metric,
                    options.adaptive.then(|| options.expected_count.unwrap_or(0)),
                    options.capacity,
                )?,
                MetadataStore::new(),
                KeywordIndex::new(),
                WitnessChain::new(),
                ThompsonBandit::new(),
            ),
        };

        let certificates = CertificateStore::open(db_path.as_deref())?;
        let trainer = ContrastiveTrainer::new(TrainerConfig::new(options.dimension))?;
        let federated = FederatedAggregator::new(FederatedConfig::new(options.dimension))?;

        info!(
            backend = %detection.backend,
            dimension = options.dimension,
            entries = index.count(),
            "store opened"
        );
        Ok(Store {
            compressor: RwLock::new(TieredCompressor::new(options.dimension)),
            options,
            detection: Mutex::new(detection),
            index: RwLock::new(index),
            metadata: RwLock::new(metadata),
            keyword: RwLock::new(keyword),
            chain: Mutex::new(chain),
            bandit: Mutex::new(bandit),
            trainer: RwLock::new(trainer),
            miner: Mutex::new(HardNegativeMiner::new(0x4D1E)),
            router: Mutex::new(router),
            federated,
            certificates,
            certificate_config: CertificateConfig::default(),
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_SIZE).expect("non-zero"),
            )),
        })
    }

    /// What backend probing selected at open
    pub fn detection(&self) -> Detection {
        self.detection.lock().expect("detection lock poisoned").clone()
    }

    /// Store dimensionality
    pub fn dimension(&self) -> usize {
        self.options.dimension
    }

    /// Live entry count
    pub fn count(&self) -> usize {
        self.index.read().expect("index lock poisoned").count()
    }

    /// Estimated index bytes
    pub fn memory_usage(&self) -> usize {
        self.index.read().expect("index lock poisoned").memory_usage()
    }

    // ========================================================================
    // Entries
    // ========================================================================

    /// Insert or update an entry.
    ///
    /// An existing id is updated; `None` metadata/text preserve whatever
    /// the entry already had. Fresh entries start at access frequency 1.
    pub fn insert(
        &self,
        id: &str,
        vector: &[f32],
        metadata: Option<Metadata>,
        text: Option<&str>,
    ) -> Result<()> {
        check_dimension(self.options.dimension, vector)?;
        self.index
            .write()
            .expect("index lock poisoned")
            .insert(id, vector)?;

        {
            let mut compressor = self.compressor.write().expect("compressor lock poisoned");
            if self.options.bandit_tiering {
                let mut bandit = self.bandit.lock().expect("bandit lock poisoned");
                compressor.compress_with_bandit(id, vector, 1.0, &mut bandit)?;
            } else {
                compressor.compress(id, vector, 1.0)?;
            }
        }
        if let Some(metadata) = metadata {
            self.metadata
                .write()
                .expect("metadata lock poisoned")
                .set(id, metadata)?;
        }
        if let Some(text) = text {
            self.keyword.write().expect("keyword lock poisoned").add(id, text);
        }
        Ok(())
    }

    /// Remove an entry everywhere; returns whether the index knew it
    pub fn remove(&self, id: &str) -> Result<bool> {
        let present = self
            .index
            .write()
            .expect("index lock poisoned")
            .remove(id)?;
        self.compressor
            .write()
            .expect("compressor lock poisoned")
            .remove(id);
        self.metadata
            .write()
            .expect("metadata lock poisoned")
            .remove(id);
        self.keyword.write().expect("keyword lock poisoned").remove(id);
        Ok(present)
    }

    /// Stored vector and metadata for an id
    pub fn get(&self, id: &str) -> Option<(Vec<f32>, Option<Metadata>)> {
        let vector = self.index.read().expect("index lock poisoned").vector(id)?;
        let metadata = self.metadata.read().expect("metadata lock poisoned").get(id);
        Some((vector, metadata))
    }

    /// Merge metadata keys into an entry's row
    pub fn patch_metadata(&self, id: &str, patch: Metadata) -> Result<()> {
        if !self.index.read().expect("index lock poisoned").contains(id) {
            return Err(EngramError::NotFound(format!("entry {id}")));
        }
        self.metadata
            .write()
            .expect("metadata lock poisoned")
            .patch(id, patch)
    }

    /// Update an entry's access frequency, re-tiering its compressed copy
    pub fn update_frequency(&self, id: &str, frequency: f32) -> Option<Tier> {
        self.compressor
            .write()
            .expect("compressor lock poisoned")
            .update_frequency(id, frequency)
    }

    /// Reconstruct an entry's compressed copy
    pub fn decompress(&self, id: &str) -> Option<Vec<f32>> {
        self.compressor
            .read()
            .expect("compressor lock poisoned")
            .decompress(id)
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Vector search with optional projection, threshold, and filter
    pub fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        check_dimension(self.options.dimension, &request.vector)?;
        if let Some(filter) = &request.filter {
            filter.validate()?;
        }
        if request.k == 0 {
            return Ok(Vec::new());
        }

        let query = if request.project {
            self.projected_query(&request.vector)?
        } else {
            request.vector.clone()
        };

        // Over-fetch when a filter will prune the tail
        let fetch = if request.filter.is_some() {
            source_fetch_limit(request.k).max(request.k)
        } else {
            request.k
        };

        let hits = self
            .index
            .read()
            .expect("index lock poisoned")
            .search(&query, fetch, request.ef)?;

        let metadata = self.metadata.read().expect("metadata lock poisoned");
        let mut results = Vec::with_capacity(request.k);
        for hit in hits {
            let similarity = self.options.metric.similarity(hit.distance);
            if let Some(min) = request.min_similarity {
                if similarity < min {
                    continue;
                }
            }
            if let Some(filter) = &request.filter {
                if !metadata.matches(&hit.id, filter) {
                    continue;
                }
            }
            let meta = metadata.get(&hit.id);
            results.push(SearchHit {
                id: hit.id,
                distance: hit.distance,
                similarity,
                metadata: meta,
            });
            if results.len() == request.k {
                break;
            }
        }
        Ok(results)
    }

    /// Hybrid search: BM25 and vector sources fused per the request
    pub fn hybrid_search(&self, request: &HybridRequest) -> Result<Vec<HybridHit>> {
        if request.text.is_none() && request.vector.is_none() {
            return Err(EngramError::validation(
                "hybrid query needs text, a vector, or both",
            ));
        }
        if let Some(filter) = &request.filter {
            filter.validate()?;
        }
        if request.limit == 0 {
            return Ok(Vec::new());
        }
        let fetch = source_fetch_limit(request.limit).max(request.limit);

        let vector_results: Vec<(String, f32)> = match &request.vector {
            Some(vector) => {
                check_dimension(self.options.dimension, vector)?;
                self.index
                    .read()
                    .expect("index lock poisoned")
                    .search(vector, fetch, None)?
                    .into_iter()
                    .map(|hit| (hit.id, self.options.metric.similarity(hit.distance)))
                    .collect()
            }
            None => Vec::new(),
        };
        let keyword_results: Vec<(String, f32)> = match &request.text {
            Some(text) => self
                .keyword
                .read()
                .expect("keyword lock poisoned")
                .search(text, fetch),
            None => Vec::new(),
        };

        let fused = fuse(&vector_results, &keyword_results, &request.fusion);

        let metadata = self.metadata.read().expect("metadata lock poisoned");
        let mut results = Vec::with_capacity(request.limit);
        for (id, score) in fused {
            if let Some(min) = request.min_score {
                if score < min {
                    continue;
                }
            }
            if let Some(filter) = &request.filter {
                if !metadata.matches(&id, filter) {
                    continue;
                }
            }
            let meta = metadata.get(&id);
            results.push(HybridHit {
                id,
                score,
                metadata: meta,
            });
            if results.len() == request.limit {
                break;
            }
        }
        Ok(results)
    }

    // ========================================================================
    // Trainer
    // ========================================================================

    /// Train the projection on one batch; returns the mean loss
    pub fn train_batch(
        &self,
        samples: &[TrainingSample],
        cancel: Option<&CancelToken>,
    ) -> Result<f32> {
        self.trainer
            .write()
            .expect("trainer lock poisoned")
            .train_batch(samples, cancel)
    }

    /// Current curriculum stage
    pub fn trainer_stage(&self) -> CurriculumStage {
        self.trainer
            .read()
            .expect("trainer lock poisoned")
            .current_stage()
    }

    /// Generation of the published projection
    pub fn projection_generation(&self) -> u64 {
        self.trainer.read().expect("trainer lock poisoned").generation()
    }

    /// Mine hard negatives for an anchor at the current stage
    pub fn mine_hard_negatives(&self, request: &MiningRequest<'_>) -> Vec<usize> {
        let stage = self.trainer_stage();
        self.miner
            .lock()
            .expect("miner lock poisoned")
            .mine(request, &stage)
    }

    fn projected_query(&self, vector: &[f32]) -> Result<Vec<f32>> {
        let snapshot = self
            .trainer
            .read()
            .expect("trainer lock poisoned")
            .projection();
        let key = {
            let mut hasher = DefaultHasher::new();
            for v in vector {
                v.to_bits().hash(&mut hasher);
            }
            hasher.finish()
        };
        let mut cache = self.query_cache.lock().expect("query cache lock poisoned");
        if let Some((generation, projected)) = cache.get(&key) {
            if *generation == snapshot.generation {
                return Ok(projected.clone());
            }
        }
        let projected = snapshot.project(vector)?;
        cache.put(key, (snapshot.generation, projected.clone()));
        Ok(projected)
    }

    // ========================================================================
    // Certificates & witness chain
    // ========================================================================

    /// Emit a certificate: Merkle proofs, minimal-why, witness record,
    /// and the persisted rows
    pub fn create_certificate(&self, request: &CertificateRequest) -> Result<Certificate> {
        let (certificate, justifications) =
            create_certificate(request, &self.certificate_config)?;
        let root: crate::witness::Hash32 = hex::decode(&certificate.merkle_root)
            .map_err(|e| EngramError::corrupt("merkle root", e.to_string()))?
            .try_into()
            .map_err(|_| EngramError::corrupt("merkle root", "wrong length"))?;
        let sequence = self
            .chain
            .lock()
            .expect("witness chain lock poisoned")
            .append(&root);
        self.certificates
            .insert(&certificate, &justifications, sequence)?;
        Ok(certificate)
    }

    /// Verify a stored certificate against live sources.
    ///
    /// Unknown ids fail with NotFound (verify is imperative).
    pub fn verify_certificate(
        &self,
        certificate_id: &str,
        resolver: &dyn SourceResolver,
    ) -> Result<VerifyOutcome> {
        let certificate = self
            .certificates
            .get(certificate_id)?
            .ok_or_else(|| EngramError::NotFound(format!("certificate {certificate_id}")))?;
        Ok(verify_certificate(&certificate, resolver))
    }

    /// Verify every stored certificate; `(id, outcome)` per certificate
    pub fn audit_certificates(
        &self,
        resolver: &dyn SourceResolver,
    ) -> Result<Vec<(String, VerifyOutcome)>> {
        let certificates = self.certificates.list()?;
        Ok(certificates
            .iter()
            .map(|c| (c.certificate_id.clone(), verify_certificate(c, resolver)))
            .collect())
    }

    /// A stored certificate by id (pure lookup)
    pub fn certificate(&self, certificate_id: &str) -> Result<Option<Certificate>> {
        self.certificates.get(certificate_id)
    }

    /// Structurally and cryptographically verify the witness chain
    pub fn verify_witness_chain(&self) -> Result<()> {
        let chain = self.chain.lock().expect("witness chain lock poisoned");
        verify_chain(chain.as_bytes())
    }

    // ========================================================================
    // Router
    // ========================================================================

    /// Register an intent
    pub fn add_intent(&self, input: AddIntent) -> Result<()> {
        self.router.lock().expect("router lock poisoned").add_intent(input)
    }

    /// Route a query to its top-k intents
    pub fn route(&self, query: &[f32], k: usize) -> Result<Vec<RouteMatch>> {
        self.router.lock().expect("router lock poisoned").route(query, k)
    }

    /// Registered intent names
    pub fn intent_names(&self) -> Vec<String> {
        self.router.lock().expect("router lock poisoned").intent_names()
    }

    /// Cooperative tick for the router's debounced persistence
    pub fn tick(&self) -> Result<()> {
        self.router.lock().expect("router lock poisoned").tick()?;
        Ok(())
    }

    /// Force the router state to disk now
    pub fn persist_router(&self) -> Result<()> {
        self.router.lock().expect("router lock poisoned").persist()
    }

    // ========================================================================
    // Bandit
    // ========================================================================

    /// Thompson-sample an arm for a context
    pub fn bandit_select(&self, context: &str, arms: &[&str]) -> Option<String> {
        self.bandit
            .lock()
            .expect("bandit lock poisoned")
            .select_arm(context, arms)
    }

    /// Record a bandit reward
    pub fn bandit_reward(
        &self,
        context: &str,
        arm: &str,
        reward: f64,
        cost: Option<f64>,
    ) -> Result<()> {
        self.bandit
            .lock()
            .expect("bandit lock poisoned")
            .record_reward(context, arm, reward, cost)
    }

    /// Export bandit state as versioned JSON
    pub fn bandit_export(&self) -> Result<String> {
        self.bandit.lock().expect("bandit lock poisoned").serialize()
    }

    /// Replace bandit state from an exported document
    pub fn bandit_import(&self, json: &str) -> Result<()> {
        let restored = ThompsonBandit::deserialize(json)?;
        *self.bandit.lock().expect("bandit lock poisoned") = restored;
        Ok(())
    }

    // ========================================================================
    // Federated sessions
    // ========================================================================

    /// The cross-session aggregator
    pub fn federated(&self) -> &FederatedAggregator {
        &self.federated
    }

    // ========================================================================
    // Persistence & lifecycle
    // ========================================================================

    /// Write every subsystem to the store directory, temp-then-rename
    pub fn save(&self, cancel: Option<&CancelToken>) -> Result<()> {
        let Some(dir) = &self.options.path else {
            return Err(EngramError::validation("store has no directory"));
        };
        let check = |op: &str| -> Result<()> {
            match cancel {
                Some(token) => token.check(op),
                None => Ok(()),
            }
        };

        check("save index")?;
        let index_path = dir.join(INDEX_FILE);
        atomic_write(&index_path, |tmp| {
            self.index.read().expect("index lock poisoned").save(tmp)
        })?;

        check("save metadata")?;
        atomic_write(&sidecar_path(&index_path), |tmp| {
            self.metadata.read().expect("metadata lock poisoned").save(tmp)
        })?;

        check("save keyword index")?;
        atomic_write(&dir.join(KEYWORD_FILE), |tmp| {
            let json = serde_json::to_string(
                &*self.keyword.read().expect("keyword lock poisoned"),
            )?;
            std::fs::write(tmp, json).map_err(|e| {
                EngramError::backend(format!("write keyword index: {e}"), "check disk space")
            })
        })?;

        check("save witness chain")?;
        atomic_write(&dir.join(WITNESS_FILE), |tmp| {
            self.chain.lock().expect("witness chain lock poisoned").save(tmp)
        })?;

        check("save bandit")?;
        atomic_write(&dir.join(BANDIT_FILE), |tmp| {
            let json = self.bandit.lock().expect("bandit lock poisoned").serialize()?;
            std::fs::write(tmp, json).map_err(|e| {
                EngramError::backend(format!("write bandit state: {e}"), "check disk space")
            })
        })?;

        check("save router")?;
        {
            let mut router = self.router.lock().expect("router lock poisoned");
            if router.persist_pending() {
                router.persist()?;
            }
        }
        debug!(dir = %dir.display(), "store saved");
        Ok(())
    }

    /// Re-index every entry into a different backend.
    ///
    /// Metadata, keyword postings, and compressed copies carry over
    /// untouched; only the vector index is rebuilt.
    pub fn migrate(&self, target: BackendKind, cancel: Option<&CancelToken>) -> Result<Detection> {
        let new_detection = detect(target)?;
        let mut index = self.index.write().expect("index lock poisoned");
        let mut replacement = AnyBackend::create(
            &new_detection,
            self.options.dimension,
            self.options.metric,
            self.options.adaptive.then(|| index.count()),
            self.options.capacity,
        )?;
        for id in index.ids() {
            if let Some(token) = cancel {
                token.check("migrate")?;
            }
            let vector = index
                .vector(&id)
                .ok_or_else(|| EngramError::NotFound(format!("entry {id}")))?;
            replacement.insert(&id, &vector)?;
        }
        *index = replacement;
        *self.detection.lock().expect("detection lock poisoned") = new_detection.clone();
        info!(backend = %new_detection.backend, "store migrated");
        Ok(new_detection)
    }

    /// Aggregate statistics for the `status` surface
    pub fn status(&self) -> StoreStats {
        StoreStats {
            backend: self.detection().backend,
            entries: self.count(),
            index_memory_bytes: self.memory_usage(),
            keyword_documents: self.keyword.read().expect("keyword lock poisoned").len(),
            certificates: self.certificates.count().unwrap_or(0),
            witness_records: self.chain.lock().expect("witness chain lock poisoned").len(),
            intents: self.router.lock().expect("router lock poisoned").len(),
            federated_patterns: self.federated.pattern_count(),
            compression: self
                .compressor
                .read()
                .expect("compressor lock poisoned")
                .stats(),
            projection_generation: self.projection_generation(),
        }
    }

    /// Close the store: cancel pending timers, final-flush, save.
    ///
    /// In-memory stores just drop their state.
    pub fn close(self) -> Result<()> {
        self.router.lock().expect("router lock poisoned").close()?;
        if self.options.path.is_some() {
            self.save(None)?;
        }
        Ok(())
    }
}

/// Drive a store's debounced persistence from an async host.
///
/// Ticks the router's deadline at `period` until the token trips; no
/// background thread is spawned by the core itself.
pub async fn run_ticker(store: std::sync::Arc<Store>, period: std::time::Duration, cancel: CancelToken) {
    let mut interval = tokio::time::interval(period);
    while !cancel.is_cancelled() {
        interval.tick().await;
        if let Err(e) = store.tick() {
            tracing::warn!(error = %e, "persistence tick failed");
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// `<index>.meta.json` next to the index file
fn sidecar_path(index_path: &Path) -> PathBuf {
    let name = index_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    index_path.with_file_name(format!("{name}.meta.json"))
}

fn atomic_write(path: &Path, write: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    validate_path(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{name}.tmp"));
    write(&tmp)?;
    std::fs::rename(&tmp, path).map_err(|e| {
        EngramError::backend(
            format!("rename {} -> {}: {e}", tmp.display(), path.display()),
            "check directory permissions",
        )
    })
}

fn load_keyword(path: &Path) -> Result<KeywordIndex> {
    if !path.exists() {
        return Ok(KeywordIndex::new());
    }
    let raw = std::fs::read_to_string(path).map_err(|e| {
        EngramError::corrupt(path.display().to_string(), format!("unreadable: {e}"))
    })?;
    serde_json::from_str(&raw)
        .map_err(|e| EngramError::corrupt(path.display().to_string(), e.to_string()))
}

fn load_chain(path: &Path) -> Result<WitnessChain> {
    if !path.exists() {
        return Ok(WitnessChain::new());
    }
    WitnessChain::load(path)
}

fn load_bandit(path: &Path) -> Result<ThompsonBandit> {
    if !path.exists() {
        return Ok(ThompsonBandit::new());
    }
    let raw = std::fs::read_to_string(path).map_err(|e| {
        EngramError::corrupt(path.display().to_string(), format!("unreadable: {e}"))
    })?;
    ThompsonBandit::deserialize(&raw)
}

// ============================================================================
// TESTS
// ============================================================================
