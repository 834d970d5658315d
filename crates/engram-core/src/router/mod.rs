//! Semantic intent routing.
//!
//! One centroid per intent: `add_intent` averages the exemplar vectors
//! and pre-computes the centroid norm, `route` ranks intents by cosine
//! similarity to the query. For small `k` (below n/4) top-k uses a
//! bounded min-heap; otherwise a full sort.
//!
//! Persistence is debounced: every mutation marks the router dirty and
//! re-arms a deadline (default 5 s). A cooperative [`IntentRouter::tick`]
//! flushes expired deadlines; `close` cancels the timer and forces a
//! final flush. State lives in a JSON file
//! `{dim, threshold, intents: [{name, centroid, metadata}]}`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngramError, Result};
use crate::metadata::Metadata;
use crate::paths::validate_path;
use crate::vector::{check_dimension, dot, norm};

/// Default cap on intents per router
pub const DEFAULT_MAX_INTENTS: usize = 1000;

/// Longest accepted intent name
pub const MAX_NAME_LEN: usize = 256;

/// Most exemplars accepted per intent
pub const MAX_EXEMPLARS: usize = 100;

/// Default persistence debounce
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);

// ============================================================================
// TYPES
// ============================================================================

/// Router construction parameters
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Vector dimensionality
    pub dimension: usize,
    /// Minimum similarity for a route match
    pub threshold: f32,
    /// Cap on intents
    pub max_intents: usize,
    /// Quiet period before a scheduled persist fires
    pub debounce: Duration,
}

impl RouterConfig {
    /// Defaults for a dimensionality
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            threshold: 0.0,
            max_intents: DEFAULT_MAX_INTENTS,
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// A registered intent
#[derive(Debug, Clone)]
pub struct Intent {
    /// Unique name
    pub name: String,
    /// Mean of the exemplar vectors
    pub centroid: Vec<f32>,
    /// Pre-computed centroid norm
    pub norm: f32,
    /// Caller-supplied attributes
    pub metadata: Metadata,
}

/// Input to [`IntentRouter::add_intent`]
#[derive(Debug, Clone)]
pub struct AddIntent {
    /// Unique name, at most [`MAX_NAME_LEN`] bytes
    pub name: String,
    /// Exemplar vectors, 1..=[`MAX_EXEMPLARS`]
    pub exemplars: Vec<Vec<f32>>,
    /// Attributes carried on every match
    pub metadata: Metadata,
}

/// One routing match
#[derive(Debug, Clone)]
pub struct RouteMatch {
    /// Intent name
    pub intent: String,
    /// Cosine similarity of query and centroid
    pub score: f32,
    /// Intent attributes
    pub metadata: Metadata,
}

#[derive(Serialize, Deserialize)]
struct PersistedIntent {
    name: String,
    centroid: Vec<f32>,
    metadata: Metadata,
}

#[derive(Serialize, Deserialize)]
struct PersistedRouter {
    dim: usize,
    threshold: f32,
    intents: Vec<PersistedIntent>,
}

// ============================================================================
// ROUTER
// ============================================================================

/// Centroid-per-intent semantic router with debounced persistence
#[derive(Debug)]
pub struct IntentRouter {
    config: RouterConfig,
    intents: HashMap<String, Intent>,
    path: Option<PathBuf>,
    dirty: bool,
    deadline: Option<Instant>,
}

impl IntentRouter {
    /// Create an empty router
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            intents: HashMap::new(),
            path: None,
            dirty: false,
            deadline: None,
        }
    }

    /// Router parameters
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Registered intent count
    pub fn len(&self) -> usize {
        self.intents.len()
    }

    /// True when no intents are registered
    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    /// Names of all registered intents
    pub fn intent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.intents.keys().cloned().collect();
        names.sort();
        names
    }

    /// A registered intent by name
    pub fn intent(&self, name: &str) -> Option<&Intent> {
        self.intents.get(name)
    }

    /// Bind the router to a persistence path; scheduled persists write here
    pub fn set_path(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        validate_path(&path)?;
        self.path = Some(path);
        Ok(())
    }

    /// Register an intent; its centroid is the exemplar mean
    pub fn add_intent(&mut self, input: AddIntent) -> Result<()> {
        if input.name.is_empty() || input.name.len() > MAX_NAME_LEN {
            return Err(EngramError::validation(format!(
                "intent name must be 1..={MAX_NAME_LEN} bytes"
            )));
        }
        if input.exemplars.is_empty() || input.exemplars.len() > MAX_EXEMPLARS {
            return Err(EngramError::validation(format!(
                "exemplar count must be 1..={MAX_EXEMPLARS}, got {}",
                input.exemplars.len()
            )));
        }
        if !self.intents.contains_key(&input.name) && self.intents.len() >= self.config.max_intents
        {
            return Err(EngramError::Capacity(format!(
                "router full at {} intents",
                self.config.max_intents
            )));
        }
        for exemplar in &input.exemplars {
            check_dimension(self.config.dimension, exemplar)?;
        }

        let mut centroid = vec![0.0f32; self.config.dimension];
        for exemplar in &input.exemplars {
            for (c, x) in centroid.iter_mut().zip(exemplar.iter()) {
                *c += x;
            }
        }
        let count = input.exemplars.len() as f32;
        for c in centroid.iter_mut() {
            *c /= count;
        }
        let centroid_norm = norm(&centroid);

        self.intents.insert(
            input.name.clone(),
            Intent {
                name: input.name,
                centroid,
                norm: centroid_norm,
                metadata: input.metadata,
            },
        );
        self.schedule_persist();
        Ok(())
    }

    /// Drop an intent; returns whether it was present
    pub fn remove_intent(&mut self, name: &str) -> bool {
        let removed = self.intents.remove(name).is_some();
        if removed {
            self.schedule_persist();
        }
        removed
    }

    /// Top-k intents above the similarity threshold, best first
    pub fn route(&self, query: &[f32], k: usize) -> Result<Vec<RouteMatch>> {
        check_dimension(self.config.dimension, query)?;
        if k == 0 || self.intents.is_empty() {
            return Ok(Vec::new());
        }

        let query_norm = norm(query);
        let score_of = |intent: &Intent| -> f32 {
            if query_norm == 0.0 || intent.norm == 0.0 {
                return 0.0;
            }
            dot(query, &intent.centroid) / (query_norm * intent.norm)
        };

        let n = self.intents.len();
        let mut top: Vec<(f32, &Intent)> = if k < n / 4 {
            // Bounded min-heap: O(n log k)
            let mut heap: BinaryHeap<Reverse<(OrderedScore, &str)>> = BinaryHeap::new();
            let mut by_name: HashMap<&str, (f32, &Intent)> = HashMap::new();
            for intent in self.intents.values() {
                let score = score_of(intent);
                if score < self.config.threshold {
                    continue;
                }
                by_name.insert(intent.name.as_str(), (score, intent));
                heap.push(Reverse((OrderedScore(score), intent.name.as_str())));
                if heap.len() > k {
                    if let Some(Reverse((_, evicted))) = heap.pop() {
                        by_name.remove(evicted);
                    }
                }
            }
            heap.into_iter()
                .filter_map(|Reverse((_, name))| by_name.get(name).copied())
                .collect()
        } else {
            self.intents
                .values()
                .map(|intent| (score_of(intent), intent))
                .filter(|(score, _)| *score >= self.config.threshold)
                .collect()
        };

        top.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.name.cmp(&b.1.name))
        });
        top.truncate(k);
        Ok(top
            .into_iter()
            .map(|(score, intent)| RouteMatch {
                intent: intent.name.clone(),
                score,
                metadata: intent.metadata.clone(),
            })
            .collect())
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Mark dirty and re-arm the debounce deadline
    pub fn schedule_persist(&mut self) {
        self.dirty = true;
        self.deadline = Some(Instant::now() + self.config.debounce);
    }

    /// True when a scheduled persist is pending
    pub fn persist_pending(&self) -> bool {
        self.dirty
    }

    /// Cooperative timer tick: flush if the deadline has passed.
    ///
    /// Returns whether a flush happened.
    pub fn tick(&mut self) -> Result<bool> {
        let due = matches!(self.deadline, Some(d) if Instant::now() >= d);
        if self.dirty && due && self.path.is_some() {
            self.persist()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Force an immediate write to the bound path
    pub fn persist(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Err(EngramError::validation("router has no persistence path"));
        };
        self.save(&path)?;
        self.dirty = false;
        self.deadline = None;
        Ok(())
    }

    /// Cancel the pending timer and flush once if dirty
    pub fn close(&mut self) -> Result<()> {
        self.deadline = None;
        if self.dirty && self.path.is_some() {
            self.persist()?;
        }
        self.dirty = false;
        Ok(())
    }

    /// Write router state to an explicit path
    pub fn save(&self, path: &Path) -> Result<()> {
        validate_path(path)?;
        let mut intents: Vec<PersistedIntent> = self
            .intents
            .values()
            .map(|i| PersistedIntent {
                name: i.name.clone(),
                centroid: i.centroid.clone(),
                metadata: i.metadata.clone(),
            })
            .collect();
        intents.sort_by(|a, b| a.name.cmp(&b.name));
        let persisted = PersistedRouter {
            dim: self.config.dimension,
            threshold: self.config.threshold,
            intents,
        };
        let json = serde_json::to_string(&persisted)?;
        std::fs::write(path, json).map_err(|e| {
            EngramError::backend(
                format!("write {}: {e}", path.display()),
                "check that the target directory exists and is writable",
            )
        })?;
        debug!(path = %path.display(), intents = self.intents.len(), "router persisted");
        Ok(())
    }

    /// Load router state saved by [`Self::save`]; the loaded router is
    /// bound to `path` for future scheduled persists
    pub fn load(path: &Path, config: RouterConfig) -> Result<Self> {
        validate_path(path)?;
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngramError::corrupt(path.display().to_string(), format!("unreadable: {e}"))
        })?;
        let persisted: PersistedRouter = serde_json::from_str(&raw)
            .map_err(|e| EngramError::corrupt(path.display().to_string(), e.to_string()))?;
        if persisted.dim != config.dimension {
            return Err(EngramError::corrupt(
                path.display().to_string(),
                format!(
                    "dimension mismatch: file has {}, router expects {}",
                    persisted.dim, config.dimension
                ),
            ));
        }

        let mut router = Self::new(RouterConfig {
            threshold: persisted.threshold,
            ..config
        });
        for intent in persisted.intents {
            if intent.centroid.len() != router.config.dimension {
                return Err(EngramError::corrupt(
                    path.display().to_string(),
                    format!("intent {} has wrong centroid dimension", intent.name),
                ));
            }
            let centroid_norm = norm(&intent.centroid);
            router.intents.insert(
                intent.name.clone(),
                Intent {
                    name: intent.name,
                    centroid: intent.centroid,
                    norm: centroid_norm,
                    metadata: intent.metadata,
                },
            );
        }
        router.path = Some(path.to_path_buf());
        Ok(router)
    }
}

/// f32 similarity with a total order for the top-k heap
#[derive(PartialEq)]
struct OrderedScore(f32);

impl Eq for OrderedScore {}

impl PartialOrd for OrderedScore {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedScore {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis % dim] = 1.0;
        v
    }

    fn add(router: &mut IntentRouter, name: &str, exemplars: Vec<Vec<f32>>) {
        router
            .add_intent(AddIntent {
                name: name.to_string(),
                exemplars,
                metadata: Metadata::new(),
            })
            .unwrap();
    }

    #[test]
    fn test_centroid_is_exemplar_mean() {
        let mut router = IntentRouter::new(RouterConfig::new(2));
        add(&mut router, "greet", vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        let intent = router.intent("greet").unwrap();
        assert_eq!(intent.centroid, vec![0.5, 0.5]);
        assert!((intent.norm - 0.5f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_route_centroid_scores_one() {
        let mut router = IntentRouter::new(RouterConfig::new(4));
        add(&mut router, "a", vec![unit(4, 0)]);
        add(&mut router, "b", vec![unit(4, 1)]);

        let centroid = router.intent("a").unwrap().centroid.clone();
        let matches = router.route(&centroid, 1).unwrap();
        assert_eq!(matches[0].intent, "a");
        assert!((matches[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_filters_matches() {
        let mut router = IntentRouter::new(RouterConfig {
            threshold: 0.5,
            ..RouterConfig::new(2)
        });
        add(&mut router, "x", vec![vec![1.0, 0.0]]);
        add(&mut router, "y", vec![vec![0.0, 1.0]]);

        let matches = router.route(&[1.0, 0.0], 5).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].intent, "x");
    }

    #[test]
    fn test_heap_and_sort_paths_agree() {
        let mut router = IntentRouter::new(RouterConfig::new(8));
        for i in 0..40 {
            add(&mut router, &format!("i{i:02}"), vec![unit(8, i)]);
        }
        let query = unit(8, 3);
        // k=2 < 40/4 takes the heap path; k=20 takes the sort path
        let heap_path = router.route(&query, 2).unwrap();
        let sort_path = router.route(&query, 20).unwrap();
        assert_eq!(heap_path[0].intent, sort_path[0].intent);
        assert!((heap_path[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_validation_limits() {
        let mut router = IntentRouter::new(RouterConfig::new(2));
        let long_name = "n".repeat(MAX_NAME_LEN + 1);
        assert!(router
            .add_intent(AddIntent {
                name: long_name,
                exemplars: vec![vec![1.0, 0.0]],
                metadata: Metadata::new(),
            })
            .is_err());
        assert!(router
            .add_intent(AddIntent {
                name: "no-exemplars".into(),
                exemplars: vec![],
                metadata: Metadata::new(),
            })
            .is_err());
        assert!(router
            .add_intent(AddIntent {
                name: "wrong-dim".into(),
                exemplars: vec![vec![1.0, 0.0, 0.0]],
                metadata: Metadata::new(),
            })
            .is_err());
    }

    #[test]
    fn test_capacity_cap() {
        let mut router = IntentRouter::new(RouterConfig {
            max_intents: 2,
            ..RouterConfig::new(2)
        });
        add(&mut router, "a", vec![vec![1.0, 0.0]]);
        add(&mut router, "b", vec![vec![0.0, 1.0]]);
        let err = router
            .add_intent(AddIntent {
                name: "c".into(),
                exemplars: vec![vec![1.0, 1.0]],
                metadata: Metadata::new(),
            })
            .unwrap_err();
        assert!(matches!(err, EngramError::Capacity(_)));
        // Replacing an existing intent is still allowed
        add(&mut router, "a", vec![vec![0.5, 0.5]]);
    }

    #[test]
    fn test_debounce_tick_and_close() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("router.json");

        let mut router = IntentRouter::new(RouterConfig {
            debounce: Duration::from_millis(10),
            ..RouterConfig::new(2)
        });
        router.set_path(&path).unwrap();
        add(&mut router, "a", vec![vec![1.0, 0.0]]);

        assert!(router.persist_pending());
        // Deadline not reached yet
        assert!(!router.tick().unwrap());
        std::thread::sleep(Duration::from_millis(15));
        assert!(router.tick().unwrap());
        assert!(!router.persist_pending());
        assert!(path.exists());

        // close flushes dirty state even without a tick
        add(&mut router, "b", vec![vec![0.0, 1.0]]);
        router.close().unwrap();
        let restored = IntentRouter::load(&path, RouterConfig::new(2)).unwrap();
        assert_eq!(restored.intent_names(), vec!["a", "b"]);
    }

    #[test]
    fn test_save_load_roundtrip_routes_identically() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("router.json");

        let mut router = IntentRouter::new(RouterConfig::new(4));
        for i in 0..3 {
            add(&mut router, &format!("intent-{i}"), vec![unit(4, i)]);
        }
        router.save(&path).unwrap();

        let restored = IntentRouter::load(&path, RouterConfig::new(4)).unwrap();
        assert_eq!(restored.intent_names(), router.intent_names());
        for i in 0..3 {
            let name = format!("intent-{i}");
            let centroid = restored.intent(&name).unwrap().centroid.clone();
            let matches = restored.route(&centroid, 1).unwrap();
            assert_eq!(matches[0].intent, name);
            assert!((matches[0].score - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_load_rejects_dimension_mismatch() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("router.json");
        let mut router = IntentRouter::new(RouterConfig::new(2));
        add(&mut router, "a", vec![vec![1.0, 0.0]]);
        router.save(&path).unwrap();

        assert!(matches!(
            IntentRouter::load(&path, RouterConfig::new(4)).unwrap_err(),
            EngramError::Corrupt { .. }
        ));
    }
}
