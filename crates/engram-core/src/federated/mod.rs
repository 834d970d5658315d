//! Federated session aggregation.
//!
//! A coordinator owns cross-session patterns; ephemeral per-session
//! agents record bounded trajectories and fold them back into the
//! coordinator when the session ends. Warm-started sessions begin with
//! the coordinator's strongest patterns. An optional LoRA adapter shapes
//! in-session embeddings; the "default" adapter is created and activated
//! at startup.
//!
//! The coordinator sits behind a writer guard only during aggregation
//! and consolidation; pattern reads are lock-shared.

pub mod lora;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::{EngramError, Result};
use crate::vector::{check_dimension, cosine_similarity};

pub use lora::LoraAdapter;

/// Default per-session trajectory bound
pub const DEFAULT_TRAJECTORY_CAPACITY: usize = 10_000;

/// Hard ceiling on the per-session trajectory bound
pub const MAX_TRAJECTORY_CAPACITY: usize = 100_000;

/// Longest accepted agent id
pub const MAX_AGENT_ID_LEN: usize = 256;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Aggregator construction parameters
#[derive(Debug, Clone)]
pub struct FederatedConfig {
    /// Activation vector dimensionality
    pub dimension: usize,
    /// Per-session trajectory bound
    pub trajectory_capacity: usize,
    /// Patterns handed to a warm-started session
    pub initial_patterns: usize,
    /// Pending trajectories that trigger auto-consolidation
    pub consolidation_threshold: usize,
    /// Quiet-period fallback trigger for auto-consolidation
    pub consolidation_interval: Duration,
    /// LoRA adapter rank
    pub lora_rank: usize,
    /// LoRA update strength
    pub lora_scale: f32,
    /// Step size for adapter reinforcement at session end
    pub adapter_learning_rate: f32,
    /// Seed for adapter init
    pub seed: u64,
}

impl FederatedConfig {
    /// Defaults for a dimensionality
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            trajectory_capacity: DEFAULT_TRAJECTORY_CAPACITY,
            initial_patterns: 8,
            consolidation_threshold: 64,
            consolidation_interval: Duration::from_secs(600),
            lora_rank: 4,
            lora_scale: 0.1,
            adapter_learning_rate: 0.01,
            seed: 0xFEDE_7A7E,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.trajectory_capacity == 0 || self.trajectory_capacity > MAX_TRAJECTORY_CAPACITY {
            return Err(EngramError::validation(format!(
                "trajectory capacity must be in 1..={MAX_TRAJECTORY_CAPACITY}"
            )));
        }
        Ok(())
    }
}

// ============================================================================
// TYPES
// ============================================================================

/// A consolidated cross-session pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    /// Quality-weighted mean activation
    pub vector: Vec<f32>,
    /// Accumulated quality mass
    pub weight: f32,
    /// Route label, when the trajectories carried one
    pub route: Option<String>,
}

/// One recorded trajectory step
#[derive(Debug, Clone)]
struct TrajectoryEntry {
    activation: Vec<f32>,
    quality: f32,
    route: Option<String>,
}

/// Summary returned by [`Session::end`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    /// Trajectories recorded
    pub trajectory_count: usize,
    /// Mean quality across the session
    pub avg_quality: f64,
    /// Patterns created or strengthened during aggregation
    pub patterns_learned: usize,
    /// Wall time from begin to end
    pub duration_ms: u64,
}

// ============================================================================
// COORDINATOR
// ============================================================================

/// Cross-session pattern state behind the aggregator's lock
#[derive(Debug)]
struct Coordinator {
    config: FederatedConfig,
    patterns: Vec<Pattern>,
    pending_trajectories: usize,
    last_consolidation: Instant,
    adapters: HashMap<String, LoraAdapter>,
    active_adapter: String,
}

impl Coordinator {
    fn aggregate(
        &mut self,
        trajectories: &[TrajectoryEntry],
        adapter_name: Option<&str>,
    ) -> Result<usize> {
        // Quality-weighted mean per route label
        let mut groups: HashMap<Option<&str>, (Vec<f32>, f32, usize)> = HashMap::new();
        for t in trajectories {
            let (sum, mass, count) = groups
                .entry(t.route.as_deref())
                .or_insert_with(|| (vec![0.0; self.config.dimension], 0.0, 0));
            for (s, a) in sum.iter_mut().zip(t.activation.iter()) {
                *s += a * t.quality;
            }
            *mass += t.quality;
            *count += 1;
        }

        let mut learned = 0;
        for (route, (sum, mass, count)) in groups {
            if mass <= 0.0 {
                continue;
            }
            let mean: Vec<f32> = sum.iter().map(|s| s / mass).collect();
            let existing = self.patterns.iter_mut().find(|p| {
                p.route.as_deref() == route && cosine_similarity(&p.vector, &mean) > 0.9
            });
            match existing {
                Some(pattern) => {
                    // Mass-weighted merge into the standing pattern
                    let total = pattern.weight + mass;
                    for (pv, mv) in pattern.vector.iter_mut().zip(mean.iter()) {
                        *pv = (*pv * pattern.weight + mv * mass) / total;
                    }
                    pattern.weight = total;
                }
                None => self.patterns.push(Pattern {
                    vector: mean.clone(),
                    weight: mass,
                    route: route.map(String::from),
                }),
            }
            // The adapter the session ran with learns the directions that
            // paid off, weighted by the group's mean quality
            if let Some(adapter) = adapter_name.and_then(|name| self.adapters.get_mut(name)) {
                let avg_quality = mass / count as f32;
                adapter.reinforce(&mean, avg_quality, self.config.adapter_learning_rate)?;
            }
            learned += 1;
        }
        self.pending_trajectories += trajectories.len();
        Ok(learned)
    }

    fn should_consolidate(&self) -> bool {
        self.pending_trajectories >= self.config.consolidation_threshold
            || (self.pending_trajectories > 0
                && self.last_consolidation.elapsed() >= self.config.consolidation_interval)
    }

    fn consolidate(&mut self, cancel: Option<&CancelToken>) -> Result<usize> {
        let before = self.patterns.len();
        let mut merged: Vec<Pattern> = Vec::with_capacity(before);
        for pattern in self.patterns.drain(..) {
            if let Some(token) = cancel {
                token.check("consolidate")?;
            }
            let target = merged.iter_mut().find(|p| {
                p.route == pattern.route && cosine_similarity(&p.vector, &pattern.vector) > 0.95
            });
            match target {
                Some(existing) => {
                    let total = existing.weight + pattern.weight;
                    for (ev, pv) in existing.vector.iter_mut().zip(pattern.vector.iter()) {
                        *ev = (*ev * existing.weight + pv * pattern.weight) / total;
                    }
                    existing.weight = total;
                }
                None => merged.push(pattern),
            }
        }
        merged.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        self.patterns = merged;
        self.pending_trajectories = 0;
        self.last_consolidation = Instant::now();
        Ok(before - self.patterns.len())
    }

    fn top_patterns(&self, count: usize) -> Vec<Pattern> {
        let mut sorted: Vec<&Pattern> = self.patterns.iter().collect();
        sorted.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        sorted.into_iter().take(count).cloned().collect()
    }
}

// ============================================================================
// AGGREGATOR
// ============================================================================

/// Shared entry point: owns the coordinator, hands out sessions
#[derive(Debug)]
pub struct FederatedAggregator {
    inner: Arc<RwLock<Coordinator>>,
}

impl FederatedAggregator {
    /// Create a coordinator with the "default" adapter active
    pub fn new(config: FederatedConfig) -> Result<Self> {
        config.validate()?;
        let default_adapter = LoraAdapter::new(
            "default",
            config.dimension,
            config.lora_rank,
            config.lora_scale,
            config.seed,
        );
        let mut adapters = HashMap::new();
        adapters.insert("default".to_string(), default_adapter);
        Ok(Self {
            inner: Arc::new(RwLock::new(Coordinator {
                config,
                patterns: Vec::new(),
                pending_trajectories: 0,
                last_consolidation: Instant::now(),
                adapters,
                active_adapter: "default".to_string(),
            })),
        })
    }

    /// Begin an ephemeral session for an agent.
    ///
    /// With `warm_start`, the session receives the coordinator's
    /// strongest patterns.
    pub fn begin_session(&self, agent_id: &str, warm_start: bool) -> Result<Session> {
        if agent_id.is_empty() || agent_id.len() > MAX_AGENT_ID_LEN {
            return Err(EngramError::validation(format!(
                "agent id must be 1..={MAX_AGENT_ID_LEN} bytes"
            )));
        }
        if agent_id.contains('\0') {
            return Err(EngramError::validation("agent id contains null byte"));
        }
        let guard = self.inner.read().expect("coordinator lock poisoned");
        let initial_patterns = if warm_start {
            guard.top_patterns(guard.config.initial_patterns)
        } else {
            Vec::new()
        };
        let adapter = guard.adapters.get(&guard.active_adapter).cloned();
        let adapter_name = adapter.as_ref().map(|a| a.name.clone());
        let capacity = guard.config.trajectory_capacity;
        let dimension = guard.config.dimension;
        drop(guard);

        debug!(agent_id, warm_start, "session started");
        Ok(Session {
            coordinator: Arc::clone(&self.inner),
            agent_id: agent_id.to_string(),
            dimension,
            capacity,
            initial_patterns,
            adapter,
            adapter_name,
            trajectories: Vec::new(),
            started: Instant::now(),
        })
    }

    /// Current cross-session pattern count
    pub fn pattern_count(&self) -> usize {
        self.inner.read().expect("coordinator lock poisoned").patterns.len()
    }

    /// Strongest patterns, best first
    pub fn patterns(&self, count: usize) -> Vec<Pattern> {
        self.inner
            .read()
            .expect("coordinator lock poisoned")
            .top_patterns(count)
    }

    /// Whether enough has accumulated to be worth consolidating
    pub fn should_consolidate(&self) -> bool {
        self.inner
            .read()
            .expect("coordinator lock poisoned")
            .should_consolidate()
    }

    /// Merge near-duplicate patterns; returns how many were folded away
    pub fn consolidate(&self, cancel: Option<&CancelToken>) -> Result<usize> {
        let merged = self
            .inner
            .write()
            .expect("coordinator lock poisoned")
            .consolidate(cancel)?;
        info!(merged, "federated patterns consolidated");
        Ok(merged)
    }

    /// Register a new named adapter
    pub fn create_adapter(&self, name: &str, rank: usize) -> Result<()> {
        if name.is_empty() {
            return Err(EngramError::validation("adapter name must be non-empty"));
        }
        let mut guard = self.inner.write().expect("coordinator lock poisoned");
        let adapter = LoraAdapter::new(
            name,
            guard.config.dimension,
            rank,
            guard.config.lora_scale,
            guard.config.seed ^ name.len() as u64,
        );
        guard.adapters.insert(name.to_string(), adapter);
        Ok(())
    }

    /// Make a named adapter the one handed to new sessions
    pub fn activate_adapter(&self, name: &str) -> Result<()> {
        let mut guard = self.inner.write().expect("coordinator lock poisoned");
        if !guard.adapters.contains_key(name) {
            return Err(EngramError::NotFound(format!("adapter {name}")));
        }
        guard.active_adapter = name.to_string();
        Ok(())
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// An ephemeral per-agent recording session.
///
/// Consumed by [`Session::end`]; trajectories die with the session after
/// aggregation into the coordinator.
pub struct Session {
    coordinator: Arc<RwLock<Coordinator>>,
    agent_id: String,
    dimension: usize,
    capacity: usize,
    initial_patterns: Vec<Pattern>,
    /// Snapshot applied to in-session embeddings
    adapter: Option<LoraAdapter>,
    /// Registry name the snapshot came from; reinforced at session end
    adapter_name: Option<String>,
    trajectories: Vec<TrajectoryEntry>,
    started: Instant,
}

impl Session {
    /// The agent this session records for
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Warm-start patterns captured at session begin
    pub fn initial_patterns(&self) -> &[Pattern] {
        &self.initial_patterns
    }

    /// Trajectories recorded so far
    pub fn trajectory_count(&self) -> usize {
        self.trajectories.len()
    }

    /// Shape an embedding with the session's adapter; identity when no
    /// adapter is active
    pub fn apply_adapter(&self, v: &[f32]) -> Result<Vec<f32>> {
        match &self.adapter {
            Some(adapter) => adapter.apply(v),
            None => {
                check_dimension(self.dimension, v)?;
                Ok(v.to_vec())
            }
        }
    }

    /// Record one trajectory step
    pub fn record_trajectory(
        &mut self,
        activation: &[f32],
        quality: f32,
        route: Option<&str>,
    ) -> Result<()> {
        check_dimension(self.dimension, activation)?;
        if !(0.0..=1.0).contains(&quality) {
            return Err(EngramError::validation(format!(
                "quality must be in [0, 1], got {quality}"
            )));
        }
        if self.trajectories.len() >= self.capacity {
            return Err(EngramError::Capacity(format!(
                "trajectory buffer full at {} entries",
                self.capacity
            )));
        }
        self.trajectories.push(TrajectoryEntry {
            activation: activation.to_vec(),
            quality,
            route: route.map(String::from),
        });
        Ok(())
    }

    /// End the session: aggregate into the coordinator and report stats.
    ///
    /// Each route group's quality-weighted mean is folded into the
    /// pattern set and reinforces the registry adapter this session ran
    /// with, so later sessions start from the updated adapter.
    /// Auto-consolidates when the coordinator's threshold is reached.
    pub fn end(self) -> Result<SessionStats> {
        let trajectory_count = self.trajectories.len();
        let avg_quality = if trajectory_count == 0 {
            0.0
        } else {
            self.trajectories.iter().map(|t| t.quality as f64).sum::<f64>()
                / trajectory_count as f64
        };

        let mut guard = self.coordinator.write().expect("coordinator lock poisoned");
        let patterns_learned =
            guard.aggregate(&self.trajectories, self.adapter_name.as_deref())?;
        if guard.should_consolidate() {
            guard.consolidate(None)?;
        }
        drop(guard);

        debug!(agent_id = %self.agent_id, trajectory_count, "session ended");
        Ok(SessionStats {
            trajectory_count,
            avg_quality,
            patterns_learned,
            duration_ms: self.started.elapsed().as_millis() as u64,
        })
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

    fn aggregator(dim: usize) -> FederatedAggregator {
        FederatedAggregator::new(FederatedConfig::new(dim)).unwrap()
    }

    #[test]
    fn test_agent_id_validation() {
        let agg = aggregator(4);
        assert!(agg.begin_session("", true).is_err());
        assert!(agg.begin_session(&"x".repeat(257), true).is_err());
        assert!(agg.begin_session("bad\0id", true).is_err());
        assert!(agg.begin_session("agent-1", true).is_ok());
    }

    #[test]
    fn test_session_records_and_aggregates() {
        let agg = aggregator(4);
        let mut session = agg.begin_session("agent-1", true).unwrap();
        assert!(session.initial_patterns().is_empty());

        session.record_trajectory(&unit(4, 0), 0.8, Some("search")).unwrap();
        session.record_trajectory(&unit(4, 0), 0.6, Some("search")).unwrap();
        session.record_trajectory(&unit(4, 2), 0.9, Some("route")).unwrap();

        let stats = session.end().unwrap();
        assert_eq!(stats.trajectory_count, 3);
        assert!((stats.avg_quality - (0.8 + 0.6 + 0.9) / 3.0).abs() < 1e-9);
        assert_eq!(stats.patterns_learned, 2);
        assert_eq!(agg.pattern_count(), 2);
    }

    #[test]
    fn test_warm_start_sees_prior_patterns() {
        let agg = aggregator(4);
        let mut first = agg.begin_session("a", false).unwrap();
        first.record_trajectory(&unit(4, 1), 1.0, Some("nav")).unwrap();
        first.end().unwrap();

        let warm = agg.begin_session("b", true).unwrap();
        assert_eq!(warm.initial_patterns().len(), 1);
        assert_eq!(warm.initial_patterns()[0].route.as_deref(), Some("nav"));

        let cold = agg.begin_session("c", false).unwrap();
        assert!(cold.initial_patterns().is_empty());
    }

    #[test]
    fn test_trajectory_capacity_enforced() {
        let mut config = FederatedConfig::new(2);
        config.trajectory_capacity = 2;
        let agg = FederatedAggregator::new(config).unwrap();
        let mut session = agg.begin_session("a", false).unwrap();
        session.record_trajectory(&[1.0, 0.0], 0.5, None).unwrap();
        session.record_trajectory(&[0.0, 1.0], 0.5, None).unwrap();
        let err = session.record_trajectory(&[1.0, 1.0], 0.5, None).unwrap_err();
        assert!(matches!(err, EngramError::Capacity(_)));
    }

    #[test]
    fn test_quality_bounds() {
        let agg = aggregator(2);
        let mut session = agg.begin_session("a", false).unwrap();
        assert!(session.record_trajectory(&[1.0, 0.0], 1.5, None).is_err());
        assert!(session.record_trajectory(&[1.0, 0.0], -0.1, None).is_err());
    }

    #[test]
    fn test_consolidation_merges_near_duplicates() {
        let agg = aggregator(4);
        for i in 0..3 {
            let mut session = agg.begin_session(&format!("a{i}"), false).unwrap();
            // Slightly perturbed copies of the same direction
            let mut v = unit(4, 0);
            v[1] = 0.01 * i as f32;
            session.record_trajectory(&v, 0.9, Some("same")).unwrap();
            session.end().unwrap();
        }
        // Aggregation alone may already merge (cosine > 0.9); consolidation
        // must leave a single pattern regardless
        agg.consolidate(None).unwrap();
        assert_eq!(agg.pattern_count(), 1);
    }

    #[test]
    fn test_should_consolidate_threshold() {
        let mut config = FederatedConfig::new(2);
        config.consolidation_threshold = 2;
        let agg = FederatedAggregator::new(config).unwrap();
        assert!(!agg.should_consolidate());

        let mut session = agg.begin_session("a", false).unwrap();
        session.record_trajectory(&[1.0, 0.0], 0.5, None).unwrap();
        session.record_trajectory(&[1.0, 0.0], 0.5, None).unwrap();
        // end() auto-consolidates once the threshold is crossed
        session.end().unwrap();
        assert!(!agg.should_consolidate());
        assert_eq!(agg.pattern_count(), 1);
    }

    #[test]
    fn test_adapters_create_activate_apply() {
        let agg = aggregator(4);
        agg.create_adapter("tuned", 2).unwrap();
        agg.activate_adapter("tuned").unwrap();
        assert!(agg.activate_adapter("ghost").is_err());

        let session = agg.begin_session("a", false).unwrap();
        // Fresh adapters are identity
        let v = unit(4, 1);
        assert_eq!(session.apply_adapter(&v).unwrap(), v);
    }

    #[test]
    fn test_session_end_reinforces_registry_adapter() {
        let agg = aggregator(4);
        let v = unit(4, 1);

        let mut session = agg.begin_session("a", false).unwrap();
        // The in-session snapshot is still identity while recording
        assert_eq!(session.apply_adapter(&v).unwrap(), v);
        session.record_trajectory(&v, 1.0, None).unwrap();
        session.end().unwrap();

        // The registry adapter learned the rewarded direction, so a later
        // session no longer applies the identity
        let next = agg.begin_session("b", false).unwrap();
        let out = next.apply_adapter(&v).unwrap();
        assert_ne!(out, v);
        // The rewarded component moved the most
        let deltas: Vec<f32> = out.iter().zip(v.iter()).map(|(o, x)| (o - x).abs()).collect();
        let max = deltas.iter().cloned().fold(0.0f32, f32::max);
        assert!(deltas[1] >= max - 1e-9);
    }

    #[test]
    fn test_zero_quality_session_leaves_adapter_alone() {
        let agg = aggregator(4);
        let v = unit(4, 2);

        let mut session = agg.begin_session("a", false).unwrap();
        session.record_trajectory(&v, 0.0, None).unwrap();
        session.end().unwrap();

        // Mass zero: no pattern, no reinforcement
        assert_eq!(agg.pattern_count(), 0);
        let next = agg.begin_session("b", false).unwrap();
        assert_eq!(next.apply_adapter(&v).unwrap(), v);
    }

    #[test]
    fn test_cancelled_consolidation() {
        let agg = aggregator(2);
        let mut session = agg.begin_session("a", false).unwrap();
        session.record_trajectory(&[1.0, 0.0], 0.5, None).unwrap();
        session.end().unwrap();

        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(
            agg.consolidate(Some(&token)).unwrap_err(),
            EngramError::Cancelled(_)
        ));
    }
}
