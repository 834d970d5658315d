//! Recall certificates.
//!
//! A certificate is an immutable record of one recall event: SHA-256
//! content hashes of every cited chunk, a Merkle root with per-chunk
//! inclusion proofs, and a **minimal-why** — the smallest chunk subset
//! covering every stated requirement (greedy hitting-set approximation,
//! ties broken by relevance). Verification recomputes the content hashes
//! through a [`SourceResolver`]; any drift or disappearance is surfaced
//! as an issue, never swallowed.
//!
//! Coverage is substring-on-lowercased-content by default, but the
//! matcher is swappable on [`CertificateConfig`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngramError, Result};
use crate::witness::merkle::{Hash32, MerkleProof, merkle_proofs, merkle_root, sha256};

// ============================================================================
// TYPES
// ============================================================================

/// Who may read a certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    /// Unrestricted
    Public,
    /// Same deployment only
    #[default]
    Internal,
    /// Restricted audience
    Confidential,
}

/// One recalled chunk cited by a certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInput {
    /// Source row id
    pub id: String,
    /// Source row kind (episode, skill, note, fact)
    pub chunk_type: String,
    /// Canonical content used for hashing
    pub content: String,
    /// Retrieval relevance in [0, 1]
    pub relevance: f32,
}

/// Input to [`create_certificate`]
#[derive(Debug, Clone)]
pub struct CertificateRequest {
    /// Caller's query id
    pub query_id: String,
    /// Query text as issued
    pub query_text: String,
    /// Cited chunks; must be non-empty
    pub chunks: Vec<ChunkInput>,
    /// Terms the recall must justify
    pub requirements: Vec<String>,
    /// Visibility of the certificate
    pub access_level: AccessLevel,
}

/// Content hash of one cited source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHash {
    /// Chunk id
    pub chunk_id: String,
    /// Chunk kind
    pub chunk_type: String,
    /// SHA-256 of the canonical content, hex
    pub content_hash: String,
}

/// An immutable recall certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    /// Unique id
    pub certificate_id: String,
    /// Caller's query id
    pub query_id: String,
    /// Query text as issued
    pub query_text: String,
    /// All cited chunk ids, in citation order
    pub chunk_ids: Vec<String>,
    /// Chunk kinds aligned with `chunk_ids`
    pub chunk_types: Vec<String>,
    /// Smallest chunk subset covering the requirements
    pub minimal_why: Vec<String>,
    /// |chunks| / |minimal_why|
    pub redundancy: f64,
    /// Covered requirements / max(1, requirements)
    pub completeness: f64,
    /// Merkle root over the source hashes, hex
    pub merkle_root: String,
    /// Per-source content hashes
    pub source_hashes: Vec<SourceHash>,
    /// Per-chunk inclusion proofs, aligned with `chunk_ids`
    pub proof_chain: Vec<MerkleProof>,
    /// Visibility
    pub access_level: AccessLevel,
    /// Emission time
    pub created_at: DateTime<Utc>,
    /// End-to-end creation latency
    pub latency_ms: f64,
}

/// Why one minimal-why chunk is necessary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JustificationPath {
    /// Owning certificate
    pub certificate_id: String,
    /// The necessary chunk
    pub chunk_id: String,
    /// Human-readable reason
    pub reason: String,
    /// Share of covered requirements this chunk contributes, in [0, 1]
    pub necessity: f64,
    /// Query → chunk → covered terms
    pub path_elements: Vec<String>,
}

/// Verification outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyOutcome {
    /// True when every source hash still matches
    pub valid: bool,
    /// One entry per failing chunk
    pub issues: Vec<String>,
}

/// Resolves a chunk back to its canonical content (the relational
/// side-table; the core never writes to it)
pub trait SourceResolver {
    /// Canonical content for a chunk, or `None` when it no longer exists
    fn content(&self, chunk_type: &str, chunk_id: &str) -> Option<String>;
}

/// Certificate knobs
#[derive(Debug)]
pub struct CertificateConfig {
    /// Whether `content` covers `requirement`
    pub coverage: fn(&str, &str) -> bool,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            coverage: substring_coverage,
        }
    }
}

/// Default coverage test: case-insensitive substring
pub fn substring_coverage(content: &str, requirement: &str) -> bool {
    content.to_lowercase().contains(&requirement.to_lowercase())
}

// ============================================================================
// CREATION
// ============================================================================

/// Build a certificate and the justification rows for its minimal-why.
///
/// Fails with Validation when `chunks` is empty.
pub fn create_certificate(
    request: &CertificateRequest,
    config: &CertificateConfig,
) -> Result<(Certificate, Vec<JustificationPath>)> {
    let started = std::time::Instant::now();
    if request.chunks.is_empty() {
        return Err(EngramError::validation(
            "certificate requires at least one chunk",
        ));
    }

    let leaves: Vec<Hash32> = request
        .chunks
        .iter()
        .map(|c| sha256(c.content.as_bytes()))
        .collect();
    let root = merkle_root(&leaves).expect("non-empty chunks");
    let proofs = merkle_proofs(&leaves);
    let source_hashes: Vec<SourceHash> = request
        .chunks
        .iter()
        .zip(leaves.iter())
        .map(|(chunk, leaf)| SourceHash {
            chunk_id: chunk.id.clone(),
            chunk_type: chunk.chunk_type.clone(),
            content_hash: hex::encode(leaf),
        })
        .collect();

    let (minimal_why, covered) = minimal_hitting_set(request, config);
    let completeness = covered.len() as f64 / request.requirements.len().max(1) as f64;
    let completeness = if request.requirements.is_empty() {
        1.0
    } else {
        completeness
    };
    let redundancy = request.chunks.len() as f64 / minimal_why.len().max(1) as f64;

    let certificate_id = Uuid::new_v4().to_string();
    let justifications = justification_rows(&certificate_id, request, &minimal_why, config);

    let certificate = Certificate {
        certificate_id,
        query_id: request.query_id.clone(),
        query_text: request.query_text.clone(),
        chunk_ids: request.chunks.iter().map(|c| c.id.clone()).collect(),
        chunk_types: request.chunks.iter().map(|c| c.chunk_type.clone()).collect(),
        minimal_why,
        redundancy,
        completeness,
        merkle_root: hex::encode(root),
        source_hashes,
        proof_chain: proofs,
        access_level: request.access_level,
        created_at: Utc::now(),
        latency_ms: started.elapsed().as_secs_f64() * 1000.0,
    };
    debug!(
        certificate_id = %certificate.certificate_id,
        chunks = certificate.chunk_ids.len(),
        minimal_why = certificate.minimal_why.len(),
        "certificate emitted"
    );
    Ok((certificate, justifications))
}

/// Greedy minimal hitting set: repeatedly take the chunk covering the
/// most uncovered requirements, relevance breaking ties. Returns the
/// chosen chunk ids and the covered requirement set. At least one chunk
/// is always returned.
fn minimal_hitting_set(
    request: &CertificateRequest,
    config: &CertificateConfig,
) -> (Vec<String>, Vec<String>) {
    let mut uncovered: Vec<&String> = request.requirements.iter().collect();
    let mut chosen: Vec<String> = Vec::new();
    let mut chosen_mask = vec![false; request.chunks.len()];
    let mut covered: Vec<String> = Vec::new();

    while !uncovered.is_empty() {
        let mut best: Option<(usize, usize, f32)> = None; // (index, gain, relevance)
        for (i, chunk) in request.chunks.iter().enumerate() {
            if chosen_mask[i] {
                continue;
            }
            let gain = uncovered
                .iter()
                .filter(|req| (config.coverage)(&chunk.content, req))
                .count();
            if gain == 0 {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, best_gain, best_rel)) => {
                    gain > best_gain || (gain == best_gain && chunk.relevance > best_rel)
                }
            };
            if better {
                best = Some((i, gain, chunk.relevance));
            }
        }
        let Some((index, _, _)) = best else {
            break; // nothing covers the remaining requirements
        };
        chosen_mask[index] = true;
        let chunk = &request.chunks[index];
        chosen.push(chunk.id.clone());
        uncovered.retain(|req| {
            let hit = (config.coverage)(&chunk.content, req);
            if hit {
                covered.push((*req).clone());
            }
            !hit
        });
    }

    if chosen.is_empty() {
        // No requirement was coverable (or none were given): cite the
        // single most relevant chunk
        let best = request
            .chunks
            .iter()
            .enumerate()
            .max_by(|a, b| {
                a.1.relevance
                    .partial_cmp(&b.1.relevance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
            .unwrap_or(0);
        chosen.push(request.chunks[best].id.clone());
    }
    (chosen, covered)
}

fn justification_rows(
    certificate_id: &str,
    request: &CertificateRequest,
    minimal_why: &[String],
    config: &CertificateConfig,
) -> Vec<JustificationPath> {
    let total_covered: usize = request
        .requirements
        .iter()
        .filter(|req| {
            request
                .chunks
                .iter()
                .any(|c| (config.coverage)(&c.content, req))
        })
        .count();

    minimal_why
        .iter()
        .filter_map(|chunk_id| {
            let chunk = request.chunks.iter().find(|c| &c.id == chunk_id)?;
            let terms: Vec<String> = request
                .requirements
                .iter()
                .filter(|req| (config.coverage)(&chunk.content, req))
                .cloned()
                .collect();
            let necessity = if total_covered == 0 {
                1.0
            } else {
                (terms.len() as f64 / total_covered as f64).min(1.0)
            };
            let reason = if terms.is_empty() {
                "highest-relevance citation".to_string()
            } else {
                format!("covers: {}", terms.join(", "))
            };
            let mut path_elements = vec![request.query_id.clone(), chunk.id.clone()];
            path_elements.extend(terms);
            Some(JustificationPath {
                certificate_id: certificate_id.to_string(),
                chunk_id: chunk.id.clone(),
                reason,
                necessity,
                path_elements,
            })
        })
        .collect()
}

// ============================================================================
// VERIFICATION
// ============================================================================

/// Re-hash every cited source and report drift.
///
/// A chunk whose content changed reports `"<id> hash changed"`; a chunk
/// that no longer resolves reports `"<id> missing"`.
pub fn verify_certificate(
    certificate: &Certificate,
    resolver: &dyn SourceResolver,
) -> VerifyOutcome {
    let mut issues = Vec::new();
    for source in &certificate.source_hashes {
        match resolver.content(&source.chunk_type, &source.chunk_id) {
            None => issues.push(format!("{} missing", source.chunk_id)),
            Some(content) => {
                let recomputed = hex::encode(sha256(content.as_bytes()));
                if recomputed != source.content_hash {
                    issues.push(format!("{} hash changed", source.chunk_id));
                }
            }
        }
    }
    VerifyOutcome {
        valid: issues.is_empty(),
        issues,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapResolver(HashMap<String, String>);

    impl SourceResolver for MapResolver {
        fn content(&self, _chunk_type: &str, chunk_id: &str) -> Option<String> {
            self.0.get(chunk_id).cloned()
        }
    }

    fn chunk(id: &str, content: &str, relevance: f32) -> ChunkInput {
        ChunkInput {
            id: id.to_string(),
            chunk_type: "episode".to_string(),
            content: content.to_string(),
            relevance,
        }
    }

    fn request(chunks: Vec<ChunkInput>, requirements: &[&str]) -> CertificateRequest {
        CertificateRequest {
            query_id: "q-1".to_string(),
            query_text: "test query".to_string(),
            chunks,
            requirements: requirements.iter().map(|s| s.to_string()).collect(),
            access_level: AccessLevel::Internal,
        }
    }

    #[test]
    fn test_empty_chunks_rejected() {
        let err =
            create_certificate(&request(vec![], &["x"]), &CertificateConfig::default()).unwrap_err();
        assert!(matches!(err, EngramError::Validation(_)));
    }

    #[test]
    fn test_minimal_hitting_set_scenario() {
        // "apple and banana" + "cherry" covers everything; "apple" alone
        // is redundant
        let req = request(
            vec![
                chunk("c1", "apple and banana", 0.9),
                chunk("c2", "cherry", 0.8),
                chunk("c3", "apple", 0.7),
            ],
            &["apple", "banana", "cherry"],
        );
        let (cert, just) = create_certificate(&req, &CertificateConfig::default()).unwrap();
        assert_eq!(cert.minimal_why.len(), 2);
        assert!(cert.minimal_why.contains(&"c1".to_string()));
        assert!(cert.minimal_why.contains(&"c2".to_string()));
        assert!((cert.redundancy - 1.5).abs() < 1e-9);
        assert!((cert.completeness - 1.0).abs() < 1e-9);
        assert_eq!(just.len(), 2);
    }

    #[test]
    fn test_relevance_breaks_ties() {
        let req = request(
            vec![chunk("low", "target", 0.2), chunk("high", "target", 0.9)],
            &["target"],
        );
        let (cert, _) = create_certificate(&req, &CertificateConfig::default()).unwrap();
        assert_eq!(cert.minimal_why, vec!["high".to_string()]);
    }

    #[test]
    fn test_empty_requirements_full_completeness() {
        let req = request(vec![chunk("c1", "anything", 0.5)], &[]);
        let (cert, _) = create_certificate(&req, &CertificateConfig::default()).unwrap();
        assert!((cert.completeness - 1.0).abs() < 1e-9);
        assert_eq!(cert.minimal_why, vec!["c1".to_string()]);
    }

    #[test]
    fn test_uncoverable_requirement_lowers_completeness() {
        let req = request(
            vec![chunk("c1", "alpha", 0.5)],
            &["alpha", "nonexistent-term"],
        );
        let (cert, _) = create_certificate(&req, &CertificateConfig::default()).unwrap();
        assert!((cert.completeness - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_verify_fresh_certificate() {
        let req = request(
            vec![chunk("e1", "O1", 0.9), chunk("e2", "O2", 0.8)],
            &["O"],
        );
        let (cert, _) = create_certificate(&req, &CertificateConfig::default()).unwrap();
        let resolver = MapResolver(
            [("e1", "O1"), ("e2", "O2")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        let outcome = verify_certificate(&cert, &resolver);
        assert!(outcome.valid);
        assert!(outcome.issues.is_empty());
    }

    #[test]
    fn test_verify_flips_on_mutation() {
        let req = request(
            vec![chunk("e1", "O1", 0.9), chunk("e2", "O2", 0.8)],
            &["O"],
        );
        let (cert, _) = create_certificate(&req, &CertificateConfig::default()).unwrap();
        let resolver = MapResolver(
            [("e1", "modified"), ("e2", "O2")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        let outcome = verify_certificate(&cert, &resolver);
        assert!(!outcome.valid);
        assert_eq!(outcome.issues, vec!["e1 hash changed".to_string()]);
    }

    #[test]
    fn test_verify_reports_missing_chunk() {
        let req = request(vec![chunk("e1", "O1", 0.9)], &[]);
        let (cert, _) = create_certificate(&req, &CertificateConfig::default()).unwrap();
        let resolver = MapResolver(HashMap::new());
        let outcome = verify_certificate(&cert, &resolver);
        assert!(!outcome.valid);
        assert_eq!(outcome.issues, vec!["e1 missing".to_string()]);
    }

    #[test]
    fn test_proofs_verify_against_root() {
        use crate::witness::merkle::verify_proof;

        let req = request(
            vec![
                chunk("a", "alpha", 0.9),
                chunk("b", "beta", 0.8),
                chunk("c", "gamma", 0.7),
            ],
            &[],
        );
        let (cert, _) = create_certificate(&req, &CertificateConfig::default()).unwrap();
        let root: Hash32 = hex::decode(&cert.merkle_root)
            .unwrap()
            .try_into()
            .unwrap();
        for (i, proof) in cert.proof_chain.iter().enumerate() {
            let leaf: Hash32 = hex::decode(&cert.source_hashes[i].content_hash)
                .unwrap()
                .try_into()
                .unwrap();
            assert!(verify_proof(&leaf, proof, &root), "proof {i}");
        }
    }

    #[test]
    fn test_necessity_within_unit_interval() {
        let req = request(
            vec![
                chunk("c1", "apple banana", 0.9),
                chunk("c2", "cherry", 0.8),
            ],
            &["apple", "banana", "cherry"],
        );
        let (_, just) = create_certificate(&req, &CertificateConfig::default()).unwrap();
        for j in &just {
            assert!((0.0..=1.0).contains(&j.necessity), "{}", j.necessity);
            assert!(j.path_elements.len() >= 2);
        }
    }
}
