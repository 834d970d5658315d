//! Certificate emission, verification, and the witness chain.

use std::collections::HashMap;
use std::sync::Mutex;

use engram_core::witness::RECORD_SIZE;
use engram_core::{AccessLevel, CertificateRequest, ChunkInput, SourceResolver};
use engram_e2e_tests::memory_store;

/// Mutable episode table standing in for the relational side-table.
struct EpisodeTable {
    rows: Mutex<HashMap<String, String>>,
}

impl EpisodeTable {
    fn new(rows: &[(&str, &str)]) -> Self {
        Self {
            rows: Mutex::new(
                rows.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
        }
    }

    fn mutate(&self, id: &str, new_content: &str) {
        self.rows
            .lock()
            .unwrap()
            .insert(id.to_string(), new_content.to_string());
    }

    fn delete(&self, id: &str) {
        self.rows.lock().unwrap().remove(id);
    }
}

impl SourceResolver for EpisodeTable {
    fn content(&self, _chunk_type: &str, chunk_id: &str) -> Option<String> {
        self.rows.lock().unwrap().get(chunk_id).cloned()
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
        query_text: "recall the outputs".to_string(),
        chunks,
        requirements: requirements.iter().map(|s| s.to_string()).collect(),
        access_level: AccessLevel::Internal,
    }
}

/// Verify flips from valid to invalid when a cited source mutates, and
/// the issue names the mutated chunk.
#[test]
fn verify_flips_on_source_mutation() {
    let store = memory_store(4);
    let episodes = EpisodeTable::new(&[("ep1", "O1"), ("ep2", "O2"), ("ep3", "O3")]);

    let cert = store
        .create_certificate(&request(
            vec![chunk("ep1", "O1", 0.9), chunk("ep2", "O2", 0.8)],
            &["O"],
        ))
        .unwrap();

    let outcome = store.verify_certificate(&cert.certificate_id, &episodes).unwrap();
    assert!(outcome.valid, "fresh certificate must verify: {:?}", outcome.issues);

    episodes.mutate("ep1", "modified");
    let outcome = store.verify_certificate(&cert.certificate_id, &episodes).unwrap();
    assert!(!outcome.valid);
    assert!(outcome.issues.iter().any(|i| i.contains("ep1")));
    assert!(!outcome.issues.iter().any(|i| i.contains("ep2")));
}

/// A deleted source is an issue too.
#[test]
fn verify_reports_deleted_source() {
    let store = memory_store(4);
    let episodes = EpisodeTable::new(&[("ep1", "O1")]);
    let cert = store
        .create_certificate(&request(vec![chunk("ep1", "O1", 0.9)], &[]))
        .unwrap();

    episodes.delete("ep1");
    let outcome = store.verify_certificate(&cert.certificate_id, &episodes).unwrap();
    assert!(!outcome.valid);
    assert_eq!(outcome.issues, vec!["ep1 missing".to_string()]);
}

/// Greedy minimal hitting set over partially redundant chunks.
#[test]
fn minimal_why_is_smallest_cover() {
    let store = memory_store(4);
    let cert = store
        .create_certificate(&request(
            vec![
                chunk("c1", "apple and banana", 0.9),
                chunk("c2", "cherry", 0.8),
                chunk("c3", "apple", 0.7),
            ],
            &["apple", "banana", "cherry"],
        ))
        .unwrap();

    assert_eq!(cert.minimal_why.len(), 2);
    assert!(cert.minimal_why.contains(&"c1".to_string()));
    assert!(cert.minimal_why.contains(&"c2".to_string()));
    assert!((cert.redundancy - 1.5).abs() < 1e-9);
    assert!((cert.completeness - 1.0).abs() < 1e-9);
}

/// Empty chunk lists are rejected outright.
#[test]
fn empty_chunks_rejected() {
    let store = memory_store(4);
    assert!(store.create_certificate(&request(vec![], &["x"])).is_err());
}

/// Each emission appends exactly one 73-byte record and the chain stays
/// verifiable.
#[test]
fn witness_chain_grows_by_stride() {
    let store = memory_store(4);
    for i in 0..5 {
        store
            .create_certificate(&request(
                vec![chunk(&format!("e{i}"), &format!("content {i}"), 0.5)],
                &[],
            ))
            .unwrap();
        let stats = store.status();
        assert_eq!(stats.witness_records, i + 1);
    }
    store.verify_witness_chain().unwrap();
    assert_eq!(RECORD_SIZE, 73);
}

/// Audit walks every stored certificate.
#[test]
fn audit_reports_per_certificate() {
    let store = memory_store(4);
    let episodes = EpisodeTable::new(&[("a", "alpha"), ("b", "beta")]);
    let good = store
        .create_certificate(&request(vec![chunk("a", "alpha", 0.9)], &[]))
        .unwrap();
    let bad = store
        .create_certificate(&request(vec![chunk("b", "beta", 0.9)], &[]))
        .unwrap();
    episodes.mutate("b", "drifted");

    let audit = store.audit_certificates(&episodes).unwrap();
    assert_eq!(audit.len(), 2);
    let by_id: HashMap<&str, bool> = audit
        .iter()
        .map(|(id, outcome)| (id.as_str(), outcome.valid))
        .collect();
    assert!(by_id[good.certificate_id.as_str()]);
    assert!(!by_id[bad.certificate_id.as_str()]);
}

/// Unknown certificate ids fail with NotFound on verify.
#[test]
fn verify_unknown_certificate_is_not_found() {
    let store = memory_store(4);
    let episodes = EpisodeTable::new(&[]);
    let err = store.verify_certificate("missing", &episodes).unwrap_err();
    assert!(matches!(err, engram_core::EngramError::NotFound(_)));
}
