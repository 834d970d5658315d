//! SQLite-backed certificate tables.
//!
//! Three tables keyed by `certificate_id`: the certificate row itself,
//! one justification row per minimal-why chunk, and a provenance row
//! linking the certificate to its witness-chain sequence number. Schema
//! is created idempotently at open; the connection sits behind a mutex.
//!
//! Structured columns (chunk ids, proofs, source hashes) are stored as
//! JSON text.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::error::{EngramError, Result};
use crate::paths::validate_path;
use crate::witness::{AccessLevel, Certificate, JustificationPath};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS certificates (
    certificate_id TEXT PRIMARY KEY,
    query_id       TEXT NOT NULL,
    query_text     TEXT NOT NULL,
    chunk_ids      TEXT NOT NULL,
    chunk_types    TEXT NOT NULL,
    minimal_why    TEXT NOT NULL,
    redundancy     REAL NOT NULL,
    completeness   REAL NOT NULL,
    merkle_root    TEXT NOT NULL,
    source_hashes  TEXT NOT NULL,
    proof_chain    TEXT NOT NULL,
    access_level   TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    latency_ms     REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS justification_paths (
    certificate_id TEXT NOT NULL,
    chunk_id       TEXT NOT NULL,
    reason         TEXT NOT NULL,
    necessity      REAL NOT NULL,
    path_elements  TEXT NOT NULL,
    PRIMARY KEY (certificate_id, chunk_id)
);

CREATE TABLE IF NOT EXISTS provenance (
    certificate_id TEXT PRIMARY KEY,
    chain_sequence INTEGER NOT NULL,
    recorded_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_justification_cert
    ON justification_paths(certificate_id);
";

fn access_level_str(level: AccessLevel) -> &'static str {
    match level {
        AccessLevel::Public => "public",
        AccessLevel::Internal => "internal",
        AccessLevel::Confidential => "confidential",
    }
}

fn access_level_parse(s: &str) -> Result<AccessLevel> {
    match s {
        "public" => Ok(AccessLevel::Public),
        "internal" => Ok(AccessLevel::Internal),
        "confidential" => Ok(AccessLevel::Confidential),
        other => Err(EngramError::corrupt(
            "certificates.db",
            format!("unknown access level {other}"),
        )),
    }
}

/// Certificate, justification, and provenance rows
#[derive(Debug)]
pub struct CertificateStore {
    conn: Mutex<Connection>,
}

impl CertificateStore {
    /// Open (or create) the database at `path`; `None` keeps it in memory
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let conn = match path {
            Some(path) => {
                validate_path(path)?;
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Persist a certificate, its justification rows, and its
    /// witness-chain sequence in one transaction
    pub fn insert(
        &self,
        certificate: &Certificate,
        justifications: &[JustificationPath],
        chain_sequence: u64,
    ) -> Result<()> {
        let mut conn = self.conn.lock().expect("certificate db lock poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO certificates (certificate_id, query_id, query_text, chunk_ids,
                chunk_types, minimal_why, redundancy, completeness, merkle_root,
                source_hashes, proof_chain, access_level, created_at, latency_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                certificate.certificate_id,
                certificate.query_id,
                certificate.query_text,
                serde_json::to_string(&certificate.chunk_ids)?,
                serde_json::to_string(&certificate.chunk_types)?,
                serde_json::to_string(&certificate.minimal_why)?,
                certificate.redundancy,
                certificate.completeness,
                certificate.merkle_root,
                serde_json::to_string(&certificate.source_hashes)?,
                serde_json::to_string(&certificate.proof_chain)?,
                access_level_str(certificate.access_level),
                certificate.created_at.to_rfc3339(),
                certificate.latency_ms,
            ],
        )?;
        for justification in justifications {
            tx.execute(
                "INSERT INTO justification_paths
                    (certificate_id, chunk_id, reason, necessity, path_elements)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    justification.certificate_id,
                    justification.chunk_id,
                    justification.reason,
                    justification.necessity,
                    serde_json::to_string(&justification.path_elements)?,
                ],
            )?;
        }
        tx.execute(
            "INSERT INTO provenance (certificate_id, chain_sequence, recorded_at)
             VALUES (?1, ?2, ?3)",
            params![
                certificate.certificate_id,
                chain_sequence as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        debug!(certificate_id = %certificate.certificate_id, "certificate persisted");
        Ok(())
    }

    /// A certificate by id
    pub fn get(&self, certificate_id: &str) -> Result<Option<Certificate>> {
        let conn = self.conn.lock().expect("certificate db lock poisoned");
        conn.query_row(
            "SELECT certificate_id, query_id, query_text, chunk_ids, chunk_types,
                    minimal_why, redundancy, completeness, merkle_root, source_hashes,
                    proof_chain, access_level, created_at, latency_ms
             FROM certificates WHERE certificate_id = ?1",
            params![certificate_id],
            row_to_certificate,
        )
        .optional()
        .map_err(EngramError::from)
    }

    /// All certificates, oldest first
    pub fn list(&self) -> Result<Vec<Certificate>> {
        let conn = self.conn.lock().expect("certificate db lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT certificate_id, query_id, query_text, chunk_ids, chunk_types,
                    minimal_why, redundancy, completeness, merkle_root, source_hashes,
                    proof_chain, access_level, created_at, latency_ms
             FROM certificates ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_certificate)?;
        let mut certificates = Vec::new();
        for row in rows {
            certificates.push(row?);
        }
        Ok(certificates)
    }

    /// Justification rows for a certificate
    pub fn justifications(&self, certificate_id: &str) -> Result<Vec<JustificationPath>> {
        let conn = self.conn.lock().expect("certificate db lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT certificate_id, chunk_id, reason, necessity, path_elements
             FROM justification_paths WHERE certificate_id = ?1",
        )?;
        let rows = stmt.query_map(params![certificate_id], |row| {
            let path_elements: String = row.get(4)?;
            Ok((
                JustificationPath {
                    certificate_id: row.get(0)?,
                    chunk_id: row.get(1)?,
                    reason: row.get(2)?,
                    necessity: row.get(3)?,
                    path_elements: Vec::new(),
                },
                path_elements,
            ))
        })?;
        let mut justifications = Vec::new();
        for row in rows {
            let (mut justification, raw) = row?;
            justification.path_elements = serde_json::from_str(&raw)?;
            justifications.push(justification);
        }
        Ok(justifications)
    }

    /// Witness-chain sequence for a certificate
    pub fn chain_sequence(&self, certificate_id: &str) -> Result<Option<u64>> {
        let conn = self.conn.lock().expect("certificate db lock poisoned");
        conn.query_row(
            "SELECT chain_sequence FROM provenance WHERE certificate_id = ?1",
            params![certificate_id],
            |row| row.get::<_, i64>(0).map(|s| s as u64),
        )
        .optional()
        .map_err(EngramError::from)
    }

    /// Stored certificate count
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("certificate db lock poisoned");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM certificates", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn row_to_certificate(row: &rusqlite::Row<'_>) -> rusqlite::Result<Certificate> {
    let chunk_ids: String = row.get(3)?;
    let chunk_types: String = row.get(4)?;
    let minimal_why: String = row.get(5)?;
    let source_hashes: String = row.get(9)?;
    let proof_chain: String = row.get(10)?;
    let access_level: String = row.get(11)?;
    let created_at: String = row.get(12)?;

    let parse = |field: &'static str, e: serde_json::Error| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{field}: {e}"),
            )),
        )
    };

    Ok(Certificate {
        certificate_id: row.get(0)?,
        query_id: row.get(1)?,
        query_text: row.get(2)?,
        chunk_ids: serde_json::from_str(&chunk_ids).map_err(|e| parse("chunk_ids", e))?,
        chunk_types: serde_json::from_str(&chunk_types).map_err(|e| parse("chunk_types", e))?,
        minimal_why: serde_json::from_str(&minimal_why).map_err(|e| parse("minimal_why", e))?,
        redundancy: row.get(6)?,
        completeness: row.get(7)?,
        merkle_root: row.get(8)?,
        source_hashes: serde_json::from_str(&source_hashes)
            .map_err(|e| parse("source_hashes", e))?,
        proof_chain: serde_json::from_str(&proof_chain).map_err(|e| parse("proof_chain", e))?,
        access_level: access_level_parse(&access_level).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "access_level",
                )),
            )
        })?,
        created_at: created_at
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        latency_ms: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::witness::{CertificateConfig, CertificateRequest, ChunkInput, create_certificate};

    fn sample_certificate() -> (Certificate, Vec<JustificationPath>) {
        let request = CertificateRequest {
            query_id: "q-1".to_string(),
            query_text: "what happened".to_string(),
            chunks: vec![
                ChunkInput {
                    id: "e1".to_string(),
                    chunk_type: "episode".to_string(),
                    content: "alpha beta".to_string(),
                    relevance: 0.9,
                },
                ChunkInput {
                    id: "e2".to_string(),
                    chunk_type: "episode".to_string(),
                    content: "gamma".to_string(),
                    relevance: 0.4,
                },
            ],
            requirements: vec!["alpha".to_string(), "gamma".to_string()],
            access_level: AccessLevel::Internal,
        };
        create_certificate(&request, &CertificateConfig::default()).unwrap()
    }

    #[test]
    fn test_insert_and_get_roundtrip() {
        let store = CertificateStore::open(None).unwrap();
        let (certificate, justifications) = sample_certificate();
        store.insert(&certificate, &justifications, 0).unwrap();

        let loaded = store.get(&certificate.certificate_id).unwrap().unwrap();
        assert_eq!(loaded.certificate_id, certificate.certificate_id);
        assert_eq!(loaded.chunk_ids, certificate.chunk_ids);
        assert_eq!(loaded.minimal_why, certificate.minimal_why);
        assert_eq!(loaded.merkle_root, certificate.merkle_root);
        assert_eq!(loaded.source_hashes.len(), 2);
        assert_eq!(loaded.proof_chain.len(), 2);
        assert_eq!(loaded.access_level, AccessLevel::Internal);

        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(
            store.chain_sequence(&certificate.certificate_id).unwrap(),
            Some(0)
        );
    }

    #[test]
    fn test_justification_rows_roundtrip() {
        let store = CertificateStore::open(None).unwrap();
        let (certificate, justifications) = sample_certificate();
        store.insert(&certificate, &justifications, 3).unwrap();

        let loaded = store.justifications(&certificate.certificate_id).unwrap();
        assert_eq!(loaded.len(), justifications.len());
        for j in &loaded {
            assert!(j.necessity > 0.0);
            assert!(!j.path_elements.is_empty());
        }
    }

    #[test]
    fn test_unknown_id_is_none() {
        let store = CertificateStore::open(None).unwrap();
        assert!(store.get("missing").unwrap().is_none());
        assert!(store.chain_sequence("missing").unwrap().is_none());
    }

    #[test]
    fn test_on_disk_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("certificates.db");
        let (certificate, justifications) = sample_certificate();
        {
            let store = CertificateStore::open(Some(&path)).unwrap();
            store.insert(&certificate, &justifications, 1).unwrap();
        }
        let reopened = CertificateStore::open(Some(&path)).unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
        assert_eq!(reopened.list().unwrap().len(), 1);
    }
}
