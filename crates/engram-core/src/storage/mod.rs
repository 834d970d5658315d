//! Relational rows owned by the store: certificates, justification
//! paths, provenance.

pub mod sqlite;

pub use sqlite::CertificateStore;
