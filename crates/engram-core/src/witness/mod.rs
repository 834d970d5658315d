//! Tamper-evident recall: certificates, Merkle proofs, witness chain.

pub mod certificate;
pub mod chain;
pub mod merkle;

pub use certificate::{
    AccessLevel, Certificate, CertificateConfig, CertificateRequest, ChunkInput,
    JustificationPath, SourceHash, SourceResolver, VerifyOutcome, create_certificate,
    substring_coverage, verify_certificate,
};
pub use chain::{RECORD_SIZE, RECORD_VERSION, WitnessChain, verify_chain};
pub use merkle::{Hash32, MerkleProof, ProofStep, merkle_proofs, merkle_root, sha256, verify_proof};
