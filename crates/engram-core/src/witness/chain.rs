//! Append-only witness chain.
//!
//! One 73-byte record per certificate emission:
//!
//! ```text
//! [ version: 1 ][ root: 32 ][ sequence: 8, BE ][ mac: 32 ]  = 73 bytes
//! ```
//!
//! The MAC is SHAKE-256 over the previous record's MAC (zeros for the
//! genesis record) followed by the record's version, root, and sequence,
//! squeezed to 32 bytes. Structural validity requires the byte length be
//! a multiple of 73; cryptographic verification recomputes every MAC.

use std::path::Path;

use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake256;

use crate::error::{EngramError, Result};
use crate::paths::validate_path;
use crate::witness::merkle::Hash32;

/// Record stride in bytes
pub const RECORD_SIZE: usize = 73;

/// Current record version tag
pub const RECORD_VERSION: u8 = 1;

const ROOT_OFFSET: usize = 1;
const SEQ_OFFSET: usize = 33;
const MAC_OFFSET: usize = 41;

fn shake_mac(prev_mac: &[u8; 32], head: &[u8]) -> [u8; 32] {
    let mut hasher = Shake256::default();
    hasher.update(prev_mac);
    hasher.update(head);
    let mut mac = [0u8; 32];
    hasher.finalize_xof().read(&mut mac);
    mac
}

/// Append-only bytestream of 73-byte witness records
#[derive(Debug, Clone, Default)]
pub struct WitnessChain {
    bytes: Vec<u8>,
}

impl WitnessChain {
    /// New empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Records appended so far
    pub fn len(&self) -> usize {
        self.bytes.len() / RECORD_SIZE
    }

    /// True when no records are appended
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The raw bytestream; `len() * 73` bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Append one record for a certificate's merkle root; returns the
    /// record's sequence number
    pub fn append(&mut self, root: &Hash32) -> u64 {
        let sequence = self.len() as u64;
        let prev_mac = self.tail_mac();

        let mut head = [0u8; MAC_OFFSET];
        head[0] = RECORD_VERSION;
        head[ROOT_OFFSET..SEQ_OFFSET].copy_from_slice(root);
        head[SEQ_OFFSET..MAC_OFFSET].copy_from_slice(&sequence.to_be_bytes());
        let mac = shake_mac(&prev_mac, &head);

        self.bytes.extend_from_slice(&head);
        self.bytes.extend_from_slice(&mac);
        sequence
    }

    /// Write the chain to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        validate_path(path)?;
        std::fs::write(path, &self.bytes).map_err(|e| {
            EngramError::backend(
                format!("write {}: {e}", path.display()),
                "check that the target directory exists and is writable",
            )
        })
    }

    /// Load and fully verify a chain from disk
    pub fn load(path: &Path) -> Result<Self> {
        validate_path(path)?;
        let bytes = std::fs::read(path).map_err(|e| {
            EngramError::corrupt(path.display().to_string(), format!("unreadable: {e}"))
        })?;
        verify_chain(&bytes)?;
        Ok(Self { bytes })
    }

    fn tail_mac(&self) -> [u8; 32] {
        if self.bytes.is_empty() {
            return [0u8; 32];
        }
        let tail = &self.bytes[self.bytes.len() - 32..];
        tail.try_into().expect("32-byte tail")
    }
}

/// Verify a witness bytestream: stride first, then every record's MAC.
///
/// The stride check (`len % 73 == 0`) is the structural precondition;
/// the MAC walk is the cryptographic check.
pub fn verify_chain(bytes: &[u8]) -> Result<()> {
    if bytes.len() % RECORD_SIZE != 0 {
        return Err(EngramError::corrupt(
            "witness chain",
            format!("length {} is not a multiple of {RECORD_SIZE}", bytes.len()),
        ));
    }
    let mut prev_mac = [0u8; 32];
    for (index, record) in bytes.chunks(RECORD_SIZE).enumerate() {
        if record[0] != RECORD_VERSION {
            return Err(EngramError::corrupt(
                "witness chain",
                format!("record {index} has unknown version {}", record[0]),
            ));
        }
        let sequence = u64::from_be_bytes(record[SEQ_OFFSET..MAC_OFFSET].try_into().expect("8 bytes"));
        if sequence != index as u64 {
            return Err(EngramError::corrupt(
                "witness chain",
                format!("record {index} has sequence {sequence}"),
            ));
        }
        let expected = shake_mac(&prev_mac, &record[..MAC_OFFSET]);
        if expected[..] != record[MAC_OFFSET..] {
            return Err(EngramError::corrupt(
                "witness chain",
                format!("record {index} fails MAC verification"),
            ));
        }
        prev_mac = expected;
    }
    Ok(())
}
