//! Merkle tree over source content hashes.
//!
//! Leaves are SHA-256 digests; internal nodes hash the concatenation of
//! their children. An odd node at any level is paired with itself. Each
//! leaf gets an inclusion proof (sibling hash + side per level) that
//! recomputes to the root.

use sha2::{Digest, Sha256};

/// A 32-byte digest
pub type Hash32 = [u8; 32];

/// SHA-256 of arbitrary bytes
pub fn sha256(data: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// One step of an inclusion proof
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProofStep {
    /// Sibling digest, hex
    pub sibling: String,
    /// True when the sibling sits to the left of the running hash
    pub sibling_is_left: bool,
}

/// Inclusion proof for one leaf
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MerkleProof {
    /// Index of the proven leaf
    pub leaf_index: usize,
    /// Bottom-up proof steps
    pub steps: Vec<ProofStep>,
}

fn parent(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Root over the given leaves; `None` for an empty slice
pub fn merkle_root(leaves: &[Hash32]) -> Option<Hash32> {
    if leaves.is_empty() {
        return None;
    }
    let mut level: Vec<Hash32> = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| parent(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
    }
    Some(level[0])
}

/// Inclusion proofs for every leaf, in leaf order
pub fn merkle_proofs(leaves: &[Hash32]) -> Vec<MerkleProof> {
    let mut proofs: Vec<MerkleProof> = (0..leaves.len())
        .map(|leaf_index| MerkleProof {
            leaf_index,
            steps: Vec::new(),
        })
        .collect();
    if leaves.len() <= 1 {
        return proofs;
    }

    let mut level: Vec<Hash32> = leaves.to_vec();
    // Which proof each running position belongs to
    let mut owners: Vec<Vec<usize>> = (0..leaves.len()).map(|i| vec![i]).collect();

    while level.len() > 1 {
        let mut next_level = Vec::with_capacity(level.len().div_ceil(2));
        let mut next_owners = Vec::with_capacity(level.len().div_ceil(2));
        for pair_start in (0..level.len()).step_by(2) {
            let left = level[pair_start];
            let right = *level.get(pair_start + 1).unwrap_or(&left);
            for owner in &owners[pair_start] {
                proofs[*owner].steps.push(ProofStep {
                    sibling: hex::encode(right),
                    sibling_is_left: false,
                });
            }
            let mut merged = owners[pair_start].clone();
            if pair_start + 1 < level.len() {
                for owner in &owners[pair_start + 1] {
                    proofs[*owner].steps.push(ProofStep {
                        sibling: hex::encode(left),
                        sibling_is_left: true,
                    });
                }
                merged.extend(owners[pair_start + 1].iter().copied());
            }
            next_level.push(parent(&left, &right));
            next_owners.push(merged);
        }
        level = next_level;
        owners = next_owners;
    }
    proofs
}

/// Recompute a proof from a leaf digest and compare against the root
pub fn verify_proof(leaf: &Hash32, proof: &MerkleProof, root: &Hash32) -> bool {
    let mut running = *leaf;
    for step in &proof.steps {
        let Ok(sibling_bytes) = hex::decode(&step.sibling) else {
            return false;
        };
        let Ok(sibling) = Hash32::try_from(sibling_bytes.as_slice()) else {
            return false;
        };
        running = if step.sibling_is_left {
            parent(&sibling, &running)
        } else {
            parent(&running, &sibling)
        };
    }
    running == *root
}
