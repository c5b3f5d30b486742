//! History commitments over per-step machine hashes.

use alloy_primitives::B256;

use crate::{expansion_from_leaves, expansion_root, Merkle, ProofError};

/// A Merkle commitment to a sequence of machine state hashes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryCommitment {
    /// Height of the commitment: one less than the number of leaves.
    pub height: u64,
    /// Merkle root over the leaf sequence.
    pub merkle: B256,
    /// The first committed leaf.
    pub first_leaf: B256,
    /// The last committed leaf.
    pub last_leaf: B256,
}

impl HistoryCommitment {
    /// Commits to `leaves`.
    pub fn new(leaves: &[B256]) -> Result<Self, ProofError> {
        let (first, last) = match (leaves.first(), leaves.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Err(ProofError::EmptyLeaves),
        };
        Ok(Self {
            height: leaves.len() as u64 - 1,
            merkle: expansion_root(&expansion_from_leaves(leaves)),
            first_leaf: first,
            last_leaf: last,
        })
    }
}

/// Inclusion proof of the final leaf, verifiable against the commitment's
/// Merkle root.
pub fn last_leaf_proof(leaves: &[B256]) -> Vec<B256> {
    let tree = Merkle::new(leaves.to_vec());
    tree.prove(leaves.len().saturating_sub(1)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify_proof;
    use alloy_primitives::keccak256;

    fn leaves(n: u64) -> Vec<B256> {
        (0..n).map(|i| keccak256(i.to_be_bytes())).collect()
    }

    #[test]
    fn commitment_carries_boundary_leaves() {
        let ls = leaves(9);
        let commitment = HistoryCommitment::new(&ls).unwrap();
        assert_eq!(commitment.height, 8);
        assert_eq!(commitment.first_leaf, ls[0]);
        assert_eq!(commitment.last_leaf, ls[8]);
        assert!(HistoryCommitment::new(&[]).is_err());
    }

    #[test]
    fn last_leaf_proof_verifies_against_commitment_root() {
        for n in [1u64, 2, 5, 16, 17] {
            let ls = leaves(n);
            let commitment = HistoryCommitment::new(&ls).unwrap();
            let proof = last_leaf_proof(&ls);
            assert!(
                verify_proof(commitment.merkle, commitment.last_leaf, ls.len() - 1, &proof),
                "n={n}"
            );
        }
    }
}
