//! Merkle expansions and prefix proofs.
//!
//! An expansion is the complete-subtree decomposition of a leaf sequence:
//! entry `i` is the root of an aligned subtree of `2^i` leaves, or zero when
//! the sequence's binary decomposition has no term of that size. Expansions
//! fold to the same root as [`Merkle`](crate::Merkle) over the same leaves,
//! which is what lets a verifier extend a committed prefix to a committed
//! total without seeing the leaves themselves.

use alloy_primitives::B256;
use thiserror::Error;

use crate::merkle::{empty_hash_at, hash_node, Merkle, MAX_LEVELS};

/// Complete-subtree decomposition of a leaf sequence, lowest level first.
pub type MerkleExpansion = Vec<B256>;

/// An error from expansion or prefix-proof handling.
#[derive(Debug, Clone, Error)]
pub enum ProofError {
    /// An empty sequence cannot be committed to.
    #[error("empty sequence cannot be committed")]
    EmptyLeaves,
    /// The requested prefix does not fit the leaf sequence.
    #[error("prefix size {prefix} out of range for {total} leaves")]
    BadPrefix {
        /// Claimed prefix size.
        prefix: u64,
        /// Total number of leaves.
        total: u64,
    },
    /// A subtree was appended below the expansion's least-significant entry.
    #[error("cannot append complete subtree at occupied level {0}")]
    AppendUnaligned(usize),
    /// The expansion exceeds the supported depth.
    #[error("expansion exceeds {MAX_LEVELS} levels")]
    TooDeep,
    /// The proof does not connect the prefix to the total commitment.
    #[error("prefix proof verification failed")]
    Invalid,
}

/// Root of a complete (power-of-two) chunk of leaves.
fn subtree_root(leaves: &[B256]) -> B256 {
    Merkle::new(leaves.to_vec()).root()
}

fn prev_power_of_two(n: usize) -> usize {
    1 << (usize::BITS - 1 - n.leading_zeros())
}

/// Decomposes `leaves` into its expansion.
pub fn expansion_from_leaves(leaves: &[B256]) -> MerkleExpansion {
    let n = leaves.len();
    if n == 0 {
        return Vec::new();
    }
    let levels = usize::BITS as usize - n.leading_zeros() as usize;
    let mut expansion = vec![B256::ZERO; levels];
    let mut offset = 0;
    for level in (0..levels).rev() {
        let size = 1usize << level;
        if n & size != 0 {
            expansion[level] = subtree_root(&leaves[offset..offset + size]);
            offset += size;
        }
    }
    expansion
}

/// Number of leaves an expansion commits to.
pub fn expansion_size(expansion: &[B256]) -> u64 {
    expansion
        .iter()
        .enumerate()
        .filter(|(_, hash)| !hash.is_zero())
        .map(|(level, _)| 1u64 << level)
        .sum()
}

/// Folds an expansion to its root, padding partial subtrees with the
/// per-level empty hashes so the result matches the padded binary tree over
/// the same leaves.
pub fn expansion_root(expansion: &[B256]) -> B256 {
    let mut accum: Option<(B256, usize)> = None;
    for (level, hash) in expansion.iter().enumerate() {
        if hash.is_zero() {
            continue;
        }
        accum = Some(match accum {
            None => (*hash, level),
            Some((mut acc, mut height)) => {
                while height < level {
                    acc = hash_node(acc, empty_hash_at(height));
                    height += 1;
                }
                (hash_node(*hash, acc), level + 1)
            }
        });
    }
    accum.map_or(B256::ZERO, |(acc, _)| acc)
}

/// Appends a complete subtree root at `level`, carrying merges upward.
pub fn append_complete_subtree(
    expansion: &mut MerkleExpansion,
    level: usize,
    subtree: B256,
) -> Result<(), ProofError> {
    if level >= MAX_LEVELS {
        return Err(ProofError::TooDeep);
    }
    if expansion.iter().take(level).any(|hash| !hash.is_zero()) {
        return Err(ProofError::AppendUnaligned(level));
    }
    let mut accum = subtree;
    let mut i = level;
    loop {
        if i == expansion.len() {
            expansion.push(accum);
            return Ok(());
        }
        if expansion[i].is_zero() {
            expansion[i] = accum;
            return Ok(());
        }
        accum = hash_node(expansion[i], accum);
        expansion[i] = B256::ZERO;
        i += 1;
    }
}

/// Appends a single leaf to an expansion.
pub fn append_leaf(expansion: &mut MerkleExpansion, leaf: B256) -> Result<(), ProofError> {
    append_complete_subtree(expansion, 0, leaf)
}

/// Sizes of the aligned complete subtrees covering `[prefix, total)`.
fn suffix_chunks(prefix: usize, total: usize) -> Vec<usize> {
    let mut chunks = Vec::new();
    let mut idx = prefix;
    while idx < total {
        let align = 1usize << (idx.trailing_zeros().min(usize::BITS - 1));
        let size = align.min(prev_power_of_two(total - idx));
        chunks.push(size);
        idx += size;
    }
    chunks
}

/// Produces the subtree roots a verifier needs to extend a commitment to
/// `leaves[..prefix_size]` into one over all of `leaves`.
pub fn generate_prefix_proof(
    prefix_size: usize,
    leaves: &[B256],
) -> Result<Vec<B256>, ProofError> {
    if prefix_size == 0 || prefix_size > leaves.len() {
        return Err(ProofError::BadPrefix {
            prefix: prefix_size as u64,
            total: leaves.len() as u64,
        });
    }
    let mut proof = Vec::new();
    let mut idx = prefix_size;
    for size in suffix_chunks(prefix_size, leaves.len()) {
        proof.push(subtree_root(&leaves[idx..idx + size]));
        idx += size;
    }
    Ok(proof)
}

/// Checks that `proof` extends the prefix commitment (`pre_root`,
/// `pre_size`, `pre_expansion`) into the total commitment (`post_root`,
/// `post_size`).
pub fn verify_prefix_proof(
    pre_root: B256,
    pre_size: u64,
    post_root: B256,
    post_size: u64,
    pre_expansion: &[B256],
    proof: &[B256],
) -> Result<(), ProofError> {
    if pre_size == 0 || post_size < pre_size {
        return Err(ProofError::BadPrefix { prefix: pre_size, total: post_size });
    }
    if expansion_size(pre_expansion) != pre_size || expansion_root(pre_expansion) != pre_root {
        return Err(ProofError::Invalid);
    }
    let chunks = suffix_chunks(pre_size as usize, post_size as usize);
    if chunks.len() != proof.len() {
        return Err(ProofError::Invalid);
    }
    let mut expansion = pre_expansion.to_vec();
    for (size, subtree) in chunks.into_iter().zip(proof) {
        append_complete_subtree(&mut expansion, size.trailing_zeros() as usize, *subtree)?;
    }
    if expansion_root(&expansion) != post_root {
        return Err(ProofError::Invalid);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::keccak256;

    fn leaves(n: u64) -> Vec<B256> {
        (0..n).map(|i| keccak256(i.to_be_bytes())).collect()
    }

    #[test]
    fn expansion_root_matches_tree_root() {
        for n in [1u64, 2, 3, 4, 5, 7, 8, 9, 16, 17, 31] {
            let ls = leaves(n);
            let expansion = expansion_from_leaves(&ls);
            assert_eq!(expansion_size(&expansion), n);
            assert_eq!(expansion_root(&expansion), Merkle::new(ls).root(), "n={n}");
        }
    }

    #[test]
    fn appending_leaves_reproduces_the_expansion() {
        let ls = leaves(11);
        let mut expansion = MerkleExpansion::new();
        for leaf in &ls {
            append_leaf(&mut expansion, *leaf).unwrap();
        }
        assert_eq!(expansion, expansion_from_leaves(&ls));
    }

    #[test]
    fn append_below_occupied_level_is_rejected() {
        let mut expansion = expansion_from_leaves(&leaves(3));
        // Level 0 and 1 are occupied; appending a 4-leaf subtree is fine,
        // but only after the carry clears the lower levels.
        assert!(matches!(
            append_complete_subtree(&mut expansion.clone(), 2, B256::repeat_byte(1)),
            Err(ProofError::AppendUnaligned(2))
        ));
        append_leaf(&mut expansion, B256::repeat_byte(2)).unwrap();
        append_complete_subtree(&mut expansion, 2, B256::repeat_byte(1)).unwrap();
        assert_eq!(expansion_size(&expansion), 8);
    }

    #[test]
    fn prefix_proofs_verify_across_sizes() {
        let ls = leaves(33);
        for prefix in [1usize, 2, 3, 5, 8, 16, 17, 32, 33] {
            let pre = expansion_from_leaves(&ls[..prefix]);
            let proof = generate_prefix_proof(prefix, &ls).unwrap();
            verify_prefix_proof(
                expansion_root(&pre),
                prefix as u64,
                Merkle::new(ls.clone()).root(),
                ls.len() as u64,
                &pre,
                &proof,
            )
            .unwrap_or_else(|err| panic!("prefix {prefix}: {err}"));
        }
    }

    #[test]
    fn tampered_prefix_proof_fails() {
        let ls = leaves(20);
        let prefix = 7;
        let pre = expansion_from_leaves(&ls[..prefix]);
        let mut proof = generate_prefix_proof(prefix, &ls).unwrap();
        proof[0] = keccak256(b"tampered");
        assert!(matches!(
            verify_prefix_proof(
                expansion_root(&pre),
                prefix as u64,
                Merkle::new(ls.clone()).root(),
                ls.len() as u64,
                &pre,
                &proof,
            ),
            Err(ProofError::Invalid)
        ));
    }

    #[test]
    fn zero_prefix_is_rejected() {
        assert!(generate_prefix_proof(0, &leaves(4)).is_err());
        assert!(generate_prefix_proof(5, &leaves(4)).is_err());
    }
}
