//! A keccak binary Merkle tree with per-level empty-hash padding.
//!
//! Layers with an odd node count are padded on the right with the level's
//! empty hash (`empty[0] = 0x0`, `empty[i+1] = H(empty[i] ‖ empty[i])`), so a
//! tree over any leaf count has a well-defined root that agrees with the
//! Merkle-expansion fold in [`crate::expansion_root`].

use std::sync::OnceLock;

use alloy_primitives::{keccak256, B256};

/// Deepest supported tree.
pub(crate) const MAX_LEVELS: usize = 64;

static EMPTY_HASHES: OnceLock<[B256; MAX_LEVELS]> = OnceLock::new();

/// The hash standing in for a missing subtree at `level`.
pub(crate) fn empty_hash_at(level: usize) -> B256 {
    let ladder = EMPTY_HASHES.get_or_init(|| {
        let mut out = [B256::ZERO; MAX_LEVELS];
        for i in 1..MAX_LEVELS {
            out[i] = hash_node(out[i - 1], out[i - 1]);
        }
        out
    });
    ladder[level]
}

/// Hashes two sibling nodes into their parent.
pub fn hash_node(left: B256, right: B256) -> B256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_slice());
    buf[32..].copy_from_slice(right.as_slice());
    keccak256(buf)
}

/// A Merkle tree over a leaf sequence. The tree does not grow; it exists to
/// answer root and inclusion-proof queries over a fixed snapshot.
#[derive(Clone, Debug, Default)]
pub struct Merkle {
    /// `layers[0]` are the leaves; each higher layer halves (rounding up).
    layers: Vec<Vec<B256>>,
}

impl Merkle {
    /// Builds a tree over `leaves`.
    pub fn new(leaves: Vec<B256>) -> Self {
        if leaves.is_empty() {
            return Self::default();
        }
        let mut layers = vec![leaves];
        let mut level = 0;
        while layers[layers.len() - 1].len() > 1 {
            let current = &layers[layers.len() - 1];
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                let right = if pair.len() == 2 { pair[1] } else { empty_hash_at(level) };
                next.push(hash_node(pair[0], right));
            }
            layers.push(next);
            level += 1;
        }
        Self { layers }
    }

    /// Number of leaves.
    pub fn len(&self) -> usize {
        self.layers.first().map_or(0, Vec::len)
    }

    /// True for the empty tree.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// The tree root. The empty tree's root is the zero hash.
    pub fn root(&self) -> B256 {
        self.layers.last().map_or(B256::ZERO, |top| top[0])
    }

    /// Sibling path proving inclusion of leaf `index`, or `None` when out of
    /// bounds.
    pub fn prove(&self, index: usize) -> Option<Vec<B256>> {
        if index >= self.len() {
            return None;
        }
        let mut proof = Vec::with_capacity(self.layers.len().saturating_sub(1));
        let mut idx = index;
        for (level, layer) in self.layers.iter().enumerate().take(self.layers.len() - 1) {
            let sibling = idx ^ 1;
            proof.push(if sibling < layer.len() { layer[sibling] } else { empty_hash_at(level) });
            idx >>= 1;
        }
        Some(proof)
    }
}

/// Recomputes a root from `leaf` at `index` and its sibling path.
pub fn verify_proof(root: B256, leaf: B256, index: usize, proof: &[B256]) -> bool {
    let mut accum = leaf;
    let mut idx = index;
    for sibling in proof {
        accum = if idx & 1 == 0 { hash_node(accum, *sibling) } else { hash_node(*sibling, accum) };
        idx >>= 1;
    }
    idx == 0 && accum == root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: u64) -> Vec<B256> {
        (0..n).map(|i| keccak256(i.to_be_bytes())).collect()
    }

    #[test]
    fn single_leaf_root_is_the_leaf() {
        let tree = Merkle::new(leaves(1));
        assert_eq!(tree.root(), leaves(1)[0]);
        assert_eq!(tree.prove(0), Some(vec![]));
    }

    #[test]
    fn odd_layer_pads_with_empty_hashes() {
        let ls = leaves(5);
        let tree = Merkle::new(ls.clone());
        let left = hash_node(hash_node(ls[0], ls[1]), hash_node(ls[2], ls[3]));
        let right = hash_node(hash_node(ls[4], empty_hash_at(0)), empty_hash_at(1));
        assert_eq!(tree.root(), hash_node(left, right));
    }

    #[test]
    fn every_leaf_proves_against_the_root() {
        for n in [1u64, 2, 3, 5, 8, 13, 17] {
            let ls = leaves(n);
            let tree = Merkle::new(ls.clone());
            for (i, leaf) in ls.iter().enumerate() {
                let proof = tree.prove(i).unwrap();
                assert!(verify_proof(tree.root(), *leaf, i, &proof), "n={n} i={i}");
            }
        }
    }

    #[test]
    fn wrong_leaf_fails_verification() {
        let ls = leaves(8);
        let tree = Merkle::new(ls.clone());
        let proof = tree.prove(3).unwrap();
        assert!(!verify_proof(tree.root(), ls[4], 3, &proof));
        assert!(!verify_proof(tree.root(), ls[3], 4, &proof));
    }

    #[test]
    fn prove_out_of_bounds_is_none() {
        assert!(Merkle::new(leaves(4)).prove(4).is_none());
        assert!(Merkle::new(vec![]).prove(0).is_none());
    }
}
