//! Multi-level history commitments and the fraud-proof state provider.
//!
//! When an assertion is challenged on-chain, the protocol bisects over three
//! levels of history commitments — block, big-step and small-step — down to a
//! single disputed VM opcode, which is then settled with a one-step proof.
//! The [`StateManager`] builds those commitments from the validator's view of
//! the chain and the replay machine, caching expensive step-hash arrays on
//! disk in the [`HistoryCache`].

mod merkle;
pub use merkle::{hash_node, verify_proof, Merkle};

mod prefix;
pub use prefix::{
    append_complete_subtree, append_leaf, expansion_from_leaves, expansion_root, expansion_size,
    generate_prefix_proof, verify_prefix_proof, MerkleExpansion, ProofError,
};

mod commitment;
pub use commitment::{last_leaf_proof, HistoryCommitment};

mod cache;
pub use cache::{HeightRange, HistoryCache, HistoryCacheError, Key};

mod manager;
pub use manager::{
    ExecutionState, HashCollectorConfig, OneStepData, OneStepProofBundle, StateManager,
    StateProviderError,
};
