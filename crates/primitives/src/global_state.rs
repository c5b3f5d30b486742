//! The canonical pointer into L2 history and its hashing rules.

use alloy_primitives::{keccak256, B256};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};

/// A monotonically increasing counter over all sequenced messages.
///
/// Message 0 is the genesis sentinel and is never validated.
pub type MessageIndex = u64;

/// A canonical pointer into the L2 history.
///
/// For a given `(batch, pos_in_batch)`, any two valid global states agree on
/// `(block_hash, send_root)`. Genesis is `(h0, r0, 1, 0)`.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    RlpEncodable,
    RlpDecodable,
    Serialize,
    Deserialize,
)]
pub struct GlobalState {
    /// Hash of the L2 block this state points at.
    pub block_hash: B256,
    /// Root of the outgoing (L2 -> L1) send accumulator at this state.
    pub send_root: B256,
    /// The sequencer batch the pointed-at message belongs to.
    pub batch: u64,
    /// Position of the message within `batch`.
    pub pos_in_batch: u64,
}

impl GlobalState {
    /// Creates a new global state.
    pub const fn new(block_hash: B256, send_root: B256, batch: u64, pos_in_batch: u64) -> Self {
        Self { block_hash, send_root, batch, pos_in_batch }
    }

    /// Commitment to the full global state.
    ///
    /// The preimage is the tagged canonical encoding, with batch and position
    /// serialized big-endian.
    pub fn hash(&self) -> B256 {
        let mut buf = Vec::with_capacity(13 + 32 + 32 + 8 + 8);
        buf.extend_from_slice(b"Global state:");
        buf.extend_from_slice(self.block_hash.as_slice());
        buf.extend_from_slice(self.send_root.as_slice());
        buf.extend_from_slice(&self.batch.to_be_bytes());
        buf.extend_from_slice(&self.pos_in_batch.to_be_bytes());
        keccak256(buf)
    }
}

/// Hash committing to a machine that halted in `state`.
///
/// This is the leaf format of block-level history commitments and must match
/// the root the replay machine itself emits on termination.
pub fn machine_finished_hash(state: &GlobalState) -> B256 {
    let mut buf = Vec::with_capacity(17 + 32);
    buf.extend_from_slice(b"Machine finished:");
    buf.extend_from_slice(state.hash().as_slice());
    keccak256(buf)
}

/// Execution status of a deterministic replay machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineStatus {
    /// The machine has more steps to execute.
    #[default]
    Running,
    /// The machine halted cleanly; its global state is final.
    Finished,
    /// The machine trapped. A trapped machine has no useful global state.
    Errored,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::b256;

    #[test]
    fn global_state_hash_is_tagged_and_positional() {
        let gs = GlobalState::new(
            b256!("1111111111111111111111111111111111111111111111111111111111111111"),
            b256!("2222222222222222222222222222222222222222222222222222222222222222"),
            3,
            7,
        );
        let mut preimage = Vec::new();
        preimage.extend_from_slice(b"Global state:");
        preimage.extend_from_slice(gs.block_hash.as_slice());
        preimage.extend_from_slice(gs.send_root.as_slice());
        preimage.extend_from_slice(&3u64.to_be_bytes());
        preimage.extend_from_slice(&7u64.to_be_bytes());
        assert_eq!(gs.hash(), keccak256(preimage));

        // Swapping batch and position must change the hash.
        let swapped = GlobalState::new(gs.block_hash, gs.send_root, 7, 3);
        assert_ne!(gs.hash(), swapped.hash());
    }

    #[test]
    fn machine_finished_hash_commits_to_state_hash() {
        let gs = GlobalState::new(B256::ZERO, B256::ZERO, 1, 0);
        let mut preimage = Vec::new();
        preimage.extend_from_slice(b"Machine finished:");
        preimage.extend_from_slice(gs.hash().as_slice());
        assert_eq!(machine_finished_hash(&gs), keccak256(preimage));
    }

    #[test]
    fn rlp_roundtrip() {
        let gs = GlobalState::new(
            b256!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
            b256!("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"),
            12,
            5,
        );
        let encoded = alloy_rlp::encode(gs);
        let decoded: GlobalState = alloy_rlp::decode_exact(&encoded).unwrap();
        assert_eq!(gs, decoded);
    }
}
