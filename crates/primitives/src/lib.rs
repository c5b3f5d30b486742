//! Core primitive types shared across the vigil workspace.
//!
//! These are the canonical representations of L2 execution positions
//! ([`GlobalState`]), inbox messages and sequencer batches. Everything here is
//! plain data: no I/O, no collaborators.

mod global_state;
pub use global_state::{machine_finished_hash, GlobalState, MachineStatus, MessageIndex};

mod message;
pub use message::{BatchInfo, L1IncomingMessage, L1IncomingMessageHeader, MessageWithMetadata};
