//! The pipeline-wide error type.

use alloy_primitives::B256;
use thiserror::Error;
use vigil_primitives::{GlobalState, MessageIndex};
use vigil_util::PromiseError;

use crate::{EntryError, InboxError, StoreError, StreamerError, ValidationStatusKind};

/// An error from the block validator or its stateless core.
///
/// Cloneable so the same error can be logged, published to the fatal channel
/// and returned to the caller.
#[derive(Debug, Clone, Error)]
pub enum ValidatorError {
    /// An error from the inbox tracker.
    #[error(transparent)]
    Inbox(#[from] InboxError),
    /// An error from the transaction streamer.
    #[error(transparent)]
    Streamer(#[from] StreamerError),
    /// An error from the persistent store.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// An error from a validation entry.
    #[error(transparent)]
    Entry(#[from] EntryError),
    /// An error from an awaited collaborator future.
    #[error(transparent)]
    Promise(#[from] PromiseError),
    /// An error from a validation spawner.
    #[error("spawner: {0}")]
    Spawner(String),
    /// The persisted last-validated record could not be decoded.
    #[error("corrupt last-validated record: {0}")]
    Persist(String),
    /// A global state the chain view should contain is missing from it.
    #[error("global state not in chain: {0}")]
    GlobalStateNotInChain(String),
    /// The last-valid state was never initialized.
    #[error("last-valid state not initialized, cannot validate genesis")]
    LastValidUninitialized,
    /// Module root configured as `current` but never injected from chain.
    #[error("wasm module root set to 'current' but no root was injected from chain")]
    CurrentRootUnset,
    /// The configured module root string is not usable.
    #[error("current-module-root config value illegal")]
    IllegalModuleRoot,
    /// The zero hash is not a valid module root.
    #[error("cannot set zero as wasm module root")]
    ZeroModuleRoot,
    /// An on-chain module root update does not match any known root.
    #[error("unexpected wasm module root {found}, current {current}, pending {pending:?}")]
    UnexpectedModuleRoot {
        /// Root reported from chain.
        found: B256,
        /// Root currently validated against.
        current: B256,
        /// Pending upgrade root, when configured.
        pending: Option<B256>,
    },
    /// Genesis cannot be reorged out.
    #[error("cannot reorg out genesis")]
    ReorgOutGenesis,
    /// Lifecycle method called in the wrong state.
    #[error("block validator already started")]
    AlreadyStarted,
    /// No validation entry exists for a position the cursors cover.
    #[error("no validation entry found for message {0}")]
    MissingEntry(MessageIndex),
    /// An entry was found in a status the operation cannot act on.
    #[error("bad status for message {pos}: {kind}")]
    UnexpectedStatus {
        /// Message position of the entry.
        pos: MessageIndex,
        /// Status the entry was found in.
        kind: ValidationStatusKind,
    },
    /// The batch message count contradicts the creation cursor.
    #[error("illegal batch message count {count} for message {pos} batch {batch}")]
    IllegalBatchCount {
        /// Claimed message count of the batch.
        count: MessageIndex,
        /// Message being created.
        pos: MessageIndex,
        /// Batch being read.
        batch: u64,
    },
    /// A replay produced a different end state than the chain.
    #[error("validation failed: expected {expected:?} got {got:?}")]
    Mismatch {
        /// End state the chain asserts.
        expected: GlobalState,
        /// End state the replay produced.
        got: GlobalState,
    },
    /// Any other pipeline failure.
    #[error("{0}")]
    Other(String),
}

impl From<vigil_executor::SpawnerError> for ValidatorError {
    fn from(err: vigil_executor::SpawnerError) -> Self {
        Self::Spawner(err.to_string())
    }
}
