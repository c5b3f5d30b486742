//! Capability traits for the pipeline's external collaborators.
//!
//! The validator never talks to L1, the database or the execution engine
//! directly; everything arrives through these seams so the pipeline can be
//! exercised against in-memory doubles.

use std::collections::HashMap;

use alloy_primitives::{Bytes, B256};
use async_trait::async_trait;
use thiserror::Error;
use vigil_primitives::{BatchInfo, MessageIndex, MessageWithMetadata};
use vigil_util::Promise;

/// An error from the inbox tracker.
#[derive(Debug, Clone, Error)]
pub enum InboxError {
    /// The queried batch is beyond the local view of the inbox.
    ///
    /// Stable: callers match on this variant to distinguish "not yet seen"
    /// from real failures.
    #[error("accumulator not found: batch {0}")]
    AccumulatorNotFound(u64),
    /// Any other tracker failure.
    #[error("inbox tracker: {0}")]
    Other(String),
}

/// Read access to sequencer batch bookkeeping.
#[async_trait]
pub trait InboxTracker: Send + Sync + 'static {
    /// Number of sequencer batches known locally.
    async fn batch_count(&self) -> Result<u64, InboxError>;

    /// Total message count after `batch`, i.e. the index one past its last
    /// message.
    async fn batch_message_count(&self, batch: u64) -> Result<MessageIndex, InboxError>;

    /// Raw sequencer message bytes for `batch`.
    async fn sequencer_message_bytes(&self, batch: u64) -> Result<Bytes, InboxError>;
}

/// An error from the transaction streamer.
#[derive(Debug, Clone, Error)]
pub enum StreamerError {
    /// The requested message count has not been processed yet.
    #[error("message count {0} not yet processed")]
    NotProcessed(MessageIndex),
    /// Any other streamer failure.
    #[error("streamer: {0}")]
    Other(String),
}

/// The execution result the streamer exposes for a message count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageResult {
    /// Block hash after that many messages.
    pub block_hash: B256,
    /// Send root after that many messages.
    pub send_root: B256,
}

/// Read access to the sequenced message stream and its execution results.
#[async_trait]
pub trait TransactionStreamer: Send + Sync + 'static {
    /// Execution result after `count` messages.
    async fn result_at_count(&self, count: MessageIndex) -> Result<MessageResult, StreamerError>;

    /// The message at `index`.
    async fn get_message(&self, index: MessageIndex) -> Result<MessageWithMetadata, StreamerError>;

    /// Number of messages processed so far.
    async fn processed_message_count(&self) -> Result<MessageIndex, StreamerError>;
}

/// Everything recorded for one block creation, sufficient for replay.
#[derive(Clone, Debug, Default)]
pub struct RecordResult {
    /// Message position that was recorded.
    pub pos: MessageIndex,
    /// Block hash produced at that position.
    pub block_hash: B256,
    /// Preimages touched while re-executing the block.
    pub preimages: HashMap<B256, Bytes>,
    /// Additional batches the replay needs.
    pub batch_info: Vec<BatchInfo>,
}

/// The execution engine's recording surface.
pub trait ExecutionRecorder: Send + Sync + 'static {
    /// Re-executes the message at `pos`, capturing all touched preimages.
    fn record_block_creation(
        &self,
        pos: MessageIndex,
        msg: MessageWithMetadata,
    ) -> Promise<RecordResult>;

    /// Tells the engine `pos` was validated so recording state can be pruned.
    fn mark_valid(&self, pos: MessageIndex, result_hash: B256);

    /// Asks the engine to keep `[start, end]` available for recording.
    fn prepare_for_record(&self, start: MessageIndex, end: MessageIndex) -> Promise<()>;
}

/// An error from the persistent key-value store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Any backend failure.
    #[error("store: {0}")]
    Backend(String),
}

/// Minimal persistent key-value capability the validator needs.
pub trait KeyValueStore: Send + Sync + 'static {
    /// Whether `key` exists.
    fn has(&self, key: &[u8]) -> Result<bool, StoreError>;

    /// Reads `key`.
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError>;

    /// Writes `key`.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
}
