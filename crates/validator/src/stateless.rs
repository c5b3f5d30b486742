//! The stateless core shared by the pipeline and the challenge state
//! provider: position arithmetic, batch reads and ready-entry construction.

use std::sync::{Arc, Mutex};

use alloy_primitives::{Bytes, B256};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vigil_executor::ValidationSpawner;
use vigil_primitives::{GlobalState, MessageIndex};

use crate::{
    BlockValidatorConfig, ExecutionRecorder, InboxError, InboxTracker, KeyValueStore,
    MessageResult, TransactionStreamer, ValidationEntry, ValidatorError,
};

/// A message position expressed in batch coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlobalStatePosition {
    /// Batch the position falls in.
    pub batch_number: u64,
    /// Offset within that batch.
    pub pos_in_batch: u64,
}

/// Combines an execution result with batch coordinates into a global state.
pub fn build_global_state(res: &MessageResult, pos: &GlobalStatePosition) -> GlobalState {
    GlobalState::new(res.block_hash, res.send_root, pos.batch_number, pos.pos_in_batch)
}

#[derive(Debug)]
struct ModuleRoots {
    current: B256,
    pending: Option<B256>,
}

/// Materializes validation entries from the inbox and streamer, without any
/// pipeline state of its own.
#[derive(Debug)]
pub struct StatelessValidator<I, S, R, D> {
    inbox_tracker: Arc<I>,
    streamer: Arc<S>,
    recorder: Arc<R>,
    db: Arc<D>,
    execution_spawner: Arc<dyn ValidationSpawner>,
    validation_spawners: Vec<Arc<dyn ValidationSpawner>>,
    module_roots: Mutex<ModuleRoots>,
    config: Arc<BlockValidatorConfig>,
}

impl<I, S, R, D> StatelessValidator<I, S, R, D>
where
    I: InboxTracker,
    S: TransactionStreamer,
    R: ExecutionRecorder,
    D: KeyValueStore,
{
    /// Creates a stateless validator, resolving the pending upgrade module
    /// root per the configured grammar (`""` disables, `"latest"` queries the
    /// executor, anything else parses as a hash).
    pub async fn new(
        inbox_tracker: Arc<I>,
        streamer: Arc<S>,
        recorder: Arc<R>,
        db: Arc<D>,
        execution_spawner: Arc<dyn ValidationSpawner>,
        validation_spawners: Vec<Arc<dyn ValidationSpawner>>,
        config: Arc<BlockValidatorConfig>,
    ) -> Result<Self, ValidatorError> {
        let pending = match config.pending_upgrade_module_root.as_str() {
            "" => None,
            "latest" => Some(execution_spawner.latest_wasm_module_root().await?),
            raw => {
                let parsed: B256 =
                    raw.parse().map_err(|_| ValidatorError::IllegalModuleRoot)?;
                if parsed.is_zero() {
                    return Err(ValidatorError::IllegalModuleRoot);
                }
                Some(parsed)
            }
        };
        Ok(Self {
            inbox_tracker,
            streamer,
            recorder,
            db,
            execution_spawner,
            validation_spawners,
            module_roots: Mutex::new(ModuleRoots { current: B256::ZERO, pending }),
            config,
        })
    }

    /// The inbox tracker collaborator.
    pub fn inbox_tracker(&self) -> &Arc<I> {
        &self.inbox_tracker
    }

    /// The transaction streamer collaborator.
    pub fn streamer(&self) -> &Arc<S> {
        &self.streamer
    }

    /// The execution recorder collaborator.
    pub fn recorder(&self) -> &Arc<R> {
        &self.recorder
    }

    /// The persistent store collaborator.
    pub fn db(&self) -> &Arc<D> {
        &self.db
    }

    /// The spawner used for execution runs and module-root queries.
    pub fn execution_spawner(&self) -> &Arc<dyn ValidationSpawner> {
        &self.execution_spawner
    }

    /// The spawners validations are fanned out to.
    pub fn validation_spawners(&self) -> &[Arc<dyn ValidationSpawner>] {
        &self.validation_spawners
    }

    /// The pipeline configuration.
    pub fn config(&self) -> &Arc<BlockValidatorConfig> {
        &self.config
    }

    /// The module root currently validated against.
    pub fn current_wasm_module_root(&self) -> B256 {
        self.module_roots.lock().expect("module roots lock poisoned").current
    }

    /// The pending upgrade module root, when one is configured.
    pub fn pending_wasm_module_root(&self) -> Option<B256> {
        self.module_roots.lock().expect("module roots lock poisoned").pending
    }

    /// Overwrites the current module root without upgrade checks. Reserved
    /// for initialization.
    pub(crate) fn force_current_wasm_module_root(&self, root: B256) {
        self.module_roots.lock().expect("module roots lock poisoned").current = root;
    }

    /// Applies an on-chain module root update.
    ///
    /// The zero hash is rejected; an unchanged root is a no-op; progressing
    /// to the pending root is a normal upgrade. Any other value is rejected
    /// when the configured root tracks the chain (`"current"`), and ignored
    /// otherwise.
    pub fn set_current_wasm_module_root(&self, root: B256) -> Result<(), ValidatorError> {
        let mut roots = self.module_roots.lock().expect("module roots lock poisoned");
        if root.is_zero() {
            return Err(ValidatorError::ZeroModuleRoot);
        }
        if roots.current == root {
            return Ok(());
        }
        if roots.current.is_zero() {
            roots.current = root;
            return Ok(());
        }
        if roots.pending == Some(root) {
            tracing::info!(target: "block_validator", %root, "detected progressing to pending machine");
            roots.current = root;
            return Ok(());
        }
        if self.config.current_module_root != "current" {
            return Ok(());
        }
        Err(ValidatorError::UnexpectedModuleRoot {
            found: root,
            current: roots.current,
            pending: roots.pending,
        })
    }

    /// The set of module roots every validation must pass under: the current
    /// root, plus the pending upgrade root when one is set.
    pub fn module_roots_to_validate(&self) -> Vec<B256> {
        let roots = self.module_roots.lock().expect("module roots lock poisoned");
        let mut out = vec![roots.current];
        if let Some(pending) = roots.pending {
            if pending != roots.current {
                out.push(pending);
            }
        }
        out
    }

    /// Resolves a global state to the message count it sits at.
    ///
    /// Returns `Ok(None)` while the local chain has not caught up far enough
    /// to judge, and [`ValidatorError::GlobalStateNotInChain`] when the chain
    /// is caught up but disagrees.
    pub async fn global_state_to_msg_count(
        &self,
        gs: GlobalState,
    ) -> Result<Option<MessageIndex>, ValidatorError> {
        let batch_count = self.inbox_tracker.batch_count().await?;
        if batch_count <= gs.batch {
            return Ok(None);
        }
        let prev_batch_msg_count = if gs.batch > 0 {
            self.inbox_tracker.batch_message_count(gs.batch - 1).await?
        } else {
            0
        };
        let mut count = prev_batch_msg_count;
        if gs.pos_in_batch > 0 {
            let cur_batch_msg_count = self.inbox_tracker.batch_message_count(gs.batch).await?;
            count += gs.pos_in_batch;
            if cur_batch_msg_count < count {
                return Err(ValidatorError::GlobalStateNotInChain(format!(
                    "batch {} posInBatch {}, maxPosInBatch {}",
                    gs.batch,
                    gs.pos_in_batch,
                    cur_batch_msg_count - prev_batch_msg_count
                )));
            }
        }
        let processed = self.streamer.processed_message_count().await?;
        if processed < count {
            return Ok(None);
        }
        let res = self.streamer.result_at_count(count).await?;
        if res.block_hash != gs.block_hash || res.send_root != gs.send_root {
            return Err(ValidatorError::GlobalStateNotInChain(format!(
                "count {count} hash {} expected {}, sendroot {} expected {}",
                gs.block_hash, res.block_hash, gs.send_root, res.send_root
            )));
        }
        Ok(Some(count))
    }

    /// Finds the batch containing message `pos` by binary search over the
    /// inbox's batch message counts.
    async fn find_batch_containing_message(
        &self,
        pos: MessageIndex,
    ) -> Result<u64, ValidatorError> {
        let batch_count = self.inbox_tracker.batch_count().await?;
        if batch_count == 0 {
            return Err(ValidatorError::GlobalStateNotInChain(
                "no batches in local inbox view".into(),
            ));
        }
        let (mut low, mut high) = (0u64, batch_count - 1);
        while low < high {
            let mid = (low + high) / 2;
            match self.inbox_tracker.batch_message_count(mid).await {
                Ok(count) if count > pos => high = mid,
                Ok(_) => low = mid + 1,
                Err(InboxError::AccumulatorNotFound(_)) => high = mid,
                Err(err) => return Err(err.into()),
            }
        }
        if self.inbox_tracker.batch_message_count(low).await? <= pos {
            return Err(ValidatorError::GlobalStateNotInChain(format!(
                "message {pos} beyond all {batch_count} batches"
            )));
        }
        Ok(low)
    }

    /// Maps a message count to the start and end batch positions of the
    /// message it crosses (message `count - 1`).
    pub async fn global_state_positions_at_count(
        &self,
        count: MessageIndex,
    ) -> Result<(GlobalStatePosition, GlobalStatePosition), ValidatorError> {
        let batch = self.find_batch_containing_message(count - 1).await?;
        let prev_count = if batch > 0 {
            self.inbox_tracker.batch_message_count(batch - 1).await?
        } else {
            0
        };
        let cur_count = self.inbox_tracker.batch_message_count(batch).await?;
        if count - 1 < prev_count {
            return Err(ValidatorError::GlobalStateNotInChain(format!(
                "batch {batch} starts at {prev_count}, after message count {count}"
            )));
        }
        let start =
            GlobalStatePosition { batch_number: batch, pos_in_batch: count - 1 - prev_count };
        let end = if count < cur_count {
            GlobalStatePosition { batch_number: batch, pos_in_batch: count - prev_count }
        } else {
            GlobalStatePosition { batch_number: batch + 1, pos_in_batch: 0 }
        };
        Ok((start, end))
    }

    /// Reads the sequencer batch `batch_num`, returning `None` while the
    /// inbox has not seen it yet.
    pub async fn read_batch(
        &self,
        batch_num: u64,
    ) -> Result<Option<(Bytes, MessageIndex)>, ValidatorError> {
        let batch_count = self.inbox_tracker.batch_count().await?;
        if batch_count <= batch_num {
            return Ok(None);
        }
        let msg_count = self.inbox_tracker.batch_message_count(batch_num).await?;
        let bytes = self.inbox_tracker.sequencer_message_bytes(batch_num).await?;
        Ok(Some((bytes, msg_count)))
    }

    /// Builds a fully recorded validation entry for message `pos`, ready to
    /// be turned into a replay input.
    pub async fn create_ready_validation_entry(
        &self,
        pos: MessageIndex,
        cancel: &CancellationToken,
    ) -> Result<ValidationEntry, ValidatorError> {
        if pos == 0 {
            return Err(ValidatorError::Other("genesis message cannot be validated".into()));
        }
        let msg = self.streamer.get_message(pos).await?;
        let prev_delayed = self.streamer.get_message(pos - 1).await?.delayed_messages_read;
        let (start_pos, end_pos) = self.global_state_positions_at_count(pos + 1).await?;
        let start_res = self.streamer.result_at_count(pos).await?;
        let end_res = self.streamer.result_at_count(pos + 1).await?;
        let start = build_global_state(&start_res, &start_pos);
        let end = build_global_state(&end_res, &end_pos);
        let Some((batch_bytes, _)) = self.read_batch(start_pos.batch_number).await? else {
            return Err(ValidatorError::Other(format!(
                "batch {} not yet available for message {pos}",
                start_pos.batch_number
            )));
        };
        let entry = ValidationEntry::new(pos, start, end, msg.clone(), batch_bytes, prev_delayed)?;
        debug!(target: "block_validator", pos, "recording validation entry");
        let record = self.recorder.record_block_creation(pos, msg).wait(cancel).await?;
        entry.record(record)?;
        Ok(entry)
    }
}
