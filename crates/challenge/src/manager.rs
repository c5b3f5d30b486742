//! The state-provider surface consumed by the on-chain challenge manager.

use std::sync::Arc;

use alloy_primitives::{Bytes, B256};
use alloy_sol_types::SolValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vigil_executor::ExecutionRun;
use vigil_primitives::{machine_finished_hash, GlobalState, MachineStatus};
use vigil_util::PromiseError;
use vigil_validator::{
    ExecutionRecorder, InboxError, InboxTracker, KeyValueStore, StatelessValidator,
    TransactionStreamer, ValidatorError,
};

use crate::{
    expansion_from_leaves, generate_prefix_proof, last_leaf_proof, HeightRange, HistoryCache,
    HistoryCacheError, HistoryCommitment, Key, ProofError,
};

/// An execution state as asserted to the challenge protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionState {
    /// The asserted global state.
    pub global_state: GlobalState,
    /// Machine status the assertion claims.
    pub machine_status: MachineStatus,
}

/// An error from the state provider.
#[derive(Debug, Error)]
pub enum StateProviderError {
    /// The local validator has not caught up to the queried state.
    #[error("chain catching up")]
    ChainCatchingUp,
    /// The queried state disagrees with the local chain.
    #[error("no execution state found")]
    NoExecutionState,
    /// Assertion states must sit at batch boundaries.
    #[error("position in batch must be zero, but got {0}")]
    PositionInBatchNonzero(u64),
    /// Batch-count queries start at one.
    #[error("batch count cannot be zero")]
    ZeroBatchCount,
    /// A backwards height range was requested.
    #[error("end block {end} is less than start block {start}")]
    InvalidRange {
        /// Range start.
        start: u64,
        /// Range end.
        end: u64,
    },
    /// The state walk ran past the permitted batch count.
    #[error("overran next batch count {next_batch_count} with global state batch {batch} position {pos_in_batch}")]
    BatchOverrun {
        /// The batch count the walk must stay below.
        next_batch_count: u64,
        /// Batch of the offending state.
        batch: u64,
        /// Position of the offending state.
        pos_in_batch: u64,
    },
    /// The binary search invariants broke.
    #[error("when attempting to find batch for message count {msg_count} high {high} < low {low}")]
    SearchInvariant {
        /// Message count being searched for.
        msg_count: u64,
        /// Current upper bound.
        high: u64,
        /// Current lower bound.
        low: u64,
    },
    /// A batch inconsistent with the message count was supplied.
    #[error("bad batch provided")]
    BadBatch,
    /// A machine hash disagrees with the commitment it must anchor.
    #[error("machine hash at step {step} does not match the commitment leaf")]
    HashMismatch {
        /// Absolute opcode position of the mismatch.
        step: u64,
    },
    /// An error from the stateless validator.
    #[error(transparent)]
    Validator(#[from] ValidatorError),
    /// An error from the inbox tracker.
    #[error(transparent)]
    Inbox(#[from] InboxError),
    /// An error from the history cache.
    #[error(transparent)]
    Cache(#[from] HistoryCacheError),
    /// An error from an awaited execution-run future.
    #[error(transparent)]
    Promise(#[from] PromiseError),
    /// An error from commitment or proof construction.
    #[error(transparent)]
    Proof(#[from] ProofError),
    /// An error from a validation spawner.
    #[error("spawner: {0}")]
    Spawner(String),
}

impl From<vigil_executor::SpawnerError> for StateProviderError {
    fn from(err: vigil_executor::SpawnerError) -> Self {
        Self::Spawner(err.to_string())
    }
}

impl From<vigil_validator::StreamerError> for StateProviderError {
    fn from(err: vigil_validator::StreamerError) -> Self {
        Self::Validator(err.into())
    }
}

/// Parameters of one machine-hash collection.
#[derive(Clone, Debug)]
pub struct HashCollectorConfig {
    /// Module root to replay under.
    pub wasm_module_root: B256,
    /// Message whose block execution is being bisected.
    pub message_number: u64,
    /// Challenge-origin heights above this level; the last entry is the
    /// start height within the current level.
    pub step_heights: Vec<u64>,
    /// Number of hashes to produce.
    pub num_desired_hashes: u64,
    /// Absolute opcode position of the first hash.
    pub machine_start_index: u64,
    /// Opcode distance between hashes.
    pub step_size: u64,
}

/// The protocol bundle settling a single disputed opcode.
#[derive(Clone, Debug)]
pub struct OneStepData {
    /// Machine hash before the disputed step.
    pub before_hash: B256,
    /// Opaque one-step proof produced by the VM.
    pub proof: Bytes,
}

/// One-step proof data plus the commitments and last-leaf proofs the
/// contract checks it against.
#[derive(Clone, Debug)]
pub struct OneStepProofBundle {
    /// The one-step data itself.
    pub data: OneStepData,
    /// Small-step commitment up to the disputed step.
    pub start_commitment: HistoryCommitment,
    /// Last-leaf inclusion proof for `start_commitment`.
    pub start_leaf_proof: Vec<B256>,
    /// Small-step commitment one step further.
    pub end_commitment: HistoryCommitment,
    /// Last-leaf inclusion proof for `end_commitment`.
    pub end_leaf_proof: Vec<B256>,
}

/// Builds block, big-step and small-step history commitments over the
/// validator's chain view for the interactive challenge protocol.
#[derive(Debug)]
pub struct StateManager<I, S, R, D> {
    validator: Arc<StatelessValidator<I, S, R, D>>,
    history_cache: HistoryCache,
    /// Leaf heights per challenge level: block, big-step, small-step.
    challenge_leaf_heights: Vec<u64>,
    cancel: CancellationToken,
}

impl<I, S, R, D> StateManager<I, S, R, D>
where
    I: InboxTracker,
    S: TransactionStreamer,
    R: ExecutionRecorder,
    D: KeyValueStore,
{
    /// Creates a state manager caching under `cache_base_dir`.
    pub fn new(
        validator: Arc<StatelessValidator<I, S, R, D>>,
        cache_base_dir: impl Into<std::path::PathBuf>,
        challenge_leaf_heights: Vec<u64>,
    ) -> Self {
        Self {
            validator,
            history_cache: HistoryCache::new(cache_base_dir),
            challenge_leaf_heights,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancels every in-flight collection.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Opcodes per big step: the small-step challenge leaf height.
    fn big_step_size(&self) -> u64 {
        self.challenge_leaf_heights.last().copied().unwrap_or(1)
    }

    /// Returns the message count at which the caller's claimed execution
    /// state is valid on our chain.
    ///
    /// Fails with [`StateProviderError::ChainCatchingUp`] while our validator
    /// has not yet seen the claimed batch, and with
    /// [`StateProviderError::NoExecutionState`] when the chain disagrees.
    pub async fn execution_state_msg_count(
        &self,
        state: &ExecutionState,
    ) -> Result<u64, StateProviderError> {
        let gs = state.global_state;
        if gs.pos_in_batch != 0 {
            return Err(StateProviderError::PositionInBatchNonzero(gs.pos_in_batch));
        }
        // Genesis and the init message are always agreed with.
        if gs.batch == 0 {
            return Ok(0);
        }
        if gs.batch == 1 {
            return Ok(1);
        }
        let batch = gs.batch - 1;
        let message_count = match self.validator.inbox_tracker().batch_message_count(batch).await
        {
            Ok(count) => count,
            Err(InboxError::AccumulatorNotFound(_)) => {
                return Err(StateProviderError::ChainCatchingUp)
            }
            Err(err) => return Err(err.into()),
        };
        let validated = self.execution_state_at_message_number_impl(message_count - 1).await?;
        if validated.global_state.batch < batch {
            return Err(StateProviderError::ChainCatchingUp);
        }
        let res = self.validator.streamer().result_at_count(message_count).await?;
        if res.block_hash != gs.block_hash || res.send_root != gs.send_root {
            return Err(StateProviderError::NoExecutionState);
        }
        Ok(message_count)
    }

    /// Produces the canonical execution state asserted at `message_number`,
    /// normalised to position zero of the next batch at batch boundaries.
    pub async fn execution_state_at_message_number(
        &self,
        message_number: u64,
    ) -> Result<ExecutionState, StateProviderError> {
        let mut state = self.execution_state_at_message_number_impl(message_number).await?;
        if state.global_state.pos_in_batch != 0 {
            state.global_state.batch += 1;
            state.global_state.pos_in_batch = 0;
        }
        Ok(state)
    }

    async fn execution_state_at_message_number_impl(
        &self,
        message_number: u64,
    ) -> Result<ExecutionState, StateProviderError> {
        let mut batch = self.find_batch_after_message_count(message_number).await?;
        match self.validator.inbox_tracker().batch_message_count(batch).await {
            Ok(count) if count <= message_number => batch += 1,
            Ok(_) => {}
            // One past the local view: the position still derives from the
            // previous batch's count.
            Err(InboxError::AccumulatorNotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        let global_state = self.find_global_state(message_number, batch).await?;
        Ok(ExecutionState { global_state, machine_status: MachineStatus::Finished })
    }

    /// The execution state after all messages of the first `batch_count`
    /// batches.
    pub async fn execution_state_after_batch_count(
        &self,
        batch_count: u64,
    ) -> Result<ExecutionState, StateProviderError> {
        if batch_count == 0 {
            return Err(StateProviderError::ZeroBatchCount);
        }
        let message_count =
            self.validator.inbox_tracker().batch_message_count(batch_count - 1).await?;
        self.execution_state_at_message_number(message_count).await
    }

    /// Finds the first batch whose message count exceeds `msg_count`,
    /// binary-searching the inbox tracker.
    async fn find_batch_after_message_count(
        &self,
        msg_count: u64,
    ) -> Result<u64, StateProviderError> {
        if msg_count == 0 {
            return Ok(0);
        }
        let mut low = 0u64;
        let mut high = self.validator.inbox_tracker().batch_count().await?;
        loop {
            // Search invariants: messageCount(high) >= msg_count,
            // messageCount(low - 1) < msg_count, high >= low.
            if high < low {
                return Err(StateProviderError::SearchInvariant { msg_count, high, low });
            }
            let mid = (low + high) / 2;
            match self.validator.inbox_tracker().batch_message_count(mid).await {
                Err(InboxError::AccumulatorNotFound(_)) => {
                    if high == mid {
                        return Err(StateProviderError::ChainCatchingUp);
                    }
                    high = mid;
                }
                Err(err) => return Err(err.into()),
                Ok(count) if count < msg_count => low = mid + 1,
                Ok(count) if count == msg_count => return Ok(mid + 1),
                Ok(_) if mid == low => return Ok(mid),
                Ok(_) => high = mid,
            }
        }
    }

    async fn find_global_state(
        &self,
        count: u64,
        batch: u64,
    ) -> Result<GlobalState, StateProviderError> {
        let prev_batch_msg_count = if batch > 0 {
            self.validator.inbox_tracker().batch_message_count(batch - 1).await?
        } else {
            0
        };
        if prev_batch_msg_count > count {
            return Err(StateProviderError::BadBatch);
        }
        let res = self.validator.streamer().result_at_count(count).await?;
        Ok(GlobalState::new(
            res.block_hash,
            res.send_root,
            batch,
            count - prev_batch_msg_count,
        ))
    }

    /// Block-level leaves for messages `[from, up_to]` (defaulting to the
    /// block challenge leaf height), stopping at `batch` and padding by
    /// repetition.
    pub async fn l2_message_states_up_to(
        &self,
        from: u64,
        up_to: Option<u64>,
        batch: u64,
    ) -> Result<Vec<B256>, StateProviderError> {
        let to = match up_to {
            Some(to) => to,
            None => self.challenge_leaf_heights.first().copied().unwrap_or_default(),
        };
        self.states_up_to(from, to, batch).await
    }

    async fn states_up_to(
        &self,
        block_start: u64,
        block_end: u64,
        next_batch_count: u64,
    ) -> Result<Vec<B256>, StateProviderError> {
        if block_end < block_start {
            return Err(StateProviderError::InvalidRange { start: block_start, end: block_end });
        }
        let mut batch = self.find_batch_after_message_count(block_start).await?;
        if batch == 0 {
            batch += 1;
        }
        // The commitment always spans the full requested range; positions the
        // walk cannot reach are padded by repeating the last reachable leaf.
        let desired_len = (block_end - block_start + 1) as usize;
        let mut state_roots = Vec::new();
        let mut last_state_root = B256::ZERO;
        // Genesis is the batch-0 sentinel and cannot be committed; a range
        // anchored there starts hashing at message 1.
        let start = block_start.max(1);
        for i in start..=block_end {
            let batch_msg_count = self.validator.inbox_tracker().batch_message_count(batch).await?;
            if batch_msg_count <= i {
                batch += 1;
            }
            let gs = self.find_global_state(i, batch).await?;
            if gs.batch >= next_batch_count {
                if gs.batch > next_batch_count || gs.pos_in_batch > 0 {
                    return Err(StateProviderError::BatchOverrun {
                        next_batch_count,
                        batch: gs.batch,
                        pos_in_batch: gs.pos_in_batch,
                    });
                }
                break;
            }
            let state_root = machine_finished_hash(&gs);
            state_roots.push(state_root);
            last_state_root = state_root;
        }
        while state_roots.len() < desired_len {
            state_roots.push(last_state_root);
        }
        Ok(state_roots)
    }

    fn cache_key_for(&self, cfg: &HashCollectorConfig) -> Key {
        let big_step = cfg.step_heights.first().copied();
        let below_block_level = cfg.step_heights.len() > 1;
        Key {
            wavm_module_root: cfg.wasm_module_root,
            assertion_hash: B256::ZERO,
            message_range: HeightRange::new(cfg.message_number, cfg.message_number + 1),
            big_step_range: below_block_level
                .then(|| big_step.map(|h| HeightRange::new(h, h + 1)))
                .flatten(),
            to_small_step: below_block_level.then_some(cfg.num_desired_hashes),
        }
    }

    /// Collects machine hashes for one bisection level, consulting and
    /// populating the on-disk cache when the collection starts at an aligned
    /// zero height.
    pub async fn collect_machine_hashes(
        &self,
        cfg: &HashCollectorConfig,
    ) -> Result<Vec<B256>, StateProviderError> {
        let to_step = cfg.machine_start_index + cfg.step_size * cfg.num_desired_hashes;
        let cache_key = self.cache_key_for(cfg);
        let cacheable = cfg.step_heights.last() == Some(&0);
        if cacheable {
            if let Ok(cached) =
                self.history_cache.get(&cache_key, Some(cfg.num_desired_hashes.saturating_sub(1)))
            {
                debug!(
                    target: "state_manager",
                    message = cfg.message_number,
                    hashes = cached.len(),
                    "machine hash cache hit"
                );
                return Ok(cached);
            }
        }
        let entry =
            self.validator.create_ready_validation_entry(cfg.message_number, &self.cancel).await?;
        let input = Arc::new(entry.to_input().map_err(ValidatorError::from)?);
        let run = self
            .validator
            .execution_spawner()
            .create_execution_run(cfg.wasm_module_root, input)
            .await?;
        let leaves = run
            .get_leaves_in_range(cfg.machine_start_index, to_step, cfg.step_size, cfg.num_desired_hashes)
            .wait(&self.cancel)
            .await?;
        if cacheable && leaves.len() > 1 {
            match self.history_cache.put(&cache_key, &leaves) {
                Ok(()) | Err(HistoryCacheError::FileAlreadyExists) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(leaves)
    }

    /// Computes the one-step proof bytes at an opcode position of a message's
    /// block execution.
    pub async fn collect_proof(
        &self,
        wasm_module_root: B256,
        message_number: u64,
        machine_index: u64,
    ) -> Result<Bytes, StateProviderError> {
        let entry =
            self.validator.create_ready_validation_entry(message_number, &self.cancel).await?;
        let input = Arc::new(entry.to_input().map_err(ValidatorError::from)?);
        let run = self
            .validator
            .execution_spawner()
            .create_execution_run(wasm_module_root, input)
            .await?;
        Ok(run.get_proof_at(machine_index).wait(&self.cancel).await?)
    }

    /// Commits to `leaves[..lo_size]` and proves it is a prefix of all of
    /// `leaves`, returning the ABI-packed
    /// `(bytes32[] prefixExpansion, bytes32[] prefixProof)` pair the
    /// protocol contracts consume.
    pub fn prefix_proof(
        &self,
        leaves: &[B256],
        lo_size: u64,
    ) -> Result<Bytes, StateProviderError> {
        let lo = lo_size as usize;
        if lo == 0 || lo > leaves.len() {
            return Err(ProofError::BadPrefix { prefix: lo_size, total: leaves.len() as u64 }.into());
        }
        let expansion = expansion_from_leaves(&leaves[..lo]);
        let proof = generate_prefix_proof(lo, leaves)?;
        Ok(Bytes::from((expansion, proof).abi_encode_params()))
    }

    /// Assembles the full one-step proof bundle at
    /// `(message, big step, small step)`.
    pub async fn one_step_proof_data(
        &self,
        wasm_module_root: B256,
        message_number: u64,
        big_step: u64,
        small_step: u64,
    ) -> Result<OneStepProofBundle, StateProviderError> {
        let big_step_size = self.big_step_size();
        let machine_start_index = big_step * big_step_size;
        let start_leaves = self
            .collect_machine_hashes(&HashCollectorConfig {
                wasm_module_root,
                message_number,
                step_heights: vec![big_step, 0],
                num_desired_hashes: small_step + 1,
                machine_start_index,
                step_size: 1,
            })
            .await?;
        let end_leaves = self
            .collect_machine_hashes(&HashCollectorConfig {
                wasm_module_root,
                message_number,
                step_heights: vec![big_step, 0],
                num_desired_hashes: small_step + 2,
                machine_start_index,
                step_size: 1,
            })
            .await?;
        let start_commitment = HistoryCommitment::new(&start_leaves)?;
        let end_commitment = HistoryCommitment::new(&end_leaves)?;

        let step = machine_start_index + small_step;
        let entry =
            self.validator.create_ready_validation_entry(message_number, &self.cancel).await?;
        let input = Arc::new(entry.to_input().map_err(ValidatorError::from)?);
        let run = self
            .validator
            .execution_spawner()
            .create_execution_run(wasm_module_root, input)
            .await?;
        let before = run.get_step_at(step).wait(&self.cancel).await?;
        if before.hash != start_commitment.last_leaf {
            return Err(StateProviderError::HashMismatch { step });
        }
        let after = run.get_step_at(step + 1).wait(&self.cancel).await?;
        if after.hash != end_commitment.last_leaf {
            return Err(StateProviderError::HashMismatch { step: step + 1 });
        }
        let proof = run.get_proof_at(step).wait(&self.cancel).await?;

        Ok(OneStepProofBundle {
            data: OneStepData { before_hash: before.hash, proof },
            start_commitment,
            start_leaf_proof: last_leaf_proof(&start_leaves),
            end_commitment,
            end_leaf_proof: last_leaf_proof(&end_leaves),
        })
    }
}
