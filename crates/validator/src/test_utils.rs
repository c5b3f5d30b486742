//! In-memory collaborator doubles for pipeline and state-provider tests.
//!
//! A [`MockChain`] is the single source of truth: the mock inbox tracker,
//! streamer, recorder and spawner all derive their answers from it, so every
//! component observes one consistent history.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use alloy_primitives::{b256, keccak256, Bytes, B256};
use async_trait::async_trait;
use vigil_executor::{
    ExecutionRun, SpawnerError, ValidationInput, ValidationRun, ValidationSpawner,
};
use vigil_primitives::{
    machine_finished_hash, GlobalState, MachineStatus, MessageIndex, MessageWithMetadata,
};
use vigil_util::Promise;

use crate::{
    ExecutionRecorder, InboxError, InboxTracker, KeyValueStore, MessageResult, RecordResult,
    StoreError, StreamerError, TransactionStreamer,
};

/// Module root every mock backend executes.
pub const MOCK_MODULE_ROOT: B256 =
    b256!("0000000000000000000000000000000000000000000000000000000000a5a5a5");

/// Terminal opcode position of the mock execution run.
pub const MOCK_EXEC_LAST_POS: u64 = 100;

const BLOCK_HASH_KEY: B256 =
    b256!("0000000000000000000000000000000000000000000000000000000011223344");
const SEND_ROOT_KEY: B256 =
    b256!("0000000000000000000000000000000000000000000000000000000055667788");
const BATCH_NUM_KEY: B256 =
    b256!("0000000000000000000000000000000000000000000000000000000099aabbcc");
const POS_IN_BATCH_KEY: B256 =
    b256!("0000000000000000000000000000000000000000000000000000000000ddeeff");

/// Encodes a global state as the preimage map the mock spawner reads its
/// replay result back out of.
pub fn global_state_to_preimages(gs: GlobalState) -> HashMap<B256, Bytes> {
    let mut preimages = HashMap::new();
    preimages.insert(BLOCK_HASH_KEY, Bytes::copy_from_slice(gs.block_hash.as_slice()));
    preimages.insert(SEND_ROOT_KEY, Bytes::copy_from_slice(gs.send_root.as_slice()));
    preimages.insert(BATCH_NUM_KEY, Bytes::from(gs.batch.to_be_bytes().to_vec()));
    preimages.insert(POS_IN_BATCH_KEY, Bytes::from(gs.pos_in_batch.to_be_bytes().to_vec()));
    preimages
}

/// Inverse of [`global_state_to_preimages`].
pub fn global_state_from_preimages(preimages: &HashMap<B256, Bytes>) -> GlobalState {
    let word = |key: &B256| preimages.get(key).cloned().unwrap_or_default();
    let num = |key: &B256| {
        let raw = word(key);
        let mut buf = [0u8; 8];
        let len = raw.len().min(8);
        buf[8 - len..].copy_from_slice(&raw[raw.len() - len..]);
        u64::from_be_bytes(buf)
    };
    GlobalState::new(
        B256::from_slice(&word(&BLOCK_HASH_KEY)),
        B256::from_slice(&word(&SEND_ROOT_KEY)),
        num(&BATCH_NUM_KEY),
        num(&POS_IN_BATCH_KEY),
    )
}

/// A deterministic chain model: batch message counts plus derived hashes.
#[derive(Debug)]
pub struct MockChain {
    /// `counts[b]` is the total message count after batch `b`.
    counts: Vec<MessageIndex>,
}

impl MockChain {
    /// Creates a chain from cumulative batch message counts. `counts[0]`
    /// should be 1: batch zero carries only the genesis sentinel.
    pub fn new(counts: Vec<MessageIndex>) -> Arc<Self> {
        Arc::new(Self { counts })
    }

    /// Total number of messages in the chain.
    pub fn message_count(&self) -> MessageIndex {
        self.counts.last().copied().unwrap_or_default()
    }

    /// Number of batches.
    pub fn batch_count(&self) -> u64 {
        self.counts.len() as u64
    }

    /// Block hash after `count` messages.
    pub fn block_hash_at(&self, count: MessageIndex) -> B256 {
        let mut buf = b"block".to_vec();
        buf.extend_from_slice(&count.to_be_bytes());
        keccak256(buf)
    }

    /// Send root after `count` messages.
    pub fn send_root_at(&self, count: MessageIndex) -> B256 {
        let mut buf = b"send".to_vec();
        buf.extend_from_slice(&count.to_be_bytes());
        keccak256(buf)
    }

    /// The canonical global state after `count` messages, normalized to
    /// position zero of the next batch at batch boundaries.
    pub fn gs_at_count(&self, count: MessageIndex) -> GlobalState {
        let batch =
            self.counts.iter().position(|&c| c > count).unwrap_or(self.counts.len()) as u64;
        let prev = if batch == 0 { 0 } else { self.counts[batch as usize - 1] };
        GlobalState::new(self.block_hash_at(count), self.send_root_at(count), batch, count - prev)
    }
}

/// Inbox tracker over a [`MockChain`].
#[derive(Debug)]
pub struct MockInboxTracker {
    chain: Arc<MockChain>,
}

impl MockInboxTracker {
    /// Creates a tracker over `chain`.
    pub fn new(chain: Arc<MockChain>) -> Arc<Self> {
        Arc::new(Self { chain })
    }
}

#[async_trait]
impl InboxTracker for MockInboxTracker {
    async fn batch_count(&self) -> Result<u64, InboxError> {
        Ok(self.chain.batch_count())
    }

    async fn batch_message_count(&self, batch: u64) -> Result<MessageIndex, InboxError> {
        self.chain
            .counts
            .get(batch as usize)
            .copied()
            .ok_or(InboxError::AccumulatorNotFound(batch))
    }

    async fn sequencer_message_bytes(&self, batch: u64) -> Result<Bytes, InboxError> {
        if batch >= self.chain.batch_count() {
            return Err(InboxError::AccumulatorNotFound(batch));
        }
        Ok(Bytes::from(format!("batch-{batch}").into_bytes()))
    }
}

/// Streamer over a [`MockChain`], with an adjustable processed horizon.
#[derive(Debug)]
pub struct MockStreamer {
    chain: Arc<MockChain>,
    processed: Mutex<MessageIndex>,
}

impl MockStreamer {
    /// Creates a streamer that has processed the full chain.
    pub fn new(chain: Arc<MockChain>) -> Arc<Self> {
        let processed = chain.message_count();
        Arc::new(Self { chain, processed: Mutex::new(processed) })
    }

    /// Limits how far the streamer claims to have processed.
    pub fn set_processed(&self, count: MessageIndex) {
        *self.processed.lock().expect("processed lock poisoned") = count;
    }
}

#[async_trait]
impl TransactionStreamer for MockStreamer {
    async fn result_at_count(&self, count: MessageIndex) -> Result<MessageResult, StreamerError> {
        if count > *self.processed.lock().expect("processed lock poisoned") {
            return Err(StreamerError::NotProcessed(count));
        }
        Ok(MessageResult {
            block_hash: self.chain.block_hash_at(count),
            send_root: self.chain.send_root_at(count),
        })
    }

    async fn get_message(
        &self,
        index: MessageIndex,
    ) -> Result<MessageWithMetadata, StreamerError> {
        if index >= *self.processed.lock().expect("processed lock poisoned") {
            return Err(StreamerError::NotProcessed(index));
        }
        Ok(MessageWithMetadata::default())
    }

    async fn processed_message_count(&self) -> Result<MessageIndex, StreamerError> {
        Ok(*self.processed.lock().expect("processed lock poisoned"))
    }
}

/// Recorder over a [`MockChain`], with injectable one-shot failures.
#[derive(Debug)]
pub struct MockRecorder {
    chain: Arc<MockChain>,
    fail_once_at: Mutex<HashSet<MessageIndex>>,
    record_calls: Mutex<Vec<MessageIndex>>,
    valid_calls: Mutex<Vec<(MessageIndex, B256)>>,
}

impl MockRecorder {
    /// Creates a recorder over `chain`.
    pub fn new(chain: Arc<MockChain>) -> Arc<Self> {
        Arc::new(Self {
            chain,
            fail_once_at: Mutex::new(HashSet::new()),
            record_calls: Mutex::new(Vec::new()),
            valid_calls: Mutex::new(Vec::new()),
        })
    }

    /// Makes the next recording of `pos` fail; subsequent attempts succeed.
    pub fn fail_once_at(&self, pos: MessageIndex) {
        self.fail_once_at.lock().expect("fail set lock poisoned").insert(pos);
    }

    /// Positions recording was requested for, in order.
    pub fn record_calls(&self) -> Vec<MessageIndex> {
        self.record_calls.lock().expect("record calls lock poisoned").clone()
    }

    /// `mark_valid` notifications received, in order.
    pub fn valid_calls(&self) -> Vec<(MessageIndex, B256)> {
        self.valid_calls.lock().expect("valid calls lock poisoned").clone()
    }
}

impl ExecutionRecorder for MockRecorder {
    fn record_block_creation(
        &self,
        pos: MessageIndex,
        _msg: MessageWithMetadata,
    ) -> Promise<RecordResult> {
        self.record_calls.lock().expect("record calls lock poisoned").push(pos);
        if self.fail_once_at.lock().expect("fail set lock poisoned").remove(&pos) {
            return Promise::failed("injected recording failure");
        }
        let end_gs = self.chain.gs_at_count(pos + 1);
        Promise::resolved(RecordResult {
            pos,
            block_hash: end_gs.block_hash,
            preimages: global_state_to_preimages(end_gs),
            batch_info: Vec::new(),
        })
    }

    fn mark_valid(&self, pos: MessageIndex, result_hash: B256) {
        self.valid_calls.lock().expect("valid calls lock poisoned").push((pos, result_hash));
    }

    fn prepare_for_record(&self, _start: MessageIndex, _end: MessageIndex) -> Promise<()> {
        Promise::resolved(())
    }
}

/// In-memory [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl KeyValueStore for MemoryStore {
    fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.map.lock().expect("store lock poisoned").contains_key(key))
    }

    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.map
            .lock()
            .expect("store lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::Backend("missing key".into()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.map.lock().expect("store lock poisoned").insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

/// The mock execution run's machine hash at `position`.
///
/// Position 0 and the terminal position carry machine-finished hashes, the
/// way a real replay machine starts and ends in the `Finished` status.
pub fn mock_machine_hash(position: u64, start: &GlobalState, end: &GlobalState) -> B256 {
    if position == 0 {
        machine_finished_hash(start)
    } else if position >= MOCK_EXEC_LAST_POS {
        machine_finished_hash(end)
    } else {
        keccak256(position.to_be_bytes())
    }
}

/// Mock one-step proof bytes.
pub fn mock_proof_bytes(position: u64) -> Bytes {
    Bytes::from(format!("one step proof at {position}").into_bytes())
}

/// An [`ExecutionRun`] that halts at [`MOCK_EXEC_LAST_POS`].
#[derive(Debug)]
pub struct MockExecutionRun {
    start_state: GlobalState,
    end_state: GlobalState,
}

impl MockExecutionRun {
    /// Creates a run between two states.
    pub fn new(start_state: GlobalState, end_state: GlobalState) -> Self {
        Self { start_state, end_state }
    }
}

impl ExecutionRun for MockExecutionRun {
    fn prepare_range(&self, _start: u64, _end: u64) -> Promise<()> {
        Promise::resolved(())
    }

    fn get_step_at(&self, position: u64) -> Promise<vigil_executor::MachineStepResult> {
        let clamped = position.min(MOCK_EXEC_LAST_POS);
        let (status, global_state) = if clamped >= MOCK_EXEC_LAST_POS {
            (MachineStatus::Finished, self.end_state)
        } else {
            (MachineStatus::Running, self.start_state)
        };
        Promise::resolved(vigil_executor::MachineStepResult {
            position: clamped,
            status,
            global_state,
            hash: mock_machine_hash(clamped, &self.start_state, &self.end_state),
        })
    }

    fn get_proof_at(&self, position: u64) -> Promise<Bytes> {
        Promise::resolved(mock_proof_bytes(position))
    }

    fn get_leaves_in_range(
        &self,
        start_index: u64,
        _end_index: u64,
        step_size: u64,
        num_desired: u64,
    ) -> Promise<Vec<B256>> {
        let mut leaves = Vec::with_capacity(num_desired as usize);
        for i in 0..num_desired {
            let position = start_index + i * step_size;
            leaves.push(mock_machine_hash(position, &self.start_state, &self.end_state));
            if position >= MOCK_EXEC_LAST_POS {
                break;
            }
        }
        if let Some(&last) = leaves.last() {
            leaves.resize(num_desired as usize, last);
        }
        Promise::resolved(leaves)
    }

    fn check_alive(&self, _timeout: Duration) -> bool {
        true
    }

    fn close(&self) {}
}

/// A spawner whose replays succeed instantly, echoing the end state encoded
/// in the input's preimages.
#[derive(Debug)]
pub struct MockSpawner {
    room: Mutex<usize>,
    exec_spawned: Mutex<Vec<u64>>,
    write_to_file_calls: Mutex<Vec<u64>>,
}

impl MockSpawner {
    /// Creates a spawner with plenty of room.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            room: Mutex::new(100),
            exec_spawned: Mutex::new(Vec::new()),
            write_to_file_calls: Mutex::new(Vec::new()),
        })
    }

    /// Overrides the room hint.
    pub fn set_room(&self, room: usize) {
        *self.room.lock().expect("room lock poisoned") = room;
    }

    /// Input ids execution runs were created for.
    pub fn exec_spawned(&self) -> Vec<u64> {
        self.exec_spawned.lock().expect("exec spawned lock poisoned").clone()
    }

    /// Input ids debug bundles were written for.
    pub fn write_to_file_calls(&self) -> Vec<u64> {
        self.write_to_file_calls.lock().expect("write calls lock poisoned").clone()
    }
}

#[async_trait]
impl ValidationSpawner for MockSpawner {
    fn name(&self) -> &str {
        "mock"
    }

    fn room(&self) -> usize {
        *self.room.lock().expect("room lock poisoned")
    }

    fn launch(&self, input: Arc<ValidationInput>, module_root: B256) -> ValidationRun {
        if module_root != MOCK_MODULE_ROOT {
            return ValidationRun::new(Promise::failed("unsupported root"), module_root);
        }
        ValidationRun::new(
            Promise::resolved(global_state_from_preimages(&input.preimages)),
            module_root,
        )
    }

    async fn create_execution_run(
        &self,
        module_root: B256,
        input: Arc<ValidationInput>,
    ) -> Result<Arc<dyn ExecutionRun>, SpawnerError> {
        self.exec_spawned.lock().expect("exec spawned lock poisoned").push(input.id);
        if module_root != MOCK_MODULE_ROOT {
            return Err(SpawnerError::UnsupportedRoot(module_root));
        }
        Ok(Arc::new(MockExecutionRun::new(
            input.start_state,
            global_state_from_preimages(&input.preimages),
        )))
    }

    async fn latest_wasm_module_root(&self) -> Result<B256, SpawnerError> {
        Ok(MOCK_MODULE_ROOT)
    }

    async fn write_to_file(
        &self,
        input: &ValidationInput,
        _expected_end: GlobalState,
        _module_root: B256,
    ) -> Result<(), SpawnerError> {
        self.write_to_file_calls.lock().expect("write calls lock poisoned").push(input.id);
        Ok(())
    }
}
