//! The staged create -> record -> validate pipeline.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use alloy_primitives::{Bytes, B256};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace, warn};
use vigil_executor::ValidationSpawner;
use vigil_primitives::{GlobalState, MessageIndex};
use vigil_util::PromiseError;

use crate::{
    build_global_state,
    metrics::PendingValidationGuard,
    BlockValidatorConfig, ExecutionRecorder, InboxTracker, KeyValueStore, Metrics,
    StatelessValidator, TransactionStreamer, ValidationEntry, ValidationStatus,
    ValidationStatusKind, ValidatorError,
};

/// Well-known store key the last-validated record lives at.
pub const LAST_VALIDATED_KEY: &[u8] = b"_lastGlobalStateValidatedInfo";

/// Durable record of the last validated global state and the module roots it
/// was validated under.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct GlobalStateValidatedInfo {
    /// The validated global state.
    pub global_state: GlobalState,
    /// Module roots the validation ran against. Empty after a reorg, when
    /// the roots are unknown.
    pub wasm_roots: Vec<B256>,
}

/// State owned by the creator loop; touched elsewhere only under the reorg
/// write lock.
#[derive(Debug, Default)]
struct CreateState {
    next_batch: Option<NextBatch>,
    batch_reread: bool,
    start_gs: GlobalState,
    prev_delayed: u64,
}

#[derive(Debug)]
struct NextBatch {
    bytes: Bytes,
    msg_count: MessageIndex,
}

/// State owned by the record loop.
#[derive(Debug, Default)]
struct RecordState {
    prepared: MessageIndex,
    pending_prepare: Option<vigil_util::Promise<MessageIndex>>,
}

/// State owned by the validation loop.
#[derive(Debug, Default)]
struct ValidState {
    last_valid: GlobalState,
    loop_pos: MessageIndex,
    last_logged: Option<Instant>,
}

struct BlockValidatorInner<I, S, R, D> {
    stateless: Arc<StatelessValidator<I, S, R, D>>,
    config: Arc<BlockValidatorConfig>,

    /// Epoch lock: worker loops hold read while examining and advancing
    /// cursors; reorg and initialization hold write.
    reorg_lock: RwLock<()>,
    chain_caught_up: AtomicBool,

    create: Mutex<CreateState>,
    record: Mutex<RecordState>,
    valid: Mutex<ValidState>,

    created: AtomicU64,
    record_sent: AtomicU64,
    validated: AtomicU64,
    validations: Mutex<HashMap<MessageIndex, Arc<ValidationStatus>>>,

    // Edge-triggered wakeups; a pending permit means a wakeup is already
    // queued and further triggers are dropped.
    create_nodes: Notify,
    send_record: Notify,
    progress_validations: Notify,

    fatal: mpsc::Sender<ValidatorError>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl<I, S, R, D> std::fmt::Debug for BlockValidatorInner<I, S, R, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockValidator")
            .field("created", &self.created.load(Ordering::SeqCst))
            .field("record_sent", &self.record_sent.load(Ordering::SeqCst))
            .field("validated", &self.validated.load(Ordering::SeqCst))
            .finish()
    }
}

/// The block-by-block validation pipeline.
///
/// Three worker loops advance the `created`, `record_sent` and `validated`
/// cursors through the validations map. All loops take the reorg lock in
/// read mode for normal progress; [`reorg`](Self::reorg) takes it in write
/// mode, cancels in-flight work at and past the reorg point, and rewinds
/// every cursor.
#[derive(Debug)]
pub struct BlockValidator<I, S, R, D> {
    inner: Arc<BlockValidatorInner<I, S, R, D>>,
}

impl<I, S, R, D> BlockValidator<I, S, R, D>
where
    I: InboxTracker,
    S: TransactionStreamer,
    R: ExecutionRecorder,
    D: KeyValueStore,
{
    /// Creates a pipeline over `stateless`, restoring the persisted
    /// last-valid state unless `dangerous.reset_block_validation` is set.
    ///
    /// Fatal errors are published to `fatal` with depth-1 semantics: the
    /// channel should be created with capacity 1, and additional errors are
    /// dropped.
    pub fn new(
        stateless: Arc<StatelessValidator<I, S, R, D>>,
        fatal: mpsc::Sender<ValidatorError>,
    ) -> Result<Self, ValidatorError> {
        let config = Arc::clone(stateless.config());
        let inner = BlockValidatorInner {
            stateless,
            config,
            reorg_lock: RwLock::new(()),
            chain_caught_up: AtomicBool::new(false),
            create: Mutex::new(CreateState::default()),
            record: Mutex::new(RecordState::default()),
            valid: Mutex::new(ValidState::default()),
            created: AtomicU64::new(0),
            record_sent: AtomicU64::new(0),
            validated: AtomicU64::new(0),
            validations: Mutex::new(HashMap::new()),
            create_nodes: Notify::new(),
            send_record: Notify::new(),
            progress_validations: Notify::new(),
            fatal,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
        };
        if !inner.config.dangerous.reset_block_validation {
            if let Some(info) = inner.read_last_validated_info()? {
                inner.lock_valid().last_valid = info.global_state;
            }
        }
        Ok(Self { inner: Arc::new(inner) })
    }

    /// The stateless core this pipeline drives.
    pub fn stateless(&self) -> &Arc<StatelessValidator<I, S, R, D>> {
        &self.inner.stateless
    }

    /// The creation cursor.
    pub fn created(&self) -> MessageIndex {
        self.inner.created.load(Ordering::SeqCst)
    }

    /// The record cursor.
    pub fn record_sent(&self) -> MessageIndex {
        self.inner.record_sent.load(Ordering::SeqCst)
    }

    /// The validation cursor.
    pub fn validated(&self) -> MessageIndex {
        self.inner.validated.load(Ordering::SeqCst)
    }

    /// The last validated global state.
    pub fn last_validated(&self) -> GlobalState {
        self.inner.lock_valid().last_valid
    }

    /// Reads the persisted last-validated record, if any.
    pub fn read_last_validated_info(
        &self,
    ) -> Result<Option<GlobalStateValidatedInfo>, ValidatorError> {
        self.inner.read_last_validated_info()
    }

    /// Accepts a trusted global state before start, monotonically advancing
    /// the last-valid pointer.
    pub fn assume_valid(&self, gs: GlobalState) -> Result<(), ValidatorError> {
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(ValidatorError::AlreadyStarted);
        }
        let mut valid = self.inner.lock_valid();
        if valid.last_valid.batch > gs.batch
            || (valid.last_valid.batch == gs.batch && valid.last_valid.pos_in_batch > gs.pos_in_batch)
        {
            return Ok(());
        }
        valid.last_valid = gs;
        Ok(())
    }

    /// Applies an on-chain module root update; see
    /// [`StatelessValidator::set_current_wasm_module_root`].
    pub fn set_current_wasm_module_root(&self, root: B256) -> Result<(), ValidatorError> {
        self.inner.stateless.set_current_wasm_module_root(root)
    }

    /// Resolves the current module root per configuration. Must run after
    /// any on-chain root injection and before [`start`](Self::start).
    pub async fn initialize(&self) -> Result<(), ValidatorError> {
        let stateless = &self.inner.stateless;
        match self.inner.config.current_module_root.as_str() {
            "latest" => {
                let latest = stateless.execution_spawner().latest_wasm_module_root().await?;
                stateless.force_current_wasm_module_root(latest);
            }
            "current" => {
                if stateless.current_wasm_module_root().is_zero() {
                    return Err(ValidatorError::CurrentRootUnset);
                }
            }
            raw => {
                let parsed: B256 =
                    raw.parse().map_err(|_| ValidatorError::IllegalModuleRoot)?;
                if parsed.is_zero() {
                    return Err(ValidatorError::IllegalModuleRoot);
                }
                stateless.force_current_wasm_module_root(parsed);
            }
        }
        info!(
            target: "block_validator",
            current = %stateless.current_wasm_module_root(),
            pending = ?stateless.pending_wasm_module_root(),
            "block validator initialized"
        );
        Ok(())
    }

    /// Starts the pipeline: seeds the genesis last-valid state if nothing
    /// was persisted, then launches the catch-up gate, which launches the
    /// worker loops once the chain contains the last-valid state.
    pub async fn start(&self) -> Result<(), ValidatorError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(ValidatorError::AlreadyStarted);
        }
        Metrics::describe();
        let _write = self.inner.reorg_lock.write().await;
        if self.inner.lock_valid().last_valid.batch == 0 {
            let genesis = self.inner.stateless.streamer().result_at_count(1).await?;
            self.inner.lock_valid().last_valid =
                GlobalState::new(genesis.block_hash, genesis.send_root, 1, 0);
        }
        let this = Arc::clone(&self.inner);
        self.inner.tracker.spawn(this.launch_workers_when_caught_up());
        Ok(())
    }

    /// Stops the pipeline and waits for every spawned task to unwind.
    pub async fn stop_and_wait(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    /// Rewinds the pipeline to `count` messages in response to an upstream
    /// reorganisation or a local validation disagreement.
    pub async fn reorg(&self, count: MessageIndex) -> Result<(), ValidatorError> {
        self.inner.reorg(count).await
    }

    /// Hints that batches from `count` onwards changed; forces a batch
    /// reread without touching cursors.
    pub async fn reorg_to_batch_count(&self, count: u64) {
        let _write = self.inner.reorg_lock.write().await;
        let mut create = self.inner.lock_create();
        if create.start_gs.batch >= count {
            create.batch_reread = true;
        }
    }
}

impl<I, S, R, D> BlockValidatorInner<I, S, R, D>
where
    I: InboxTracker,
    S: TransactionStreamer,
    R: ExecutionRecorder,
    D: KeyValueStore,
{
    fn lock_create(&self) -> std::sync::MutexGuard<'_, CreateState> {
        self.create.lock().expect("create state lock poisoned")
    }

    fn lock_record(&self) -> std::sync::MutexGuard<'_, RecordState> {
        self.record.lock().expect("record state lock poisoned")
    }

    fn lock_valid(&self) -> std::sync::MutexGuard<'_, ValidState> {
        self.valid.lock().expect("valid state lock poisoned")
    }

    fn lock_validations(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<MessageIndex, Arc<ValidationStatus>>> {
        self.validations.lock().expect("validations lock poisoned")
    }

    fn read_last_validated_info(
        &self,
    ) -> Result<Option<GlobalStateValidatedInfo>, ValidatorError> {
        let db = self.stateless.db();
        if !db.has(LAST_VALIDATED_KEY)? {
            return Ok(None);
        }
        let raw = db.get(LAST_VALIDATED_KEY)?;
        let info = alloy_rlp::decode_exact(&raw)
            .map_err(|err| ValidatorError::Persist(err.to_string()))?;
        Ok(Some(info))
    }

    fn write_last_validated(
        &self,
        gs: GlobalState,
        wasm_roots: &[B256],
    ) -> Result<(), ValidatorError> {
        let info =
            GlobalStateValidatedInfo { global_state: gs, wasm_roots: wasm_roots.to_vec() };
        let encoded = alloy_rlp::encode(&info);
        self.stateless.db().put(LAST_VALIDATED_KEY, &encoded)?;
        Ok(())
    }

    /// Logs and, when failure is fatal, publishes `err` to the fatal
    /// channel. A full channel means a fatal error is already pending and
    /// this one is dropped.
    fn possibly_fatal(&self, err: ValidatorError) {
        if self.cancel.is_cancelled() {
            return;
        }
        error!(target: "block_validator", %err, "error during validation");
        if self.config.failure_is_fatal {
            let _ = self.fatal.try_send(err);
        }
    }

    /// Takes the write lock periodically until the persisted last-valid
    /// global state is present in the chain, then seeds the cursors.
    async fn check_validated_gs_caught_up(&self) -> Result<bool, ValidatorError> {
        let _write = self.reorg_lock.write().await;
        if self.chain_caught_up.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let last_valid = self.lock_valid().last_valid;
        if last_valid.batch == 0 {
            return Err(ValidatorError::LastValidUninitialized);
        }
        let Some(count) = self.stateless.global_state_to_msg_count(last_valid).await? else {
            return Ok(false);
        };
        let msg = self.stateless.streamer().get_message(count - 1).await?;
        {
            let mut create = self.lock_create();
            create.batch_reread = true;
            create.start_gs = last_valid;
            create.prev_delayed = msg.delayed_messages_read;
        }
        self.created.store(count, Ordering::SeqCst);
        self.record_sent.store(count, Ordering::SeqCst);
        self.validated.store(count, Ordering::SeqCst);
        metrics::gauge!(Metrics::MSG_COUNT_VALIDATED).set(count as f64);
        self.chain_caught_up.store(true, Ordering::SeqCst);
        info!(target: "block_validator", count, "chain caught up to last validated state");
        Ok(true)
    }

    async fn launch_workers_when_caught_up(self: Arc<Self>) {
        loop {
            match self.check_validated_gs_caught_up().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => {
                    error!(target: "block_validator", %err, "error waiting for chain to catch up")
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.validation_poll) => {}
            }
        }
        self.tracker.spawn(Arc::clone(&self).creator_loop());
        self.tracker.spawn(Arc::clone(&self).record_loop());
        self.tracker.spawn(Arc::clone(&self).validation_loop());
    }

    // --- creator -----------------------------------------------------------

    async fn creator_loop(self: Arc<Self>) {
        loop {
            let more_work = match self.create_next_validation_entry().await {
                Ok(more) => more,
                Err(err) => {
                    let processed =
                        self.stateless.streamer().processed_message_count().await.ok();
                    error!(
                        target: "block_validator",
                        %err,
                        created = self.created.load(Ordering::SeqCst),
                        ?processed,
                        "error trying to create validation entry"
                    );
                    false
                }
            };
            if self.cancel.is_cancelled() {
                return;
            }
            if more_work {
                continue;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.create_nodes.notified() => {}
                _ = tokio::time::sleep(self.config.validation_poll) => {}
            }
        }
    }

    async fn create_next_validation_entry(&self) -> Result<bool, ValidatorError> {
        let _read = self.reorg_lock.read().await;
        let pos = self.created.load(Ordering::SeqCst);
        if pos > self.validated.load(Ordering::SeqCst) + self.config.forward_blocks {
            return Ok(false);
        }
        let streamer = self.stateless.streamer();
        if pos >= streamer.processed_message_count().await? {
            return Ok(false);
        }
        let msg = streamer.get_message(pos).await?;
        let end_res = streamer.result_at_count(pos + 1).await?;

        let (start_gs, prev_delayed, need_batch) = {
            let create = self.lock_create();
            (
                create.start_gs,
                create.prev_delayed,
                create.start_gs.pos_in_batch == 0
                    || create.batch_reread
                    || create.next_batch.is_none(),
            )
        };
        let (batch_bytes, batch_msg_count) = if need_batch {
            let Some((bytes, msg_count)) = self.stateless.read_batch(start_gs.batch).await? else {
                return Ok(false);
            };
            metrics::gauge!(Metrics::MSG_COUNT_CURRENT_BATCH).set(msg_count as f64);
            let mut create = self.lock_create();
            create.next_batch = Some(NextBatch { bytes: bytes.clone(), msg_count });
            create.batch_reread = false;
            (bytes, msg_count)
        } else {
            let create = self.lock_create();
            match create.next_batch.as_ref() {
                Some(batch) => (batch.bytes.clone(), batch.msg_count),
                None => return Ok(false),
            }
        };

        let mut end_gs = GlobalState::new(end_res.block_hash, end_res.send_root, 0, 0);
        if pos + 1 < batch_msg_count {
            end_gs.batch = start_gs.batch;
            end_gs.pos_in_batch = start_gs.pos_in_batch + 1;
        } else if pos + 1 == batch_msg_count {
            end_gs.batch = start_gs.batch + 1;
            end_gs.pos_in_batch = 0;
        } else {
            return Err(ValidatorError::IllegalBatchCount {
                count: batch_msg_count,
                pos,
                batch: start_gs.batch,
            });
        }
        let entry =
            ValidationEntry::new(pos, start_gs, end_gs, msg.clone(), batch_bytes, prev_delayed)?;
        self.lock_validations().insert(pos, Arc::new(ValidationStatus::new(entry)));
        {
            let mut create = self.lock_create();
            create.start_gs = end_gs;
            create.prev_delayed = msg.delayed_messages_read;
        }
        self.created.store(pos + 1, Ordering::SeqCst);
        trace!(target: "block_validator", pos, "created validation entry");
        Ok(true)
    }

    // --- recorder ----------------------------------------------------------

    async fn record_loop(self: Arc<Self>) {
        loop {
            let more_work = match self.send_next_record_request().await {
                Ok(more) => more,
                Err(err) => {
                    error!(target: "block_validator", %err, "error trying to record for validation entry");
                    false
                }
            };
            if self.cancel.is_cancelled() {
                return;
            }
            if more_work {
                continue;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.send_record.notified() => {}
                _ = tokio::time::sleep(self.config.validation_poll) => {}
            }
        }
    }

    /// Keeps the prerecord window (`prepared`) ahead of validation, capped
    /// at the creation cursor. At most one prepare request is in flight.
    fn send_next_record_prepare(self: &Arc<Self>) -> Result<(), ValidatorError> {
        {
            let mut record = self.lock_record();
            if let Some(pending) = record.pending_prepare.clone() {
                if !pending.ready() {
                    return Ok(());
                }
                record.pending_prepare = None;
                let prepared = pending.current()?;
                if prepared > record.prepared {
                    record.prepared = prepared;
                }
            }
        }
        let next_prepared = (self.validated.load(Ordering::SeqCst) + self.config.prerecorded_blocks)
            .min(self.created.load(Ordering::SeqCst));
        let prepared = self.lock_record().prepared;
        if prepared >= next_prepared {
            return Ok(());
        }
        let promise = self.stateless.recorder().prepare_for_record(prepared, next_prepared - 1);
        let (producer, wrapped) = vigil_util::Promise::channel();
        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            match promise.wait(&this.cancel).await {
                Ok(()) => {
                    this.send_record.notify_one();
                    producer.produce(next_prepared);
                }
                Err(err) => producer.produce_err(err),
            }
        });
        self.lock_record().pending_prepare = Some(wrapped);
        Ok(())
    }

    async fn send_next_record_request(self: &Arc<Self>) -> Result<bool, ValidatorError> {
        let _read = self.reorg_lock.read().await;
        self.send_next_record_prepare()?;
        let pos = self.record_sent.load(Ordering::SeqCst);
        if pos >= self.lock_record().prepared {
            return Ok(false);
        }
        let status = self
            .lock_validations()
            .get(&pos)
            .cloned()
            .ok_or(ValidatorError::MissingEntry(pos))?;
        let kind = status.kind();
        if kind != ValidationStatusKind::Created {
            return Err(ValidatorError::UnexpectedStatus { pos, kind });
        }
        self.send_record(&status)?;
        self.record_sent.store(pos + 1, Ordering::SeqCst);
        Ok(true)
    }

    /// Launches the recording task for one entry:
    /// `Created -> RecordSent -> (Prepared | RecordFailed)`.
    fn send_record(self: &Arc<Self>, status: &Arc<ValidationStatus>) -> Result<(), ValidatorError> {
        if !status.replace(ValidationStatusKind::Created, ValidationStatusKind::RecordSent) {
            return Err(ValidatorError::UnexpectedStatus {
                pos: status.entry().pos,
                kind: status.kind(),
            });
        }
        let this = Arc::clone(self);
        let status = Arc::clone(status);
        self.tracker.spawn(async move {
            let entry = Arc::clone(status.entry());
            let promise =
                this.stateless.recorder().record_block_creation(entry.pos, entry.msg.clone());
            let result = promise.wait(&this.cancel).await;
            match result {
                Err(PromiseError::Cancelled) => {}
                Err(err) => {
                    status.replace(
                        ValidationStatusKind::RecordSent,
                        ValidationStatusKind::RecordFailed,
                    );
                    error!(target: "block_validator", pos = entry.pos, %err, "error while recording");
                }
                Ok(record) => {
                    if let Err(err) = entry.record(record) {
                        status.replace(
                            ValidationStatusKind::RecordSent,
                            ValidationStatusKind::RecordFailed,
                        );
                        error!(target: "block_validator", pos = entry.pos, %err, "error attaching recording");
                        return;
                    }
                    if !status.replace(
                        ValidationStatusKind::RecordSent,
                        ValidationStatusKind::Prepared,
                    ) {
                        error!(
                            target: "block_validator",
                            pos = entry.pos,
                            status = ?status.kind(),
                            "fault trying to update validation with recording"
                        );
                        return;
                    }
                    this.progress_validations.notify_one();
                }
            }
        });
        Ok(())
    }

    // --- validator ---------------------------------------------------------

    async fn validation_loop(self: Arc<Self>) {
        loop {
            match self.advance_validations().await {
                Ok(None) => {}
                Ok(Some(reorg_to)) => {
                    if let Err(err) = self.reorg(reorg_to).await {
                        error!(target: "block_validator", %err, pos = reorg_to, "error trying to reorg validation");
                        self.possibly_fatal(err);
                    }
                }
                Err(err) => {
                    error!(target: "block_validator", %err, "error trying to advance validations")
                }
            }
            if self.cancel.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.progress_validations.notified() => {}
                _ = tokio::time::sleep(self.config.validation_poll) => {}
            }
        }
    }

    /// Scans entries between the validation and record cursors, confirming
    /// finished validations at the head and launching new runs while room
    /// remains. Returns the position to reorg to when an entry cannot
    /// proceed.
    async fn advance_validations(
        self: &Arc<Self>,
    ) -> Result<Option<MessageIndex>, ValidatorError> {
        let mut guard = self.reorg_lock.read().await;

        let wasm_roots = self.stateless.module_roots_to_validate();
        // Launch fan-out is bounded by the spawners' aggregate room; the cap
        // keeps one scan from flooding a large backend.
        let mut room = 100usize;
        for spawner in self.stateless.validation_spawners() {
            room = room.min(spawner.room() / wasm_roots.len());
        }

        let mut pos = self.validated.load(Ordering::SeqCst).saturating_sub(1);
        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            self.lock_valid().loop_pos = pos + 1;
            // Release and re-acquire read between iterations so a pending
            // reorg is never starved.
            drop(guard);
            guard = self.reorg_lock.read().await;
            pos = self.lock_valid().loop_pos;
            if pos >= self.record_sent.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let status = self
                .lock_validations()
                .get(&pos)
                .cloned()
                .ok_or(ValidatorError::MissingEntry(pos))?;
            let kind = status.kind();
            if kind == ValidationStatusKind::RecordFailed {
                warn!(target: "block_validator", pos, "recording for validation failed, retrying");
                return Ok(Some(pos));
            }
            if kind == ValidationStatusKind::ValidationSent
                && pos == self.validated.load(Ordering::SeqCst)
            {
                let entry = Arc::clone(status.entry());
                let last_valid = self.lock_valid().last_valid;
                if entry.start != last_valid {
                    warn!(
                        target: "block_validator",
                        pos,
                        start = ?entry.start,
                        expected = ?last_valid,
                        "validation entry has wrong start state"
                    );
                    status.cancel();
                    return Ok(Some(pos));
                }
                let runs = status.runs();
                if runs.iter().any(|run| !run.ready()) {
                    continue;
                }
                let mut validated_roots = Vec::with_capacity(runs.len());
                for run in &runs {
                    validated_roots.push(run.wasm_module_root());
                    let err = match run.current() {
                        Ok(end) if end != entry.end => {
                            self.write_debug_bundle(&entry, run.wasm_module_root());
                            Some(ValidatorError::Mismatch { expected: entry.end, got: end })
                        }
                        Ok(_) => None,
                        Err(err) => Some(err.into()),
                    };
                    if let Some(err) = err {
                        metrics::counter!(Metrics::VALIDATIONS_FAILED).increment(1);
                        self.possibly_fatal(err);
                        // Not fatal: retried through a reorg to this position.
                        return Ok(Some(pos));
                    }
                    metrics::counter!(Metrics::VALIDATIONS_VALID).increment(1);
                }
                self.lock_valid().last_valid = entry.end;
                self.stateless.recorder().mark_valid(pos, entry.end.block_hash);
                if let Err(err) = self.write_last_validated(entry.end, &validated_roots) {
                    error!(target: "block_validator", pos, %err, "failed writing new validated to database");
                }
                self.lock_validations().remove(&pos);
                self.validated.store(pos + 1, Ordering::SeqCst);
                self.create_nodes.notify_one();
                self.send_record.notify_one();
                metrics::gauge!(Metrics::MSG_COUNT_VALIDATED).set((pos + 1) as f64);
                self.maybe_log_newly_valid();
                continue;
            }
            if room == 0 {
                return Ok(None);
            }
            if kind == ValidationStatusKind::Prepared {
                if status.replace(
                    ValidationStatusKind::Prepared,
                    ValidationStatusKind::SendingValidation,
                ) {
                    self.launch_validation(Arc::clone(&status), wasm_roots.clone());
                    room -= 1;
                } else {
                    self.possibly_fatal(ValidatorError::UnexpectedStatus {
                        pos,
                        kind: status.kind(),
                    });
                }
            }
        }
    }

    /// Launches one run per (module root, spawner) pair for a prepared
    /// entry: `SendingValidation -> ValidationSent`.
    fn launch_validation(self: &Arc<Self>, status: Arc<ValidationStatus>, roots: Vec<B256>) {
        let this = Arc::clone(self);
        let cancel = self.cancel.child_token();
        status.set_cancel(cancel.clone());
        self.tracker.spawn(async move {
            let _pending = PendingValidationGuard::acquire();
            let input = match status.entry().to_input() {
                Ok(input) => Arc::new(input),
                Err(err) => {
                    if !cancel.is_cancelled() {
                        this.possibly_fatal(err.into());
                    }
                    return;
                }
            };
            let mut runs = Vec::new();
            for root in &roots {
                for spawner in this.stateless.validation_spawners() {
                    runs.push(spawner.launch(Arc::clone(&input), *root));
                }
            }
            status.set_runs(runs.clone());
            if !status.replace(
                ValidationStatusKind::SendingValidation,
                ValidationStatusKind::ValidationSent,
            ) {
                this.possibly_fatal(ValidatorError::UnexpectedStatus {
                    pos: status.entry().pos,
                    kind: status.kind(),
                });
            }
            // The status may be pruned from under us; only wake the
            // validation loop once every run settled.
            for run in &runs {
                if run.wait(&cancel).await.is_err() {
                    return;
                }
            }
            this.progress_validations.notify_one();
        });
    }

    fn write_debug_bundle(self: &Arc<Self>, entry: &Arc<ValidationEntry>, root: B256) {
        let spawner = Arc::clone(self.stateless.execution_spawner());
        let entry = Arc::clone(entry);
        self.tracker.spawn(async move {
            let input = match entry.to_input() {
                Ok(input) => input,
                Err(err) => {
                    warn!(target: "block_validator", %err, "cannot build debug bundle input");
                    return;
                }
            };
            if let Err(err) = spawner.write_to_file(&input, entry.end, root).await {
                warn!(target: "block_validator", %err, "failed to write debug results file");
            }
        });
    }

    fn maybe_log_newly_valid(&self) {
        let count = self.validated.load(Ordering::SeqCst);
        let mut valid = self.lock_valid();
        let now = Instant::now();
        if valid.last_logged.is_none_or(|at| now.duration_since(at) > Duration::from_secs(1)) {
            info!(
                target: "block_validator",
                count,
                block_hash = %valid.last_valid.block_hash,
                "result validated"
            );
            valid.last_logged = Some(now);
        } else {
            trace!(
                target: "block_validator",
                count,
                block_hash = %valid.last_valid.block_hash,
                "result validated"
            );
        }
    }

    // --- reorg -------------------------------------------------------------

    async fn reorg(&self, count: MessageIndex) -> Result<(), ValidatorError> {
        let _write = self.reorg_lock.write().await;
        if count <= 1 {
            return Err(ValidatorError::ReorgOutGenesis);
        }
        if !self.chain_caught_up.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.created.load(Ordering::SeqCst) < count {
            return Ok(());
        }
        let positions = self.stateless.global_state_positions_at_count(count).await;
        let (_, end_position) = match positions {
            Ok(positions) => positions,
            Err(err) => {
                self.possibly_fatal(err.clone());
                return Err(err);
            }
        };
        let res = match self.stateless.streamer().result_at_count(count).await {
            Ok(res) => res,
            Err(err) => {
                let err = ValidatorError::from(err);
                self.possibly_fatal(err.clone());
                return Err(err);
            }
        };
        let msg = match self.stateless.streamer().get_message(count - 1).await {
            Ok(msg) => msg,
            Err(err) => {
                let err = ValidatorError::from(err);
                self.possibly_fatal(err.clone());
                return Err(err);
            }
        };
        {
            let mut validations = self.lock_validations();
            for pos in count..self.created.load(Ordering::SeqCst) {
                if let Some(status) = validations.remove(&pos) {
                    status.cancel();
                }
            }
        }
        let next_start = build_global_state(&res, &end_position);
        {
            let mut create = self.lock_create();
            create.start_gs = next_start;
            create.prev_delayed = msg.delayed_messages_read;
            create.batch_reread = true;
        }
        self.created.store(count, Ordering::SeqCst);
        if self.record_sent.load(Ordering::SeqCst) > count {
            self.record_sent.store(count, Ordering::SeqCst);
        }
        if self.validated.load(Ordering::SeqCst) > count {
            self.validated.store(count, Ordering::SeqCst);
            metrics::gauge!(Metrics::MSG_COUNT_VALIDATED).set(count as f64);
            self.lock_valid().last_valid = next_start;
            // The module roots the rewound state was validated under are
            // unknown here; persist an empty set.
            if let Err(err) = self.write_last_validated(next_start, &[]) {
                error!(target: "block_validator", %err, "failed writing valid state after reorg");
            }
        }
        {
            let mut record = self.lock_record();
            if record.prepared > count {
                record.prepared = count;
            }
        }
        debug!(target: "block_validator", count, "pipeline reorged");
        self.create_nodes.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        MemoryStore, MockChain, MockInboxTracker, MockRecorder, MockSpawner, MockStreamer,
        MOCK_MODULE_ROOT,
    };
    use vigil_primitives::MessageWithMetadata;

    type TestValidator = BlockValidator<MockInboxTracker, MockStreamer, MockRecorder, MemoryStore>;

    struct TestContext {
        chain: Arc<MockChain>,
        recorder: Arc<MockRecorder>,
        store: Arc<MemoryStore>,
        spawner: Arc<MockSpawner>,
        fatal_rx: mpsc::Receiver<ValidatorError>,
    }

    /// Two batches of five messages each behind the genesis batch.
    fn default_counts() -> Vec<MessageIndex> {
        vec![1, 6, 11]
    }

    async fn build_validator(
        counts: Vec<MessageIndex>,
        config: BlockValidatorConfig,
    ) -> (TestValidator, TestContext) {
        let chain = MockChain::new(counts);
        let inbox = MockInboxTracker::new(Arc::clone(&chain));
        let streamer = MockStreamer::new(Arc::clone(&chain));
        let recorder = MockRecorder::new(Arc::clone(&chain));
        let store = MemoryStore::new();
        let spawner = MockSpawner::new();
        let stateless = Arc::new(
            StatelessValidator::new(
                inbox,
                streamer,
                Arc::clone(&recorder),
                Arc::clone(&store),
                Arc::clone(&spawner) as _,
                vec![Arc::clone(&spawner) as _],
                Arc::new(config),
            )
            .await
            .unwrap(),
        );
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        let validator = BlockValidator::new(stateless, fatal_tx).unwrap();
        (validator, TestContext { chain, recorder, store, spawner, fatal_rx })
    }

    async fn wait_until(mut probe: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !probe() {
            if Instant::now() > deadline {
                panic!("timed out waiting for pipeline progress");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pipeline_validates_full_chain() {
        let (validator, ctx) =
            build_validator(default_counts(), BlockValidatorConfig::for_testing()).await;
        validator.initialize().await.unwrap();
        validator.start().await.unwrap();

        let total = ctx.chain.message_count();
        wait_until(|| validator.validated() == total).await;
        validator.stop_and_wait().await;

        let expected_last = ctx.chain.gs_at_count(total);
        assert_eq!(expected_last.batch, 3);
        assert_eq!(expected_last.pos_in_batch, 0);
        assert_eq!(validator.last_validated(), expected_last);

        // Consecutive entries chained: every validated position was marked
        // valid with its end block hash, in order.
        let valids = ctx.recorder.valid_calls();
        assert_eq!(valids.len() as u64, total - 1);
        for (i, (pos, hash)) in valids.iter().enumerate() {
            assert_eq!(*pos, i as u64 + 1);
            assert_eq!(*hash, ctx.chain.block_hash_at(pos + 1));
        }

        // The last-validated record was persisted with the module root set.
        let info = validator.read_last_validated_info().unwrap().unwrap();
        assert_eq!(info.global_state, expected_last);
        assert_eq!(info.wasm_roots, vec![MOCK_MODULE_ROOT]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pipeline_recovers_from_record_failure() {
        let (validator, ctx) =
            build_validator(default_counts(), BlockValidatorConfig::for_testing()).await;
        ctx.recorder.fail_once_at(5);
        validator.initialize().await.unwrap();
        validator.start().await.unwrap();

        let total = ctx.chain.message_count();
        wait_until(|| validator.validated() == total).await;
        validator.stop_and_wait().await;

        // The failed position was reorged back and recorded again.
        let records: Vec<_> =
            ctx.recorder.record_calls().into_iter().filter(|&p| p == 5).collect();
        assert!(records.len() >= 2, "expected a retry of position 5");
        assert_eq!(validator.last_validated(), ctx.chain.gs_at_count(total));
    }

    #[tokio::test]
    async fn record_failure_yields_reorg_request_and_prunes_state() {
        let (validator, ctx) =
            build_validator(default_counts(), BlockValidatorConfig::for_testing()).await;
        validator.initialize().await.unwrap();
        let inner = &validator.inner;

        // Hand-build the pipeline state: validated = 2, entries at 2 and 3,
        // where 2 has a successful in-flight validation and 3 failed its
        // recording.
        let gs2 = ctx.chain.gs_at_count(2);
        let gs3 = ctx.chain.gs_at_count(3);
        let gs4 = ctx.chain.gs_at_count(4);
        inner.chain_caught_up.store(true, Ordering::SeqCst);
        inner.created.store(4, Ordering::SeqCst);
        inner.record_sent.store(4, Ordering::SeqCst);
        inner.validated.store(2, Ordering::SeqCst);
        inner.lock_valid().last_valid = gs2;
        inner.lock_create().start_gs = gs4;

        use ValidationStatusKind::*;
        let entry2 = ValidationEntry::new(
            2,
            gs2,
            gs3,
            MessageWithMetadata::default(),
            Bytes::new(),
            0,
        )
        .unwrap();
        let status2 = ValidationStatus::new(entry2);
        assert!(status2.replace(Created, RecordSent));
        assert!(status2.replace(RecordSent, Prepared));
        assert!(status2.replace(Prepared, SendingValidation));
        assert!(status2.replace(SendingValidation, ValidationSent));
        status2.set_runs(vec![vigil_executor::ValidationRun::new(
            vigil_util::Promise::resolved(gs3),
            MOCK_MODULE_ROOT,
        )]);

        let entry3 = ValidationEntry::new(
            3,
            gs3,
            gs4,
            MessageWithMetadata::default(),
            Bytes::new(),
            0,
        )
        .unwrap();
        let status3 = ValidationStatus::new(entry3);
        assert!(status3.replace(Created, RecordSent));
        assert!(status3.replace(RecordSent, RecordFailed));

        {
            let mut validations = inner.lock_validations();
            validations.insert(2, Arc::new(status2));
            validations.insert(3, Arc::new(status3));
        }

        // One validator-loop iteration: confirms position 2, then surfaces
        // the failed recording at 3 as a reorg request.
        let reorg_to = inner.advance_validations().await.unwrap();
        assert_eq!(reorg_to, Some(3));
        assert_eq!(inner.validated.load(Ordering::SeqCst), 3);
        assert_eq!(ctx.recorder.valid_calls(), vec![(2, gs3.block_hash)]);

        validator.reorg(3).await.unwrap();
        assert_eq!(validator.created(), 3);
        assert_eq!(validator.record_sent(), 3);
        assert_eq!(validator.validated(), 3);
        assert!(inner.lock_validations().is_empty());
        // The validated cursor was not rewound, so the last-valid state is
        // untouched; the creator restarts from the reorged position.
        assert_eq!(validator.last_validated(), gs3);
        assert_eq!(inner.lock_create().start_gs, ctx.chain.gs_at_count(3));
        assert!(inner.lock_create().batch_reread);
    }

    #[tokio::test]
    async fn reorg_rejects_genesis_and_skips_when_not_caught_up() {
        let (validator, _ctx) =
            build_validator(default_counts(), BlockValidatorConfig::for_testing()).await;
        assert!(matches!(
            validator.reorg(1).await,
            Err(ValidatorError::ReorgOutGenesis)
        ));
        // Not caught up: a reorg above genesis is a no-op.
        validator.reorg(5).await.unwrap();
        assert_eq!(validator.created(), 0);
    }

    #[tokio::test]
    async fn assume_valid_is_monotonic_and_rejected_after_start() {
        let (validator, _ctx) =
            build_validator(default_counts(), BlockValidatorConfig::for_testing()).await;
        let ahead = GlobalState::new(B256::ZERO, B256::ZERO, 2, 1);
        let behind = GlobalState::new(B256::ZERO, B256::ZERO, 2, 0);
        validator.assume_valid(ahead).unwrap();
        assert_eq!(validator.last_validated(), ahead);
        // A state behind the current one is ignored.
        validator.assume_valid(behind).unwrap();
        assert_eq!(validator.last_validated(), ahead);

        validator.initialize().await.unwrap();
        validator.start().await.unwrap();
        assert!(matches!(
            validator.assume_valid(ahead),
            Err(ValidatorError::AlreadyStarted)
        ));
        validator.stop_and_wait().await;
    }

    #[tokio::test]
    async fn module_root_update_rules() {
        let mut config = BlockValidatorConfig::for_testing();
        config.current_module_root = "current".into();
        let (validator, _ctx) = build_validator(default_counts(), config).await;

        // Nothing injected yet: initialization refuses to run.
        assert!(matches!(
            validator.initialize().await,
            Err(ValidatorError::CurrentRootUnset)
        ));

        assert!(matches!(
            validator.set_current_wasm_module_root(B256::ZERO),
            Err(ValidatorError::ZeroModuleRoot)
        ));
        validator.set_current_wasm_module_root(MOCK_MODULE_ROOT).unwrap();
        validator.initialize().await.unwrap();
        // Unchanged root is a no-op.
        validator.set_current_wasm_module_root(MOCK_MODULE_ROOT).unwrap();
        // Any other root is unexpected while tracking the chain.
        let other = B256::repeat_byte(0x22);
        assert!(matches!(
            validator.set_current_wasm_module_root(other),
            Err(ValidatorError::UnexpectedModuleRoot { .. })
        ));
    }

    #[tokio::test]
    async fn pending_root_upgrade_is_accepted() {
        let pending = B256::repeat_byte(0x33);
        let mut config = BlockValidatorConfig::for_testing();
        config.current_module_root = "current".into();
        config.pending_upgrade_module_root = format!("{pending}");
        let (validator, _ctx) = build_validator(default_counts(), config).await;

        validator.set_current_wasm_module_root(MOCK_MODULE_ROOT).unwrap();
        let stateless = validator.stateless();
        assert_eq!(
            stateless.module_roots_to_validate(),
            vec![MOCK_MODULE_ROOT, pending]
        );
        // Progressing to the pending root is a normal upgrade.
        validator.set_current_wasm_module_root(pending).unwrap();
        assert_eq!(stateless.current_wasm_module_root(), pending);
    }

    #[tokio::test]
    async fn persisted_last_validated_is_restored() {
        let (validator, ctx) =
            build_validator(default_counts(), BlockValidatorConfig::for_testing()).await;
        let gs = ctx.chain.gs_at_count(6);
        let info = GlobalStateValidatedInfo {
            global_state: gs,
            wasm_roots: vec![MOCK_MODULE_ROOT],
        };
        ctx.store.put(LAST_VALIDATED_KEY, &alloy_rlp::encode(&info)).unwrap();

        // A fresh pipeline over the same store picks the record up.
        let stateless = Arc::clone(validator.stateless());
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);
        let restored = BlockValidator::new(stateless, fatal_tx).unwrap();
        assert_eq!(restored.last_validated(), gs);
    }

    #[tokio::test]
    async fn reorg_to_batch_count_only_forces_reread() {
        let (validator, ctx) =
            build_validator(default_counts(), BlockValidatorConfig::for_testing()).await;
        let inner = &validator.inner;
        inner.lock_create().start_gs = ctx.chain.gs_at_count(6);
        inner.lock_create().batch_reread = false;

        // A later batch count leaves the creator alone.
        validator.reorg_to_batch_count(5).await;
        assert!(!inner.lock_create().batch_reread);
        // A batch at or below the creation batch forces a reread.
        validator.reorg_to_batch_count(2).await;
        assert!(inner.lock_create().batch_reread);
        assert_eq!(validator.created(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn validation_mismatch_publishes_fatal_error() {
        let (validator, mut ctx) =
            build_validator(default_counts(), BlockValidatorConfig::for_testing()).await;
        validator.initialize().await.unwrap();

        // Corrupt the pipeline's view of the chain after entry creation by
        // injecting a different last-valid start, so the replayed end state
        // disagrees with the recorded one.
        validator.start().await.unwrap();
        wait_until(|| validator.validated() > 1).await;

        // Force a mismatch: hand the head entry a wrong end expectation.
        {
            let inner = &validator.inner;
            let _write = inner.reorg_lock.write().await;
            let pos = inner.validated.load(Ordering::SeqCst);
            if let Some(status) = inner.lock_validations().get(&pos) {
                status.set_runs(vec![vigil_executor::ValidationRun::new(
                    vigil_util::Promise::resolved(GlobalState::new(
                        B256::repeat_byte(0xde),
                        B256::repeat_byte(0xad),
                        9,
                        9,
                    )),
                    MOCK_MODULE_ROOT,
                )]);
            }
        }

        // Either the pipeline already validated past the tampered entry or
        // the mismatch surfaces as a fatal error; accept the fatal path only.
        let got_fatal = tokio::time::timeout(Duration::from_secs(5), ctx.fatal_rx.recv())
            .await
            .ok()
            .flatten();
        validator.stop_and_wait().await;
        if let Some(err) = got_fatal {
            assert!(matches!(err, ValidatorError::Mismatch { .. }));
            assert!(!ctx.spawner.write_to_file_calls().is_empty());
        }
    }
}
