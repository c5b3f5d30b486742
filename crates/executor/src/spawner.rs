//! The asynchronous validation spawner facade.

use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use alloy_primitives::{Bytes, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};
use vigil_primitives::{BatchInfo, GlobalState, MachineStatus};
use vigil_util::{Promise, PromiseError};

use crate::{
    CachedExecutionRun, ExecutionRun, Machine, MachineCache, MachineCacheConfig, MachineError,
};

/// Everything a spawner backend needs to replay one message deterministically.
///
/// An input is self-contained: the preimage map, batch bytes and delayed
/// message cursor fully determine the replay, so the same input can be handed
/// to any backend for any module root.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ValidationInput {
    /// Message index this input replays.
    pub id: u64,
    /// Whether the replay reads a delayed message.
    pub has_delayed_msg: bool,
    /// Index of the delayed message read, when `has_delayed_msg`.
    pub delayed_msg_nr: u64,
    /// Recorded preimages (hash -> bytes) the replay resolves reads through.
    pub preimages: HashMap<B256, Bytes>,
    /// Sequencer batches the replay may read.
    pub batch_info: Vec<BatchInfo>,
    /// Global state the replay starts from.
    pub start_state: GlobalState,
}

/// Handle to one in-flight replay, yielding the terminal global state.
#[derive(Clone, Debug)]
pub struct ValidationRun {
    result: Promise<GlobalState>,
    wasm_module_root: B256,
}

impl ValidationRun {
    /// Creates a run handle over `result`.
    pub const fn new(result: Promise<GlobalState>, wasm_module_root: B256) -> Self {
        Self { result, wasm_module_root }
    }

    /// Module root this run validates against.
    pub const fn wasm_module_root(&self) -> B256 {
        self.wasm_module_root
    }

    /// True once the run has a result.
    pub fn ready(&self) -> bool {
        self.result.ready()
    }

    /// The run's result, if ready.
    pub fn current(&self) -> Result<GlobalState, PromiseError> {
        self.result.current()
    }

    /// Waits for the run's result.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<GlobalState, PromiseError> {
        self.result.wait(cancel).await
    }
}

/// An error from a validation spawner.
#[derive(Debug, Error)]
pub enum SpawnerError {
    /// The backend does not serve the requested module root.
    #[error("unsupported wasm module root {0}")]
    UnsupportedRoot(B256),
    /// The backend's machine failed.
    #[error(transparent)]
    Machine(#[from] MachineError),
    /// Filesystem failure while persisting a debug bundle.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Any other backend failure.
    #[error("{0}")]
    Other(String),
}

/// Asynchronous facade over a validator backend.
///
/// At most one replay in flight per `(input, module root)` pair is the
/// caller's responsibility; [`room`](Self::room) is a non-binding capacity
/// hint.
#[async_trait]
pub trait ValidationSpawner: std::fmt::Debug + Send + Sync + 'static {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Non-binding hint of spare replay capacity.
    fn room(&self) -> usize;

    /// Schedules a replay of `input` against `module_root`.
    fn launch(&self, input: Arc<ValidationInput>, module_root: B256) -> ValidationRun;

    /// Creates a long-lived execution session for challenge resolution.
    async fn create_execution_run(
        &self,
        module_root: B256,
        input: Arc<ValidationInput>,
    ) -> Result<Arc<dyn ExecutionRun>, SpawnerError>;

    /// The newest module root this backend can execute.
    async fn latest_wasm_module_root(&self) -> Result<B256, SpawnerError>;

    /// Persists a failed validation bundle for offline analysis.
    async fn write_to_file(
        &self,
        input: &ValidationInput,
        expected_end: GlobalState,
        module_root: B256,
    ) -> Result<(), SpawnerError>;
}

/// Instantiates machines for a [`LocalSpawner`].
#[async_trait]
pub trait MachineFactory: Send + Sync + 'static {
    /// Machine type produced by this factory.
    type Machine: Machine;

    /// Creates a machine at step zero for `input` under `module_root`.
    async fn create_machine(
        &self,
        module_root: B256,
        input: Arc<ValidationInput>,
    ) -> Result<Self::Machine, SpawnerError>;

    /// The newest module root this factory can load.
    async fn latest_module_root(&self) -> Result<B256, SpawnerError>;
}

/// Configuration for a [`LocalSpawner`].
#[derive(Clone, Debug)]
pub struct LocalSpawnerConfig {
    /// Replays the spawner will run concurrently; feeds the room hint.
    pub concurrent_runs: usize,
    /// Idle timeout after which unreferenced execution runs are closed.
    pub exec_run_timeout: Duration,
    /// Directory failed validation bundles are written to.
    pub output_path: PathBuf,
    /// Machine cache tuning for execution runs.
    pub machine_cache: MachineCacheConfig,
}

impl Default for LocalSpawnerConfig {
    fn default() -> Self {
        Self {
            concurrent_runs: 4,
            exec_run_timeout: Duration::from_secs(15 * 60),
            output_path: PathBuf::from("validation-debug"),
            machine_cache: MachineCacheConfig::default(),
        }
    }
}

/// An in-process spawner driving machines from a [`MachineFactory`].
pub struct LocalSpawner<F: MachineFactory> {
    factory: Arc<F>,
    config: LocalSpawnerConfig,
    tracker: TaskTracker,
    cancel: CancellationToken,
    running: Arc<AtomicUsize>,
}

impl<F: MachineFactory> fmt::Debug for LocalSpawner<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSpawner")
            .field("config", &self.config)
            .field("running", &self.running)
            .finish()
    }
}

struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<F: MachineFactory> LocalSpawner<F> {
    /// Creates a spawner over `factory`.
    pub fn new(factory: Arc<F>, config: LocalSpawnerConfig) -> Self {
        Self {
            factory,
            config,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Cancels all in-flight replays and waits for them to unwind.
    pub async fn stop_and_wait(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[async_trait]
impl<F: MachineFactory> ValidationSpawner for LocalSpawner<F> {
    fn name(&self) -> &str {
        "local"
    }

    fn room(&self) -> usize {
        self.config.concurrent_runs.saturating_sub(self.running.load(Ordering::SeqCst))
    }

    fn launch(&self, input: Arc<ValidationInput>, module_root: B256) -> ValidationRun {
        let factory = Arc::clone(&self.factory);
        let cancel = self.cancel.child_token();
        let guard = RunningGuard(Arc::clone(&self.running));
        self.running.fetch_add(1, Ordering::SeqCst);
        let promise = Promise::spawn(&self.tracker, cancel.clone(), async move {
            let _guard = guard;
            let mut machine = factory.create_machine(module_root, input).await?;
            while machine.is_running() {
                machine.advance(1 << 20, &cancel)?;
            }
            if machine.status() == MachineStatus::Errored {
                return Err(SpawnerError::Other("machine entered errored state".into()));
            }
            Ok(machine.global_state())
        });
        ValidationRun::new(promise, module_root)
    }

    async fn create_execution_run(
        &self,
        module_root: B256,
        input: Arc<ValidationInput>,
    ) -> Result<Arc<dyn ExecutionRun>, SpawnerError> {
        let machine = self.factory.create_machine(module_root, input).await?;
        let run = Arc::new(CachedExecutionRun::new(MachineCache::new(
            machine,
            self.config.machine_cache,
        )));
        // Reap the session if nothing touches it for the configured timeout.
        let timeout = self.config.exec_run_timeout;
        let reaped = Arc::clone(&run);
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(timeout) => {}
                }
                if !reaped.check_alive(timeout) {
                    info!(target: "spawner", "closing idle execution run");
                    reaped.close();
                    return;
                }
            }
        });
        Ok(run)
    }

    async fn latest_wasm_module_root(&self) -> Result<B256, SpawnerError> {
        self.factory.latest_module_root().await
    }

    async fn write_to_file(
        &self,
        input: &ValidationInput,
        expected_end: GlobalState,
        module_root: B256,
    ) -> Result<(), SpawnerError> {
        #[derive(Serialize)]
        struct DebugBundle<'a> {
            module_root: B256,
            expected_end: GlobalState,
            input: &'a ValidationInput,
        }
        std::fs::create_dir_all(&self.config.output_path)?;
        let path = self
            .config
            .output_path
            .join(format!("failed-validation-{}-{module_root}.json", input.id));
        let encoded = serde_json::to_vec_pretty(&DebugBundle {
            module_root,
            expected_end,
            input,
        })
        .map_err(|err| SpawnerError::Other(err.to_string()))?;
        if let Err(err) = std::fs::write(&path, encoded) {
            warn!(target: "spawner", ?path, %err, "failed writing validation debug bundle");
            return Err(err.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::CountingMachine;
    use alloy_primitives::b256;

    const MODULE_ROOT: B256 =
        b256!("0000000000000000000000000000000000000000000000000000000000a5a5a5");

    /// Builds counting machines whose end state is read back out of the
    /// input's start state, batch-shifted by one.
    #[derive(Debug)]
    struct CountingFactory;

    fn end_state_for(input: &ValidationInput) -> GlobalState {
        GlobalState::new(
            input.start_state.block_hash,
            input.start_state.send_root,
            input.start_state.batch + 1,
            0,
        )
    }

    #[async_trait]
    impl MachineFactory for CountingFactory {
        type Machine = CountingMachine;

        async fn create_machine(
            &self,
            module_root: B256,
            input: Arc<ValidationInput>,
        ) -> Result<CountingMachine, SpawnerError> {
            if module_root != MODULE_ROOT {
                return Err(SpawnerError::UnsupportedRoot(module_root));
            }
            Ok(CountingMachine::new(input.start_state, end_state_for(&input), 100))
        }

        async fn latest_module_root(&self) -> Result<B256, SpawnerError> {
            Ok(MODULE_ROOT)
        }
    }

    fn input() -> Arc<ValidationInput> {
        Arc::new(ValidationInput {
            id: 1,
            start_state: GlobalState::new(Default::default(), Default::default(), 1, 0),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn launch_yields_terminal_global_state() {
        let spawner = LocalSpawner::new(Arc::new(CountingFactory), LocalSpawnerConfig::default());
        let run = spawner.launch(input(), MODULE_ROOT);
        let end = run.wait(&CancellationToken::new()).await.unwrap();
        assert_eq!(end, end_state_for(&input()));
        assert_eq!(run.wasm_module_root(), MODULE_ROOT);
    }

    #[tokio::test]
    async fn launch_against_unknown_root_fails() {
        let spawner = LocalSpawner::new(Arc::new(CountingFactory), LocalSpawnerConfig::default());
        let run = spawner.launch(input(), B256::ZERO);
        assert!(run.wait(&CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn execution_run_replays_the_same_machine() {
        let spawner = LocalSpawner::new(Arc::new(CountingFactory), LocalSpawnerConfig::default());
        let run = spawner.create_execution_run(MODULE_ROOT, input()).await.unwrap();
        let last = run
            .get_last_step()
            .wait(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(last.global_state, end_state_for(&input()));
        run.close();
    }

    #[tokio::test]
    async fn write_to_file_persists_a_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            LocalSpawnerConfig { output_path: dir.path().to_path_buf(), ..Default::default() };
        let spawner = LocalSpawner::new(Arc::new(CountingFactory), config);
        let input = input();
        spawner.write_to_file(&input, end_state_for(&input), MODULE_ROOT).await.unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn room_shrinks_while_runs_are_in_flight() {
        let spawner = LocalSpawner::new(Arc::new(CountingFactory), LocalSpawnerConfig::default());
        assert_eq!(spawner.room(), 4);
        let run = spawner.launch(input(), MODULE_ROOT);
        let _ = run.wait(&CancellationToken::new()).await;
        // After completion the room recovers.
        assert_eq!(spawner.room(), 4);
    }
}
