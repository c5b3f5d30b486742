//! Per-challenge execution sessions over a [`MachineCache`].

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use alloy_primitives::{Bytes, B256};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use vigil_primitives::machine_finished_hash;
use vigil_util::Promise;

use crate::{Machine, MachineCache, MachineCacheError, MachineStepResult};

/// An error from an execution run operation.
#[derive(Debug, Error)]
pub enum ExecutionRunError {
    /// The run was closed while operations were pending.
    #[error("execution run closed")]
    Closed,
    /// The machine could not be brought to the requested position.
    #[error("machine is in wrong position want: {want}, got: {got}")]
    WrongPosition {
        /// Requested opcode position.
        want: u64,
        /// Position the machine actually reached.
        got: u64,
    },
    /// A zero step size or desired-leaf count was requested.
    #[error("invalid leaves query: step size {step_size}, desired {num_desired}")]
    InvalidLeavesQuery {
        /// Requested step size.
        step_size: u64,
        /// Requested number of leaves.
        num_desired: u64,
    },
    /// An error from the machine cache.
    #[error(transparent)]
    Cache(#[from] MachineCacheError),
}

/// A per-challenge session over a replay machine.
///
/// All operations are asynchronous and return single-shot promises; the
/// session stays usable for many queries until [`close`](Self::close)d.
pub trait ExecutionRun: Send + Sync {
    /// Hints the session to pre-advance snapshots across `[start, end]`.
    fn prepare_range(&self, start: u64, end: u64) -> Promise<()>;

    /// Returns the machine state at opcode `position`. `u64::MAX` yields the
    /// final step.
    fn get_step_at(&self, position: u64) -> Promise<MachineStepResult>;

    /// Returns the machine state at termination.
    fn get_last_step(&self) -> Promise<MachineStepResult> {
        self.get_step_at(u64::MAX)
    }

    /// Returns the one-step proof for the transition out of `position`.
    fn get_proof_at(&self, position: u64) -> Promise<Bytes>;

    /// Returns exactly `num_desired` hashes for positions
    /// `start_index + i * step_size`.
    ///
    /// A query starting at position 0 commits to the initial global state
    /// with its machine-finished hash (aligning with inbox machine roots);
    /// later entries are machine hashes. Once the machine terminates, the
    /// terminal machine-finished hash is emitted and repeated to pad the
    /// sequence to `num_desired`.
    fn get_leaves_in_range(
        &self,
        start_index: u64,
        end_index: u64,
        step_size: u64,
        num_desired: u64,
    ) -> Promise<Vec<B256>>;

    /// True if the session has been touched within `timeout`.
    fn check_alive(&self, timeout: Duration) -> bool;

    /// Closes the session. Idempotent; the underlying machine resources are
    /// released exactly once.
    fn close(&self);
}

/// [`ExecutionRun`] backed by a [`MachineCache`].
#[derive(Debug)]
pub struct CachedExecutionRun<M: Machine> {
    cache: Arc<AsyncMutex<Option<MachineCache<M>>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
    last_touch: Mutex<Instant>,
}

impl<M: Machine> CachedExecutionRun<M> {
    /// Creates a session owning `cache`.
    pub fn new(cache: MachineCache<M>) -> Self {
        Self {
            cache: Arc::new(AsyncMutex::new(Some(cache))),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
            last_touch: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_touch.lock().expect("touch lock poisoned") = Instant::now();
    }

    /// Rejects new operations once closed.
    fn guard_open<T: Clone + Send + 'static>(&self) -> Result<(), Promise<T>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Promise::failed(ExecutionRunError::Closed));
        }
        self.touch();
        Ok(())
    }
}

type SharedCache<M> = Arc<AsyncMutex<Option<MachineCache<M>>>>;

async fn with_cache<M, T>(
    cache: &SharedCache<M>,
    f: impl FnOnce(&mut MachineCache<M>) -> Result<T, ExecutionRunError>,
) -> Result<T, ExecutionRunError>
where
    M: Machine,
{
    let mut guard = cache.lock().await;
    let cache = guard.as_mut().ok_or(ExecutionRunError::Closed)?;
    f(cache)
}

impl<M: Machine> ExecutionRun for CachedExecutionRun<M> {
    fn prepare_range(&self, start: u64, end: u64) -> Promise<()> {
        if let Err(failed) = self.guard_open() {
            return failed;
        }
        let cache = Arc::clone(&self.cache);
        let cancel = self.cancel.clone();
        Promise::spawn(&self.tracker, self.cancel.clone(), async move {
            with_cache(&cache, |cache| Ok(cache.set_range(start, end, &cancel)?)).await
        })
    }

    fn get_step_at(&self, position: u64) -> Promise<MachineStepResult> {
        if let Err(failed) = self.guard_open() {
            return failed;
        }
        let cache = Arc::clone(&self.cache);
        let cancel = self.cancel.clone();
        Promise::spawn(&self.tracker, self.cancel.clone(), async move {
            with_cache(&cache, |cache| {
                let machine = if position == u64::MAX {
                    cache.get_final_machine(&cancel)?
                } else {
                    cache.get_machine_at(position, &cancel)?
                };
                let step = machine.step_count();
                if position != u64::MAX
                    && position != step
                    && (machine.is_running() || step > position)
                {
                    return Err(ExecutionRunError::WrongPosition { want: position, got: step });
                }
                Ok(MachineStepResult {
                    position: step,
                    status: machine.status(),
                    global_state: machine.global_state(),
                    hash: machine.hash(),
                })
            })
            .await
        })
    }

    fn get_proof_at(&self, position: u64) -> Promise<Bytes> {
        if let Err(failed) = self.guard_open() {
            return failed;
        }
        let cache = Arc::clone(&self.cache);
        let cancel = self.cancel.clone();
        Promise::spawn(&self.tracker, self.cancel.clone(), async move {
            with_cache(&cache, |cache| {
                Ok(cache.get_machine_at(position, &cancel)?.prove_next_step())
            })
            .await
        })
    }

    fn get_leaves_in_range(
        &self,
        start_index: u64,
        end_index: u64,
        step_size: u64,
        num_desired: u64,
    ) -> Promise<Vec<B256>> {
        if let Err(failed) = self.guard_open() {
            return failed;
        }
        let cache = Arc::clone(&self.cache);
        let cancel = self.cancel.clone();
        Promise::spawn(&self.tracker, self.cancel.clone(), async move {
            if step_size == 0 || num_desired == 0 {
                return Err(ExecutionRunError::InvalidLeavesQuery { step_size, num_desired });
            }
            with_cache(&cache, |cache| {
                cache.set_range(start_index, end_index.max(start_index), &cancel)?;
                let mut leaves = Vec::with_capacity(num_desired as usize);
                for i in 0..num_desired {
                    let position = start_index + i * step_size;
                    let machine = cache.get_machine_at(position, &cancel)?;
                    if i == 0 && start_index == 0 {
                        leaves.push(machine_finished_hash(&machine.global_state()));
                        continue;
                    }
                    if machine.is_running() {
                        leaves.push(machine.hash());
                    } else {
                        leaves.push(machine_finished_hash(&machine.global_state()));
                        break;
                    }
                }
                if let Some(&last) = leaves.last() {
                    leaves.resize(num_desired as usize, last);
                }
                Ok(leaves)
            })
            .await
        })
    }

    fn check_alive(&self, timeout: Duration) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.last_touch.lock().expect("touch lock poisoned").elapsed() < timeout
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let cache = Arc::clone(&self.cache);
        self.tracker.spawn(async move {
            // Taking the cache out drops the machines exactly once; pending
            // operations observe `Closed` afterwards.
            cache.lock().await.take();
        });
        self.tracker.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_utils::CountingMachine, MachineCacheConfig};
    use vigil_primitives::{GlobalState, MachineStatus};

    const END_STEP: u64 = 100;

    fn start_state() -> GlobalState {
        GlobalState::new(Default::default(), Default::default(), 1, 0)
    }

    fn end_state() -> GlobalState {
        GlobalState::new(Default::default(), Default::default(), 2, 0)
    }

    fn new_run() -> CachedExecutionRun<CountingMachine> {
        let machine = CountingMachine::new(start_state(), end_state(), END_STEP);
        CachedExecutionRun::new(MachineCache::new(machine, MachineCacheConfig::default()))
    }

    async fn await_promise<T: Clone>(promise: Promise<T>) -> T {
        promise.wait(&CancellationToken::new()).await.unwrap()
    }

    #[tokio::test]
    async fn get_step_at_returns_position_state() {
        let run = new_run();
        let step = await_promise(run.get_step_at(10)).await;
        assert_eq!(step.position, 10);
        assert_eq!(step.status, MachineStatus::Running);
        assert_eq!(step.global_state, start_state());
    }

    #[tokio::test]
    async fn max_position_yields_final_step() {
        let run = new_run();
        let step = await_promise(run.get_last_step()).await;
        assert_eq!(step.position, END_STEP);
        assert_eq!(step.status, MachineStatus::Finished);
        assert_eq!(step.global_state, end_state());
    }

    #[tokio::test]
    async fn leaves_start_with_machine_finished_hash_of_initial_state() {
        let run = new_run();
        let leaves = await_promise(run.get_leaves_in_range(0, 40, 10, 5)).await;
        assert_eq!(leaves.len(), 5);
        assert_eq!(leaves[0], machine_finished_hash(&start_state()));
        // Interior leaves are machine hashes at 10, 20, 30, 40.
        for (i, leaf) in leaves.iter().enumerate().skip(1) {
            assert_eq!(*leaf, alloy_primitives::keccak256((i as u64 * 10).to_be_bytes()));
        }
    }

    #[tokio::test]
    async fn leaves_pad_past_termination() {
        let run = new_run();
        // Positions 90, 140, 190, ...: the machine halts at 100.
        let leaves = await_promise(run.get_leaves_in_range(90, 290, 50, 5)).await;
        assert_eq!(leaves.len(), 5);
        let terminal = machine_finished_hash(&end_state());
        assert_eq!(leaves[1], terminal);
        assert_eq!(leaves[2], terminal);
        assert_eq!(leaves[4], terminal);
    }

    #[tokio::test]
    async fn proof_comes_from_requested_position() {
        let run = new_run();
        let proof = await_promise(run.get_proof_at(5)).await;
        assert_eq!(proof, Bytes::from("proof at 5".as_bytes().to_vec()));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_new_operations() {
        let run = new_run();
        run.close();
        run.close();
        let result = run.get_step_at(0).wait(&CancellationToken::new()).await;
        assert!(result.is_err());
        assert!(!run.check_alive(Duration::from_secs(60)));
    }
}
