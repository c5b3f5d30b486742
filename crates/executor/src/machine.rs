//! Capability trait for the external deterministic replay VM.

use alloy_primitives::{Bytes, B256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use vigil_primitives::{GlobalState, MachineStatus};

/// An error from the underlying VM.
#[derive(Debug, Error)]
pub enum MachineError {
    /// Stepping was interrupted by cancellation.
    #[error("machine execution interrupted")]
    Interrupted,
    /// The VM failed deterministically.
    #[error("deterministic execution failed: {0}")]
    Execution(String),
}

/// A deterministic replay machine, stepped by opcode position.
///
/// Implementations wrap the actual VM binary identified by a wasm module
/// root. Dropping a machine releases it; implementations must make drop-based
/// cleanup safe on every exit path.
pub trait Machine: Send + std::fmt::Debug + 'static {
    /// Number of opcodes executed so far.
    fn step_count(&self) -> u64;

    /// Current execution status.
    fn status(&self) -> MachineStatus;

    /// True while the machine has more steps to execute.
    fn is_running(&self) -> bool {
        self.status() == MachineStatus::Running
    }

    /// Commitment to the machine's full internal state.
    fn hash(&self) -> B256;

    /// The machine's global state. Only meaningful after termination.
    fn global_state(&self) -> GlobalState;

    /// Opaque one-step proof for the transition out of the current position.
    fn prove_next_step(&self) -> Bytes;

    /// Executes up to `num_steps` opcodes, stopping early on termination.
    ///
    /// Implementations must observe `cancel` at a reasonable granularity and
    /// return [`MachineError::Interrupted`] when it fires.
    fn advance(&mut self, num_steps: u64, cancel: &CancellationToken) -> Result<(), MachineError>;

    /// Cheap copy-on-write snapshot of the machine at its current position.
    fn fork(&self) -> Self
    where
        Self: Sized;
}

/// The observable state of a machine at one position, as returned by
/// [`ExecutionRun::get_step_at`](crate::ExecutionRun::get_step_at).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MachineStepResult {
    /// Opcode position of the machine.
    pub position: u64,
    /// Execution status at that position.
    pub status: MachineStatus,
    /// Global state at that position.
    pub global_state: GlobalState,
    /// Machine hash at that position.
    pub hash: B256,
}
