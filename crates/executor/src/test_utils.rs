//! Test doubles shared by this crate's unit tests.

use alloy_primitives::{keccak256, Bytes, B256};
use tokio_util::sync::CancellationToken;
use vigil_primitives::{GlobalState, MachineStatus};

use crate::{Machine, MachineError};

/// A machine that runs for a fixed number of steps, hashing its position.
#[derive(Clone, Debug)]
pub(crate) struct CountingMachine {
    start_state: GlobalState,
    end_state: GlobalState,
    end_step: u64,
    step: u64,
}

impl CountingMachine {
    pub(crate) fn new(start_state: GlobalState, end_state: GlobalState, end_step: u64) -> Self {
        Self { start_state, end_state, end_step, step: 0 }
    }
}

impl Machine for CountingMachine {
    fn step_count(&self) -> u64 {
        self.step
    }

    fn status(&self) -> MachineStatus {
        if self.step >= self.end_step {
            MachineStatus::Finished
        } else {
            MachineStatus::Running
        }
    }

    fn hash(&self) -> B256 {
        keccak256(self.step.to_be_bytes())
    }

    fn global_state(&self) -> GlobalState {
        if self.step >= self.end_step {
            self.end_state
        } else {
            self.start_state
        }
    }

    fn prove_next_step(&self) -> Bytes {
        Bytes::from(format!("proof at {}", self.step).into_bytes())
    }

    fn advance(&mut self, num_steps: u64, cancel: &CancellationToken) -> Result<(), MachineError> {
        if cancel.is_cancelled() {
            return Err(MachineError::Interrupted);
        }
        self.step = (self.step + num_steps).min(self.end_step);
        Ok(())
    }

    fn fork(&self) -> Self {
        self.clone()
    }
}
