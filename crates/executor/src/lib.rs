//! Deterministic replay machine sessions and validation spawners.
//!
//! The replay VM itself is an external collaborator: this crate consumes it
//! through the [`Machine`] capability trait and builds the pieces the
//! validator and the challenge state provider need on top of it — a
//! position-addressable [`MachineCache`], per-challenge [`ExecutionRun`]
//! sessions, and the asynchronous [`ValidationSpawner`] facade.

mod machine;
pub use machine::{Machine, MachineError, MachineStepResult};

mod cache;
pub use cache::{MachineCache, MachineCacheConfig, MachineCacheError};

mod run;
pub use run::{CachedExecutionRun, ExecutionRun, ExecutionRunError};

mod spawner;
pub use spawner::{
    LocalSpawner, LocalSpawnerConfig, MachineFactory, SpawnerError, ValidationInput, ValidationRun,
    ValidationSpawner,
};

#[cfg(test)]
pub(crate) mod test_utils;
