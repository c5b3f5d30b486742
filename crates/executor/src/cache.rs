//! A position-addressable cache over a single replay machine.

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{Machine, MachineError};

/// Configuration for a [`MachineCache`].
#[derive(Clone, Copy, Debug)]
pub struct MachineCacheConfig {
    /// Number of interior snapshots kept between the range bounds.
    pub cached_machines: usize,
    /// Step granularity used when advancing towards the final machine.
    pub initial_steps: u64,
}

impl Default for MachineCacheConfig {
    fn default() -> Self {
        Self { cached_machines: 16, initial_steps: 100_000 }
    }
}

/// An error from the [`MachineCache`].
#[derive(Debug, Error)]
pub enum MachineCacheError {
    /// `set_range` was called with `end < start`.
    #[error("invalid machine range: {start}..{end}")]
    InvalidRange {
        /// Requested range start.
        start: u64,
        /// Requested range end.
        end: u64,
    },
    /// A position below the cache's restricted lower bound was requested.
    #[error("position {position} is before the cache lower bound {lower_bound}")]
    BeforeRange {
        /// Requested position.
        position: u64,
        /// Current lower bound of the cache.
        lower_bound: u64,
    },
    /// The underlying VM failed.
    #[error(transparent)]
    Machine(#[from] MachineError),
}

/// Holds and advances a deterministic replay machine, answering "give me the
/// machine at absolute step N" queries.
///
/// The cache keeps a ladder of forked snapshots between its range bounds so
/// that repeated queries within a bisection window do not re-execute from the
/// start. [`MachineCache::set_range`] restricts the lower bound: afterwards,
/// positions before the range start are unreachable and rejected.
#[derive(Debug)]
pub struct MachineCache<M: Machine> {
    /// Snapshots sorted by step count; the first sits at the lower bound.
    machines: Vec<M>,
    /// The machine at termination, once computed.
    final_machine: Option<M>,
    /// The most recently returned machine, reusable as an advance base.
    last_machine: Option<M>,
    lower_bound: u64,
    config: MachineCacheConfig,
}

impl<M: Machine> MachineCache<M> {
    /// Creates a cache rooted at `initial`.
    pub fn new(initial: M, config: MachineCacheConfig) -> Self {
        Self {
            lower_bound: initial.step_count(),
            machines: vec![initial],
            final_machine: None,
            last_machine: None,
            config,
        }
    }

    /// Lowest position this cache can still answer for.
    pub const fn lower_bound(&self) -> u64 {
        self.lower_bound
    }

    /// Pre-advances interior snapshots across `[start, end]` so subsequent
    /// [`get_machine_at`](Self::get_machine_at) queries inside the range are
    /// cheap. Restricts the cache's lower bound to `start`.
    pub fn set_range(
        &mut self,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
    ) -> Result<(), MachineCacheError> {
        if end < start {
            return Err(MachineCacheError::InvalidRange { start, end });
        }
        let mut base = self.fork_nearest(start)?;
        if base.step_count() < start && base.is_running() {
            base.advance(start - base.step_count(), cancel)?;
        }

        let interval = ((end - start) / self.config.cached_machines.max(1) as u64).max(1);
        let mut ladder = vec![base.fork()];
        while base.step_count() < end && base.is_running() {
            let target = (base.step_count() + interval).min(end);
            base.advance(target - base.step_count(), cancel)?;
            if !base.is_running() {
                self.final_machine = Some(base.fork());
            }
            ladder.push(base.fork());
        }
        self.machines = ladder;
        self.last_machine = None;
        self.lower_bound = start;
        Ok(())
    }

    /// Returns the machine at absolute step `position`.
    ///
    /// On return, `step_count() == position` if and only if the machine is
    /// still running there; a machine that terminated earlier is returned at
    /// its terminal step with status `Finished`.
    pub fn get_machine_at(
        &mut self,
        position: u64,
        cancel: &CancellationToken,
    ) -> Result<&M, MachineCacheError> {
        if position < self.lower_bound {
            return Err(MachineCacheError::BeforeRange {
                position,
                lower_bound: self.lower_bound,
            });
        }
        let mut machine = self.fork_nearest(position)?;
        if machine.step_count() < position && machine.is_running() {
            machine.advance(position - machine.step_count(), cancel)?;
        }
        Ok(self.last_machine.insert(machine))
    }

    /// Returns the machine at termination, advancing to it if necessary.
    pub fn get_final_machine(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<&M, MachineCacheError> {
        if self.final_machine.is_none() {
            let mut machine = match self.machines.last() {
                Some(m) => m.fork(),
                None => {
                    return Err(MachineCacheError::BeforeRange {
                        position: u64::MAX,
                        lower_bound: self.lower_bound,
                    })
                }
            };
            while machine.is_running() {
                machine.advance(self.config.initial_steps.max(1), cancel)?;
            }
            self.final_machine = Some(machine);
        }
        // Populated just above on the None path.
        Ok(self.final_machine.as_ref().expect("final machine populated"))
    }

    /// Forks the best available snapshot at or below `position`, preferring
    /// the most recently returned machine when it is further along.
    fn fork_nearest(&mut self, position: u64) -> Result<M, MachineCacheError> {
        let ladder_idx = self.machines.partition_point(|m| m.step_count() <= position);
        if ladder_idx == 0 {
            return Err(MachineCacheError::BeforeRange {
                position,
                lower_bound: self.lower_bound,
            });
        }
        let ladder_steps = self.machines[ladder_idx - 1].step_count();
        match self.last_machine.take() {
            Some(last)
                if last.step_count() <= position && last.step_count() >= ladder_steps =>
            {
                Ok(last)
            }
            other => {
                self.last_machine = other;
                Ok(self.machines[ladder_idx - 1].fork())
            }
        }
    }
}
