//! Block validator configuration.

use std::time::Duration;

/// Configuration for the [`BlockValidator`](crate::BlockValidator).
#[derive(Clone, Debug)]
pub struct BlockValidatorConfig {
    /// Gates the pipeline entirely.
    pub enable: bool,
    /// Idle-loop poll interval.
    pub validation_poll: Duration,
    /// Maximum distance the creation cursor may run ahead of validation.
    pub forward_blocks: u64,
    /// Maximum distance the prerecord window may run ahead of validation.
    pub prerecorded_blocks: u64,
    /// `"latest"` (query the executor), `"current"` (must be injected from
    /// chain) or a hex module-root hash.
    pub current_module_root: String,
    /// Pending upgrade root, same grammar; empty disables.
    pub pending_upgrade_module_root: String,
    /// Whether a validation mismatch is a fatal error.
    pub failure_is_fatal: bool,
    /// Options that can lose validation progress.
    pub dangerous: DangerousConfig,
}

/// Dangerous block validator options.
#[derive(Clone, Debug, Default)]
pub struct DangerousConfig {
    /// Ignore the persisted last-valid record on start, beginning again from
    /// genesis. Injected module roots are preserved.
    pub reset_block_validation: bool,
}

impl Default for BlockValidatorConfig {
    fn default() -> Self {
        Self {
            enable: false,
            validation_poll: Duration::from_secs(1),
            forward_blocks: 1024,
            prerecorded_blocks: 128,
            current_module_root: "current".into(),
            pending_upgrade_module_root: "latest".into(),
            failure_is_fatal: true,
            dangerous: DangerousConfig::default(),
        }
    }
}

impl BlockValidatorConfig {
    /// A tight-polling configuration for tests.
    pub fn for_testing() -> Self {
        Self {
            enable: true,
            validation_poll: Duration::from_millis(50),
            forward_blocks: 128,
            prerecorded_blocks: 64,
            current_module_root: "latest".into(),
            pending_upgrade_module_root: String::new(),
            failure_is_fatal: true,
            dangerous: DangerousConfig::default(),
        }
    }
}
