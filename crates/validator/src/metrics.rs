//! Metric names produced by the block validator.

/// Container for the validator's metric names.
#[derive(Debug, Clone, Copy)]
pub struct Metrics;

impl Metrics {
    /// Gauge: validations currently in flight.
    pub const VALIDATIONS_PENDING: &'static str = "vigil_validator_validations_pending";
    /// Counter: validations that matched the chain.
    pub const VALIDATIONS_VALID: &'static str = "vigil_validator_validations_valid_total";
    /// Counter: validations that disagreed with the chain.
    pub const VALIDATIONS_FAILED: &'static str = "vigil_validator_validations_failed_total";
    /// Gauge: message count validated so far.
    pub const MSG_COUNT_VALIDATED: &'static str = "vigil_validator_msg_count_validated";
    /// Gauge: message count of the batch currently being created against.
    pub const MSG_COUNT_CURRENT_BATCH: &'static str = "vigil_validator_msg_count_current_batch";

    /// Describes all validator metrics. Call once at startup if metric
    /// descriptions are desired for observers like Prometheus.
    pub fn describe() {
        metrics::describe_gauge!(
            Self::VALIDATIONS_PENDING,
            metrics::Unit::Count,
            "Validations currently in flight across all spawners"
        );
        metrics::describe_counter!(
            Self::VALIDATIONS_VALID,
            metrics::Unit::Count,
            "Total validations whose replay matched the chain"
        );
        metrics::describe_counter!(
            Self::VALIDATIONS_FAILED,
            metrics::Unit::Count,
            "Total validations whose replay disagreed with the chain"
        );
        metrics::describe_gauge!(
            Self::MSG_COUNT_VALIDATED,
            metrics::Unit::Count,
            "Message count validated so far"
        );
        metrics::describe_gauge!(
            Self::MSG_COUNT_CURRENT_BATCH,
            metrics::Unit::Count,
            "Message count of the batch the creator is reading"
        );
    }
}

/// RAII guard keeping the pending-validations gauge balanced on every exit
/// path of a validation task.
#[derive(Debug)]
pub(crate) struct PendingValidationGuard;

impl PendingValidationGuard {
    pub(crate) fn acquire() -> Self {
        metrics::gauge!(Metrics::VALIDATIONS_PENDING).increment(1.0);
        Self
    }
}

impl Drop for PendingValidationGuard {
    fn drop(&mut self) {
        metrics::gauge!(Metrics::VALIDATIONS_PENDING).decrement(1.0);
    }
}
