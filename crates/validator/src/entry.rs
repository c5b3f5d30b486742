//! Validation entries and their status state machine.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex, OnceLock,
};

use alloy_primitives::Bytes;
use derive_more::Display;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use vigil_executor::{ValidationInput, ValidationRun};
use vigil_primitives::{BatchInfo, GlobalState, MessageIndex, MessageWithMetadata};

use crate::RecordResult;

/// An error from a validation entry.
#[derive(Debug, Clone, Error)]
pub enum EntryError {
    /// The start and end states do not describe adjacent messages.
    #[error("global states not adjacent: start {start:?}, end {end:?}")]
    NotAdjacent {
        /// Claimed start state.
        start: GlobalState,
        /// Claimed end state.
        end: GlobalState,
    },
    /// `to_input` was called before the entry was recorded.
    #[error("validation entry for message {0} has not been recorded")]
    NotRecorded(MessageIndex),
    /// `record` was called twice.
    #[error("validation entry for message {0} already recorded")]
    AlreadyRecorded(MessageIndex),
}

/// Stage of a validation entry within the pipeline.
///
/// Transitions are monotonic except `RecordSent -> RecordFailed`, which is
/// retried through a reorg.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum ValidationStatusKind {
    /// Entry created, recording not yet requested.
    Created = 0,
    /// A recording request is in flight.
    RecordSent = 1,
    /// Recording failed; the pipeline will reorg to retry.
    RecordFailed = 2,
    /// Preimages are attached; the entry is ready to validate.
    Prepared = 3,
    /// Validation launch is in progress.
    SendingValidation = 4,
    /// Validation runs are in flight.
    ValidationSent = 5,
}

impl ValidationStatusKind {
    fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::RecordSent,
            2 => Self::RecordFailed,
            3 => Self::Prepared,
            4 => Self::SendingValidation,
            _ => Self::ValidationSent,
        }
    }

    /// Whether `self -> next` is a permitted transition.
    const fn permits(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::RecordSent)
                | (Self::RecordSent, Self::RecordFailed)
                | (Self::RecordSent, Self::Prepared)
                | (Self::Prepared, Self::SendingValidation)
                | (Self::SendingValidation, Self::ValidationSent)
        )
    }
}

/// Per-message validation state, shared between the worker loops.
#[derive(Debug)]
pub struct ValidationStatus {
    status: AtomicU32,
    entry: Arc<ValidationEntry>,
    cancel: Mutex<Option<CancellationToken>>,
    runs: Mutex<Vec<ValidationRun>>,
}

impl ValidationStatus {
    /// Creates a status in the `Created` stage.
    pub fn new(entry: ValidationEntry) -> Self {
        Self {
            status: AtomicU32::new(ValidationStatusKind::Created as u32),
            entry: Arc::new(entry),
            cancel: Mutex::new(None),
            runs: Mutex::new(Vec::new()),
        }
    }

    /// Current stage.
    pub fn kind(&self) -> ValidationStatusKind {
        ValidationStatusKind::from_u32(self.status.load(Ordering::SeqCst))
    }

    /// Compare-and-set transition. Exactly one caller can win any given
    /// transition; transitions the state machine does not permit always fail.
    pub fn replace(&self, old: ValidationStatusKind, new: ValidationStatusKind) -> bool {
        old.permits(new)
            && self
                .status
                .compare_exchange(old as u32, new as u32, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    /// The entry being validated.
    pub fn entry(&self) -> &Arc<ValidationEntry> {
        &self.entry
    }

    /// Attaches the cancel handle for the in-flight validation.
    pub fn set_cancel(&self, token: CancellationToken) {
        *self.cancel.lock().expect("cancel lock poisoned") = Some(token);
    }

    /// Cancels the in-flight validation, if any.
    pub fn cancel(&self) {
        if let Some(token) = self.cancel.lock().expect("cancel lock poisoned").take() {
            token.cancel();
        }
    }

    /// Attaches the per-module-root run handles.
    pub fn set_runs(&self, runs: Vec<ValidationRun>) {
        *self.runs.lock().expect("runs lock poisoned") = runs;
    }

    /// The attached run handles.
    pub fn runs(&self) -> Vec<ValidationRun> {
        self.runs.lock().expect("runs lock poisoned").clone()
    }
}

/// Preimages and batches attached to an entry by the record stage.
#[derive(Clone, Debug, Default)]
pub struct Recording {
    /// Preimages (hash -> bytes) sufficient for deterministic replay.
    pub preimages: std::collections::HashMap<alloy_primitives::B256, Bytes>,
    /// All batches the replay reads, including the entry's own.
    pub batch_info: Vec<BatchInfo>,
}

/// An immutable description of one message validation.
///
/// Created by the create stage, populated once by the record stage, consumed
/// by the validate stage and destroyed on reorg past its position or on
/// successful validation.
#[derive(Debug)]
pub struct ValidationEntry {
    /// Message index being validated.
    pub pos: MessageIndex,
    /// Global state before the message.
    pub start: GlobalState,
    /// Expected global state after the message.
    pub end: GlobalState,
    /// The message payload.
    pub msg: MessageWithMetadata,
    /// Sequencer batch bytes for `start.batch`.
    pub batch: Bytes,
    /// Delayed-message count before this message.
    pub prev_delayed: u64,
    recording: OnceLock<Recording>,
}

impl ValidationEntry {
    /// Creates an entry, enforcing that `start` and `end` describe adjacent
    /// messages: either the next position in the same batch, or position zero
    /// of the next batch.
    pub fn new(
        pos: MessageIndex,
        start: GlobalState,
        end: GlobalState,
        msg: MessageWithMetadata,
        batch: Bytes,
        prev_delayed: u64,
    ) -> Result<Self, EntryError> {
        let same_batch = end.batch == start.batch && end.pos_in_batch == start.pos_in_batch + 1;
        let next_batch = end.batch == start.batch + 1 && end.pos_in_batch == 0;
        if !same_batch && !next_batch {
            return Err(EntryError::NotAdjacent { start, end });
        }
        Ok(Self { pos, start, end, msg, batch, prev_delayed, recording: OnceLock::new() })
    }

    /// Attaches the record stage's output. Succeeds exactly once.
    pub fn record(&self, result: RecordResult) -> Result<(), EntryError> {
        let mut batch_info = vec![BatchInfo { number: self.start.batch, data: self.batch.clone() }];
        batch_info.extend(result.batch_info);
        let recording = Recording { preimages: result.preimages, batch_info };
        self.recording.set(recording).map_err(|_| EntryError::AlreadyRecorded(self.pos))
    }

    /// True once the record stage has run.
    pub fn is_recorded(&self) -> bool {
        self.recording.get().is_some()
    }

    /// Builds the self-contained replay input.
    ///
    /// Pure over the entry's contents; fails before recording.
    pub fn to_input(&self) -> Result<ValidationInput, EntryError> {
        let recording = self.recording.get().ok_or(EntryError::NotRecorded(self.pos))?;
        let has_delayed_msg = self.msg.delayed_messages_read > self.prev_delayed;
        Ok(ValidationInput {
            id: self.pos,
            has_delayed_msg,
            delayed_msg_nr: self.msg.delayed_messages_read.saturating_sub(1),
            preimages: recording.preimages.clone(),
            batch_info: recording.batch_info.clone(),
            start_state: self.start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;

    fn gs(batch: u64, pos: u64) -> GlobalState {
        GlobalState::new(B256::ZERO, B256::ZERO, batch, pos)
    }

    fn entry(start: GlobalState, end: GlobalState) -> Result<ValidationEntry, EntryError> {
        ValidationEntry::new(5, start, end, MessageWithMetadata::default(), Bytes::new(), 0)
    }

    #[test]
    fn accepts_adjacent_states() {
        assert!(entry(gs(1, 3), gs(1, 4)).is_ok());
        assert!(entry(gs(1, 3), gs(2, 0)).is_ok());
    }

    #[test]
    fn rejects_non_adjacent_states() {
        assert!(entry(gs(1, 3), gs(1, 5)).is_err());
        assert!(entry(gs(1, 3), gs(3, 0)).is_err());
        assert!(entry(gs(1, 3), gs(2, 1)).is_err());
    }

    #[test]
    fn to_input_requires_recording() {
        let entry = entry(gs(1, 0), gs(1, 1)).unwrap();
        assert!(matches!(entry.to_input(), Err(EntryError::NotRecorded(5))));
        entry.record(RecordResult::default()).unwrap();
        let input = entry.to_input().unwrap();
        assert_eq!(input.id, 5);
        assert_eq!(input.start_state, gs(1, 0));
        // The entry's own batch always leads the batch info.
        assert_eq!(input.batch_info[0].number, 1);
        // Recording twice is rejected.
        assert!(matches!(
            entry.record(RecordResult::default()),
            Err(EntryError::AlreadyRecorded(5))
        ));
    }

    #[test]
    fn status_cas_rejects_unpermitted_transitions() {
        use ValidationStatusKind::*;
        let status = ValidationStatus::new(entry(gs(1, 0), gs(1, 1)).unwrap());
        assert_eq!(status.kind(), Created);
        // Cannot jump straight to validation.
        assert!(!status.replace(Created, ValidationSent));
        assert!(!status.replace(Created, Prepared));
        // The legal path works, one step at a time.
        assert!(status.replace(Created, RecordSent));
        assert!(!status.replace(Created, RecordSent));
        assert!(status.replace(RecordSent, Prepared));
        assert!(status.replace(Prepared, SendingValidation));
        assert!(status.replace(SendingValidation, ValidationSent));
        assert_eq!(status.kind(), ValidationSent);
        // Terminal states do not go backwards.
        assert!(!status.replace(ValidationSent, Created));
    }

    #[test]
    fn record_failure_branch_is_permitted() {
        use ValidationStatusKind::*;
        let status = ValidationStatus::new(entry(gs(1, 0), gs(1, 1)).unwrap());
        assert!(status.replace(Created, RecordSent));
        assert!(status.replace(RecordSent, RecordFailed));
        // A failed recording cannot be prepared.
        assert!(!status.replace(RecordFailed, Prepared));
    }
}
