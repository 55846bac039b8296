use crate::core::types::{EntityId, Frn, VolumeId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Malformed journal record at byte {offset}: {reason}")]
    MalformedRecord { offset: usize, reason: String },

    #[error("Journal discontinuity on volume '{volume}': {reason}")]
    JournalDiscontinuity { volume: VolumeId, reason: String },

    #[error("Resolution failed for {volume}:{frn}: {reason}")]
    ResolutionFailure {
        volume: VolumeId,
        frn: Frn,
        reason: String,
    },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Checkpoint inconsistency: {0}")]
    CheckpointInconsistency(String),

    #[error("Duplicate sequence {sequence_no} for entity '{entity_id}'")]
    DuplicateSequence {
        entity_id: EntityId,
        sequence_no: u64,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl PipelineError {
    /// Stable tag attached to structured log entries as `error_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedRecord { .. } => "malformed_record",
            Self::JournalDiscontinuity { .. } => "journal_discontinuity",
            Self::ResolutionFailure { .. } => "resolution_failure",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::CheckpointInconsistency(_) => "checkpoint_inconsistency",
            Self::DuplicateSequence { .. } => "duplicate_sequence",
            Self::NotFound(_) => "not_found",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Serialization(_) => "serialization",
            Self::Timeout(_) => "timeout",
            Self::LockError(_) => "lock_error",
        }
    }

    /// Errors that must halt the affected loop until an operator intervenes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CheckpointInconsistency(_) | Self::InvalidConfig(_)
        )
    }

    pub fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            offset,
            reason: reason.into(),
        }
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl<T> From<std::sync::PoisonError<T>> for PipelineError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
