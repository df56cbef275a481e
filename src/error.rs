//! Pipeline error taxonomy.
//!
//! Per-record errors (`MalformedRecord`, `Normalization`) are counted by the
//! orchestrator and never abort a run. Everything else is fatal to the run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("malformed record {external_id:?}: {reason}")]
    MalformedRecord {
        external_id: Option<String>,
        reason: String,
    },

    #[error("cannot normalize field `{field}`: {reason}")]
    Normalization { field: &'static str, reason: String },

    #[error("persistence conflict: {0}")]
    PersistenceConflict(#[from] sqlx::Error),

    #[error("another import is already running for source `{source_name}`")]
    ConcurrentRunDetected { source_name: String },
}

impl PipelineError {
    /// True for single-record failures the run recovers from.
    pub fn is_per_record(&self) -> bool {
        matches!(
            self,
            PipelineError::MalformedRecord { .. } | PipelineError::Normalization { .. }
        )
    }
}
