//! Error types for engine operations

use crate::model::{JobId, JobStatus};
use crate::progress::RunId;

/// Errors from engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// At most one non-terminal job may exist per source batch.
    #[error("job {existing} is already active for source {source_ref}")]
    DuplicateJob { source_ref: String, existing: JobId },

    #[error("job {id} cannot {action} while {}", .status.label())]
    InvalidState {
        id: JobId,
        action: &'static str,
        status: JobStatus,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("repository error: {0}")]
    Repository(String),

    #[error(transparent)]
    Gate(#[from] rate_gate::Error),
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
