//! Error types for key pool operations

use chrono::{DateTime, Utc};

/// Errors from key pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Every credential is exhausted or disabled. Terminal until `reset_all`.
    #[error("all keys exhausted, next reset at {reset_at}")]
    AllExhausted { reset_at: DateTime<Utc> },

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("exhaustion ledger error: {0}")]
    Ledger(String),

    #[error("invalid reset schedule: {0}")]
    Schedule(String),
}

/// Result alias for key pool operations.
pub type Result<T> = std::result::Result<T, Error>;
