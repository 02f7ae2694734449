//! Error types for gate operations

/// Errors from the gate bank.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The gate's semaphore was closed; no further permits will be issued.
    #[error("gate closed: {0}")]
    Closed(String),
}

/// Result alias for gate operations.
pub type Result<T> = std::result::Result<T, Error>;
