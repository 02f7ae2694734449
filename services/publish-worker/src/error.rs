//! Service-specific error types

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the command line surface. Engine and config failures keep
/// their own types and are wrapped with context by `main`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot derive a batch name from {}; pass --source", .0.display())]
    NoSourceRef(PathBuf),

    #[error("failed to import products from {}: {reason}", .path.display())]
    Import { path: PathBuf, reason: String },
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;
