//! Shared types for the publish worker workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::{Secret, split_secret_list};
