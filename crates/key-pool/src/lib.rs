//! Credential rotation for quota-limited services
//!
//! Holds several API keys for one capability and hands them out round-robin.
//! A key whose daily quota runs out is retired until the next reset boundary;
//! callers only see a terminal error once the last usable key is gone.
//!
//! Key lifecycle:
//! 1. Keys load from config as `Available`; clients are built on first use
//! 2. A quota failure marks the key `Exhausted` and the caller retries with
//!    the next key
//! 3. A 401/403 marks the key `Disabled` for the life of the process
//! 4. When no key is left, `AllExhausted` carries the next reset instant
//! 5. `reset_all` (after the boundary has passed) returns exhausted keys to
//!    `Available` and clears the persisted ledger

pub mod editor;
pub mod error;
pub mod ledger;
pub mod pool;
pub mod quota;
pub mod schedule;

pub use editor::RotatingImageEditor;
pub use error::{Error, Result};
pub use ledger::ExhaustionLedger;
pub use pool::{KeyRotator, KeyStatus, Lease, fingerprint};
pub use quota::{classify_message, classify_status};
pub use schedule::ResetSchedule;
