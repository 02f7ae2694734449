//! Rate limiter bank for outbound service calls
//!
//! Each external service gets a counting semaphore plus a fixed post-call
//! delay. The delay is served while the slot is still held, so sustained call
//! rate per service stays under `capacity / delay` no matter how bursty the
//! callers are.
//!
//! Destination stores get one gate each (capacity 1), created on first use and
//! keyed by normalized store identity. Pushes to different stores never
//! contend; pushes to the same store always serialize, across jobs.

pub mod bank;
pub mod error;

pub use bank::{GateBank, GatePermit, GateSettings, Service, normalize_store};
pub use error::{Error, Result};
