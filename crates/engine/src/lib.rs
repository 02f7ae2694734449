//! Bulk enhance-and-publish job engine
//!
//! A job takes every product of a source batch through enhance → edit two
//! images → push, on a bounded pool of concurrent tasks. Calls to each
//! external service pass through the `rate-gate` bank; image edits rotate
//! across keys and, when every key is out of quota, the job parks until the
//! daily reset and retries only what did not finish.
//!
//! Flow of a generate run:
//! 1. `JobService::start_job` registers a `ProgressHandle` and spawns the run
//! 2. `driver::run_batch` keeps up to `parallelism` `task::process_product`
//!    calls in flight
//! 3. On total key exhaustion, `supervisor::recover` waits out the reset and
//!    resubmits the unfinished products once
//! 4. The success ratio decides the final job status
//!
//! The repository is the record of completed work: a re-run skips products
//! that already have a generated item, and items that already have a remote id.

pub mod driver;
pub mod error;
pub mod listing;
pub mod metrics;
pub mod model;
pub mod progress;
pub mod repository;
pub mod service;
pub mod supervisor;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use driver::{BatchEnd, BatchReport, MAX_REPORTED_FAILURES, decide_outcome, run_batch};
pub use error::{Error, Result};
pub use model::{
    GeneratedItem, ItemStatus, Job, JobId, JobStatus, PushStatus, SourceImage, SourceProduct,
    SourceVariant,
};
pub use progress::{ProgressHandle, ProgressRegistry, ProgressSnapshot, RunId, RunKind};
pub use repository::{JobRepository, JsonJobStore};
pub use service::{EngineSettings, JobService, StartOptions, StartedRun};
pub use supervisor::RecoveryOutcome;
pub use task::{TaskContext, TaskFailure, TaskOutcome, TaskSettings, process_product};
