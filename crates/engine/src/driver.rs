//! Bounded worker pool over a product batch
//!
//! Products wait in a pending queue and are spawned into a `JoinSet` that
//! never holds more than `parallelism` tasks. Completion order is whatever
//! the tasks produce. Between completions the driver checks for a stop
//! request (which drops everything still pending) and for total key
//! exhaustion (which turns every unfinished product into the retry set).
//! Job counts are written every few completions and once at the end.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::{self, JoinSet};
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::model::{JobId, JobStatus, SourceProduct};
use crate::progress::ProgressHandle;
use crate::repository::JobUpdate;
use crate::task::{TaskContext, TaskFailure, TaskOutcome, process_product};

/// Failures kept on a report for display; the count stays exact.
pub const MAX_REPORTED_FAILURES: usize = 20;

/// Completions between progress log lines and job count writes.
const SYNC_EVERY: u64 = 10;

/// How a batch ended.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEnd {
    /// Every product was attempted
    Drained,
    /// A stop request dropped the products that had not started
    Stopped,
    /// All keys ran out; `retry` holds every product that did not finish, in
    /// batch order
    QuotaExhausted {
        retry: Vec<SourceProduct>,
        reset_at: DateTime<Utc>,
    },
}

/// Result of one pass over a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub attempted: usize,
    pub succeeded: usize,
    /// First `MAX_REPORTED_FAILURES` failures, `product <id>: <reason>`
    pub failures: Vec<String>,
    pub failure_count: usize,
    pub end: BatchEnd,
}

impl BatchReport {
    fn record_failure(&mut self, message: String) {
        self.failure_count += 1;
        if self.failures.len() < MAX_REPORTED_FAILURES {
            self.failures.push(message);
        }
    }
}

type TaskResult = std::result::Result<TaskOutcome, TaskFailure>;

/// Run one pass over `products` with at most `parallelism` in flight.
///
/// In-flight products always run to completion: a repository failure stops
/// new spawns and drains the set before the error is returned.
pub async fn run_batch(
    ctx: &TaskContext,
    job_id: JobId,
    products: Vec<SourceProduct>,
    parallelism: usize,
    progress: &Arc<ProgressHandle>,
) -> Result<BatchReport> {
    if parallelism == 0 {
        return Err(Error::Config("parallelism must be at least 1".into()));
    }
    let parallelism = parallelism.min(products.len().max(1));
    let products: Vec<Arc<SourceProduct>> = products.into_iter().map(Arc::new).collect();

    let mut report = BatchReport {
        attempted: 0,
        succeeded: 0,
        failures: Vec::new(),
        failure_count: 0,
        end: BatchEnd::Drained,
    };
    let mut pending: VecDeque<usize> = (0..products.len()).collect();
    // Task id → product index for everything in flight
    let mut in_flight: HashMap<task::Id, usize> = HashMap::new();
    let mut set: JoinSet<TaskResult> = JoinSet::new();
    let mut exhausted: Option<(BTreeSet<usize>, DateTime<Utc>)> = None;
    let mut fatal: Option<Error> = None;
    let mut stopped = false;

    info!(%job_id, products = products.len(), parallelism, "batch started");

    loop {
        if exhausted.is_none() && fatal.is_none() && !stopped {
            while set.len() < parallelism {
                let Some(idx) = pending.pop_front() else {
                    break;
                };
                let ctx = ctx.clone();
                let product = products[idx].clone();
                let handle =
                    set.spawn(async move { process_product(&ctx, job_id, &product).await });
                in_flight.insert(handle.id(), idx);
            }
        }

        let Some(joined) = set.join_next_with_id().await else {
            break;
        };
        let (id, result) = match joined {
            Ok((id, result)) => (id, Ok(result)),
            Err(e) => (e.id(), Err(e)),
        };
        let Some(idx) = in_flight.remove(&id) else {
            continue;
        };
        let product = &products[idx];

        if let Some((retry, _)) = exhausted.as_mut() {
            // Already escalating; late completions are re-checked on retry
            if let Ok(Err(TaskFailure::QuotaExhausted { .. })) = result {
                retry.insert(idx);
            }
            continue;
        }
        if fatal.is_some() {
            continue;
        }

        match result {
            Ok(Ok(outcome)) => {
                report.attempted += 1;
                report.succeeded += 1;
                metrics::record_product("success");
                if outcome.generated {
                    progress.created.increment();
                    progress.pushed.increment();
                    info!(%job_id, product_id = product.id, remote_id = %outcome.remote_id, "product done");
                }
            }
            Ok(Err(TaskFailure::Product(reason))) => {
                report.attempted += 1;
                warn!(%job_id, product_id = product.id, %reason, "product failed");
                metrics::record_product("failed");
                report.record_failure(format!("product {}: {reason}", product.id));
            }
            Ok(Err(TaskFailure::QuotaExhausted { reset_at })) => {
                metrics::record_product("quota_exhausted");
                let mut retry: BTreeSet<usize> = in_flight.values().copied().collect();
                retry.insert(idx);
                retry.extend(pending.drain(..));
                warn!(
                    %job_id,
                    product_id = product.id,
                    retry = retry.len(),
                    %reset_at,
                    "all image edit keys exhausted, suspending batch"
                );
                exhausted = Some((retry, reset_at));
                continue;
            }
            Err(e) => {
                report.attempted += 1;
                error!(%job_id, product_id = product.id, error = %e, "product task panicked");
                metrics::record_product("failed");
                report.record_failure(format!("product {}: task panicked", product.id));
            }
        }

        let current = progress.advance();
        progress.set_message(format!("processed {current} products"));
        if current % SYNC_EVERY == 0 {
            info!(%job_id, current, succeeded = report.succeeded, "batch progress");
            if let Err(e) = sync_counts(ctx, job_id, progress).await {
                error!(
                    %job_id,
                    error = %e,
                    in_flight = in_flight.len(),
                    "recording job counts failed, draining in-flight products"
                );
                pending.clear();
                fatal = Some(e);
                continue;
            }
        }

        if !stopped && progress.is_cancelled() {
            info!(%job_id, dropped = pending.len(), "stop requested, cancelling pending products");
            pending.clear();
            stopped = true;
        }
    }

    if let Some(e) = fatal {
        return Err(e);
    }
    sync_counts(ctx, job_id, progress).await?;

    report.end = match exhausted {
        Some(_) if progress.is_cancelled() => BatchEnd::Stopped,
        Some((retry, reset_at)) => BatchEnd::QuotaExhausted {
            retry: retry
                .into_iter()
                .map(|idx| products[idx].as_ref().clone())
                .collect(),
            reset_at,
        },
        None if stopped => BatchEnd::Stopped,
        None => BatchEnd::Drained,
    };
    info!(
        %job_id,
        attempted = report.attempted,
        succeeded = report.succeeded,
        failed = report.failure_count,
        "batch finished"
    );
    Ok(report)
}

/// Write the job's item counts to its row and the run's counters.
pub(crate) async fn sync_counts(
    ctx: &TaskContext,
    job_id: JobId,
    progress: &ProgressHandle,
) -> Result<()> {
    let (created, pushed) = ctx.repo.item_counts(job_id).await?;
    let update: JobUpdate<'_> = Box::new(move |job| {
        job.created_count = created;
        job.pushed_count = pushed;
    });
    ctx.repo.update_job(job_id, update).await?;
    progress.created.set(created);
    progress.pushed.set(pushed);
    Ok(())
}

/// Final status for a run from its success ratio.
///
/// 100% → completed; at least 90% → completed with a warning; otherwise
/// partial.
pub fn decide_outcome(succeeded: usize, total: usize) -> (JobStatus, Option<String>) {
    if succeeded >= total {
        return (JobStatus::Completed, None);
    }
    let failed = total - succeeded;
    let ratio = succeeded as f64 / total as f64;
    if ratio >= 0.9 {
        (
            JobStatus::Completed,
            Some(format!(
                "Completed with {failed} failed of {total} products ({:.0}% success)",
                ratio * 100.0
            )),
        )
    } else {
        (
            JobStatus::Partial,
            Some(format!(
                "{succeeded} of {total} products succeeded ({:.0}% success)",
                ratio * 100.0
            )),
        )
    }
}
