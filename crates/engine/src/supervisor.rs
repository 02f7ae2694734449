//! Quota recovery
//!
//! Runs at most once per job run. Parks the job in `waiting_for_quota_reset`
//! until the next reset boundary plus a safety margin, clears the editor's
//! exhaustion state, and resubmits only the products that never finished.
//! A second total exhaustion is not waited out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::driver::{BatchEnd, BatchReport, run_batch};
use crate::error::Result;
use crate::model::{JobId, JobStatus, SourceProduct};
use crate::progress::ProgressHandle;
use crate::repository::JobUpdate;
use crate::task::TaskContext;

/// How a recovery attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// Stop requested while waiting or during the retry batch
    Stopped,
    /// The retry batch ran to completion
    Finished(BatchReport),
    /// Every key ran out again during the retry batch
    ExhaustedAgain {
        report: BatchReport,
        reset_at: DateTime<Utc>,
    },
}

/// Time left until `reset_at`, plus `margin`. Never negative.
pub fn wait_duration(reset_at: DateTime<Utc>, now: DateTime<Utc>, margin: Duration) -> Duration {
    (reset_at - now).to_std().unwrap_or(Duration::ZERO) + margin
}

pub async fn recover(
    ctx: &TaskContext,
    job_id: JobId,
    retry: Vec<SourceProduct>,
    reset_at: DateTime<Utc>,
    parallelism: usize,
    safety_margin: Duration,
    progress: &Arc<ProgressHandle>,
) -> Result<RecoveryOutcome> {
    let wait = wait_duration(reset_at, Utc::now(), safety_margin);
    let message = format!(
        "All image edit keys exhausted. Waiting until {reset_at} then retrying {} products",
        retry.len()
    );
    set_status(ctx, job_id, JobStatus::WaitingForQuotaReset, Some(message.clone())).await?;
    progress.set_status(JobStatus::WaitingForQuotaReset.label(), message);
    warn!(%job_id, retry = retry.len(), wait_secs = wait.as_secs(), "waiting for quota reset");

    tokio::select! {
        _ = tokio::time::sleep(wait) => {}
        _ = progress.cancelled() => {
            info!(%job_id, "stop requested while waiting for quota reset");
            return Ok(RecoveryOutcome::Stopped);
        }
    }

    ctx.editor.reset_exhausted().await;
    set_status(ctx, job_id, JobStatus::Running, None).await?;
    progress.set_status(
        JobStatus::Running.label(),
        format!("Quota reset, retrying {} products", retry.len()),
    );
    info!(%job_id, retry = retry.len(), "quota reset, resubmitting unfinished products");

    let report = run_batch(ctx, job_id, retry, parallelism, progress).await?;
    Ok(match report.end.clone() {
        BatchEnd::Stopped => RecoveryOutcome::Stopped,
        BatchEnd::QuotaExhausted { reset_at, .. } => {
            warn!(%job_id, "keys exhausted again after reset, giving up");
            RecoveryOutcome::ExhaustedAgain { report, reset_at }
        }
        BatchEnd::Drained => RecoveryOutcome::Finished(report),
    })
}

async fn set_status(
    ctx: &TaskContext,
    job_id: JobId,
    status: JobStatus,
    message: Option<String>,
) -> Result<()> {
    let update: JobUpdate<'_> = Box::new(move |job| {
        job.status = status;
        job.error_message = message;
    });
    ctx.repo.update_job(job_id, update).await?;
    Ok(())
}
