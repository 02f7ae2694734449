//! Job service facade
//!
//! The calling layer's entry point. Every run (generate or push) gets a
//! `ProgressHandle` registered under its own `RunId` and executes on a
//! spawned tokio task; a job has at most one active run at a time.
//!
//! Generate runs go driver → (on total exhaustion) supervisor → final status.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::driver::{BatchEnd, decide_outcome, run_batch, sync_counts};
use crate::error::{Error, Result};
use crate::metrics;
use crate::model::{Job, JobId, JobStatus, PushStatus, SourceProduct};
use crate::progress::{ProgressHandle, ProgressRegistry, ProgressSnapshot, RunId, RunKind};
use crate::repository::JobUpdate;
use crate::supervisor::{RecoveryOutcome, recover};
use crate::task::{TaskContext, TaskFailure, push_item};

/// Message written to jobs found mid-run at startup.
pub const INTERRUPTED_MESSAGE: &str = "Job was interrupted (server restart or crash)";

/// Engine-wide run settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Default number of products in flight per run
    pub parallelism: usize,
    /// Extra wait after the quota reset boundary
    pub safety_margin: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            parallelism: 3,
            safety_margin: Duration::from_secs(60),
        }
    }
}

/// Per-run overrides for a generate run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    pub parallelism: Option<usize>,
    /// Process at most this many products
    pub limit: Option<usize>,
    /// Skip this many products of the ordered batch first
    pub offset: usize,
}

/// A spawned run. Await `task` for the job's final state.
pub struct StartedRun {
    pub run_id: RunId,
    pub progress: Arc<ProgressHandle>,
    pub task: JoinHandle<Result<Job>>,
}

struct Inner {
    ctx: TaskContext,
    settings: EngineSettings,
    registry: ProgressRegistry,
    active: Mutex<HashMap<JobId, Arc<ProgressHandle>>>,
}

impl Inner {
    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Arc<ProgressHandle>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn update(&self, job_id: JobId, update: JobUpdate<'_>) -> Result<Job> {
        self.ctx.repo.update_job(job_id, update).await
    }
}

#[derive(Clone)]
pub struct JobService {
    inner: Arc<Inner>,
}

impl JobService {
    pub fn new(ctx: TaskContext, settings: EngineSettings) -> Result<Self> {
        if settings.parallelism == 0 {
            return Err(Error::Config("parallelism must be at least 1".into()));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                ctx,
                settings,
                registry: ProgressRegistry::new(),
                active: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub async fn create_job(&self, source_ref: &str) -> Result<Job> {
        let job = self.inner.ctx.repo.create_job(source_ref).await?;
        info!(job_id = %job.id, source_ref, "job created");
        Ok(job)
    }

    pub async fn import_products(&self, products: Vec<SourceProduct>) -> Result<usize> {
        self.inner.ctx.repo.add_source_products(products).await
    }

    pub async fn job(&self, job_id: JobId) -> Result<Job> {
        self.inner.ctx.repo.job(job_id).await
    }

    pub async fn jobs(&self) -> Result<Vec<Job>> {
        self.inner.ctx.repo.jobs().await
    }

    /// Start the first run of a pending job.
    pub async fn start_job(&self, job_id: JobId, options: StartOptions) -> Result<StartedRun> {
        let job = self.job(job_id).await?;
        if job.status != JobStatus::Pending {
            return Err(Error::InvalidState {
                id: job_id,
                action: "start",
                status: job.status,
            });
        }
        let parallelism = self.parallelism(options)?;
        let progress = self.claim(&job, "start", RunKind::Generate)?;
        Ok(self.spawn_generate(job, parallelism, options, progress))
    }

    /// Run a stopped, failed, or partial job again. Products that already
    /// have a generated item are not regenerated.
    ///
    /// Refused with `DuplicateJob` while another job for the same source is
    /// still live.
    pub async fn resume_job(&self, job_id: JobId, options: StartOptions) -> Result<StartedRun> {
        let job = self.job(job_id).await?;
        if !job.status.is_resumable() {
            return Err(Error::InvalidState {
                id: job_id,
                action: "resume",
                status: job.status,
            });
        }
        let parallelism = self.parallelism(options)?;
        let progress = self.claim(&job, "resume", RunKind::Generate)?;
        let job = match self.inner.ctx.repo.reopen_job(job_id).await {
            Ok(job) => job,
            Err(e) => {
                warn!(%job_id, error = %e, "resume refused");
                self.inner.active().remove(&job_id);
                progress.finish("error", e.to_string());
                return Err(e);
            }
        };
        Ok(self.spawn_generate(job, parallelism, options, progress))
    }

    fn parallelism(&self, options: StartOptions) -> Result<usize> {
        let parallelism = options.parallelism.unwrap_or(self.inner.settings.parallelism);
        if parallelism == 0 {
            return Err(Error::Config("parallelism must be at least 1".into()));
        }
        Ok(parallelism)
    }

    fn spawn_generate(
        &self,
        job: Job,
        parallelism: usize,
        options: StartOptions,
        progress: Arc<ProgressHandle>,
    ) -> StartedRun {
        let inner = self.inner.clone();
        let handle = progress.clone();
        let job_id = job.id;
        let task = tokio::spawn(async move {
            let result = execute_run(&inner, job, parallelism, options, &handle).await;
            finish_run(&inner, job_id, &handle, result).await
        });
        StartedRun {
            run_id: progress.run_id(),
            progress,
            task,
        }
    }

    /// Register a run for `job`, refusing when it already has one.
    fn claim(&self, job: &Job, action: &'static str, kind: RunKind) -> Result<Arc<ProgressHandle>> {
        let mut active = self.inner.active();
        if active.contains_key(&job.id) {
            return Err(Error::InvalidState {
                id: job.id,
                action,
                status: JobStatus::Running,
            });
        }
        let progress = self.inner.registry.start(job.id, kind);
        active.insert(job.id, progress.clone());
        info!(job_id = %job.id, run_id = %progress.run_id(), kind = ?kind, "run started");
        Ok(progress)
    }

    /// Stop a job. An active run is asked to stop cooperatively and ends
    /// `stopped` on its own; an idle non-terminal job is marked `stopped`
    /// directly.
    pub async fn stop_job(&self, job_id: JobId) -> Result<Job> {
        let running = self.inner.active().get(&job_id).cloned();
        if let Some(progress) = running {
            info!(%job_id, run_id = %progress.run_id(), "stop requested");
            progress.request_cancel();
            return self.job(job_id).await;
        }

        let job = self.job(job_id).await?;
        if job.status.is_terminal() {
            return Err(Error::InvalidState {
                id: job_id,
                action: "stop",
                status: job.status,
            });
        }
        self.inner
            .update(
                job_id,
                Box::new(|job: &mut Job| {
                    job.status = JobStatus::Stopped;
                    job.error_message = Some("Stopped by user".into());
                    job.completed_at = Some(Utc::now());
                }),
            )
            .await
    }

    /// Cancel a run by id.
    pub fn cancel(&self, run_id: RunId) -> Result<()> {
        let progress = self
            .inner
            .registry
            .get(run_id)
            .ok_or(Error::RunNotFound(run_id))?;
        progress.request_cancel();
        Ok(())
    }

    pub fn get_progress(&self, run_id: RunId) -> Result<ProgressSnapshot> {
        self.inner
            .registry
            .get(run_id)
            .map(|progress| progress.snapshot())
            .ok_or(Error::RunNotFound(run_id))
    }

    /// Snapshot of the most recently started run of `kind`.
    pub fn latest_progress(&self, kind: RunKind) -> Option<ProgressSnapshot> {
        self.inner
            .registry
            .latest(kind)
            .map(|progress| progress.snapshot())
    }

    /// Push every generated item of the job that has no remote id yet, one
    /// at a time.
    pub async fn start_push(&self, job_id: JobId) -> Result<StartedRun> {
        let job = self.job(job_id).await?;
        let progress = self.claim(&job, "push", RunKind::Push)?;
        let inner = self.inner.clone();
        let handle = progress.clone();
        let task = tokio::spawn(async move {
            let result = execute_push(&inner, job_id, &handle).await;
            if let Err(e) = &result {
                error!(%job_id, error = %e, "push run failed");
                handle.finish("error", e.to_string());
                let marked = inner
                    .update(
                        job_id,
                        Box::new(|job: &mut Job| {
                            job.push_status = PushStatus::Error;
                            job.push_completed_at = Some(Utc::now());
                        }),
                    )
                    .await;
                if let Err(e) = marked {
                    warn!(%job_id, error = %e, "could not record push failure");
                }
            }
            inner.active().remove(&job_id);
            result
        });
        Ok(StartedRun {
            run_id: progress.run_id(),
            progress,
            task,
        })
    }

    /// Mark jobs left mid-run by a previous process as stopped so they can be
    /// resumed. Returns the affected job ids.
    pub async fn recover_interrupted(&self) -> Result<Vec<JobId>> {
        let mut recovered = Vec::new();
        for job in self.jobs().await? {
            let interrupted = matches!(
                job.status,
                JobStatus::Running | JobStatus::WaitingForQuotaReset
            );
            let push_interrupted = job.push_status == PushStatus::InProgress;
            if !interrupted && !push_interrupted {
                continue;
            }
            self.inner
                .update(
                    job.id,
                    Box::new(move |job: &mut Job| {
                        if interrupted {
                            job.status = JobStatus::Stopped;
                            job.error_message = Some(INTERRUPTED_MESSAGE.into());
                        }
                        if push_interrupted {
                            job.push_status = PushStatus::Cancelled;
                        }
                    }),
                )
                .await?;
            warn!(job_id = %job.id, was = job.status.label(), "recovered interrupted job");
            recovered.push(job.id);
        }
        Ok(recovered)
    }

    /// Health of the image edit keys.
    pub async fn key_health(&self) -> serde_json::Value {
        self.inner.ctx.editor.health().await
    }
}

async fn execute_run(
    inner: &Inner,
    job: Job,
    parallelism: usize,
    options: StartOptions,
    progress: &Arc<ProgressHandle>,
) -> Result<Job> {
    let job_id = job.id;
    let ctx = &inner.ctx;
    let now = Utc::now();
    inner
        .update(
            job_id,
            Box::new(move |job: &mut Job| {
                job.status = JobStatus::Running;
                job.error_message = None;
                job.started_at = Some(now);
                job.completed_at = None;
                job.push_status = PushStatus::InProgress;
                job.push_started_at = Some(now);
                job.push_completed_at = None;
            }),
        )
        .await?;

    let products: Vec<SourceProduct> = ctx
        .repo
        .source_products(&job.source_ref)
        .await?
        .into_iter()
        .skip(options.offset)
        .take(options.limit.unwrap_or(usize::MAX))
        .collect();
    let total = products.len();
    progress.set_total(total as u64);
    progress.set_status(JobStatus::Running.label(), format!("processing {total} products"));

    if products.is_empty() {
        info!(%job_id, "no products to process");
        return finalize(inner, job_id, JobStatus::Completed, None, progress).await;
    }

    let first = run_batch(ctx, job_id, products, parallelism, progress).await?;
    let (status, message) = match first.end.clone() {
        BatchEnd::Drained => decide_outcome(first.succeeded, total),
        BatchEnd::Stopped => (
            JobStatus::Stopped,
            Some(format!("Stopped by user after {} products", first.attempted)),
        ),
        BatchEnd::QuotaExhausted { retry, reset_at } => {
            let outcome = recover(
                ctx,
                job_id,
                retry,
                reset_at,
                parallelism,
                inner.settings.safety_margin,
                progress,
            )
            .await?;
            match outcome {
                RecoveryOutcome::Stopped => (JobStatus::Stopped, Some("Stopped by user".into())),
                RecoveryOutcome::Finished(report) => {
                    decide_outcome(first.succeeded + report.succeeded, total)
                }
                RecoveryOutcome::ExhaustedAgain { report, reset_at } => {
                    let done = first.succeeded + report.succeeded;
                    (
                        JobStatus::Error,
                        Some(format!(
                            "All image edit keys exhausted again after quota reset \
                             ({done} of {total} products done, next reset {reset_at})"
                        )),
                    )
                }
            }
        }
    };

    if first.failure_count > 0 {
        warn!(%job_id, failures = ?first.failures, total = first.failure_count, "product failures");
    }
    finalize(inner, job_id, status, message, progress).await
}

/// Write the run's final status, timestamps, and counts.
async fn finalize(
    inner: &Inner,
    job_id: JobId,
    status: JobStatus,
    message: Option<String>,
    progress: &ProgressHandle,
) -> Result<Job> {
    sync_counts(&inner.ctx, job_id, progress).await?;
    let push_status = match status {
        JobStatus::Stopped => PushStatus::Cancelled,
        JobStatus::Error => PushStatus::Error,
        _ => PushStatus::Completed,
    };
    let summary = message.clone().unwrap_or_else(|| "done".to_string());
    let now = Utc::now();
    let job = inner
        .update(
            job_id,
            Box::new(move |job: &mut Job| {
                job.status = status;
                job.error_message = message;
                job.completed_at = Some(now);
                job.push_status = push_status;
                job.push_completed_at = Some(now);
            }),
        )
        .await?;
    progress.finish(status.label(), summary);
    metrics::record_job(status);
    info!(
        %job_id,
        status = status.label(),
        created = job.created_count,
        pushed = job.pushed_count,
        "job finished"
    );
    Ok(job)
}

/// Release the job's run slot; turn an unexpected error into job status.
async fn finish_run(
    inner: &Inner,
    job_id: JobId,
    progress: &ProgressHandle,
    result: Result<Job>,
) -> Result<Job> {
    let result = match result {
        Ok(job) => Ok(job),
        Err(e) => {
            error!(%job_id, error = %e, "run failed");
            let message = e.to_string();
            progress.finish(JobStatus::Error.label(), message.clone());
            metrics::record_job(JobStatus::Error);
            // Best effort; the repository may be what failed
            let _ = inner
                .update(
                    job_id,
                    Box::new(move |job: &mut Job| {
                        job.status = JobStatus::Error;
                        job.error_message = Some(message);
                        job.completed_at = Some(Utc::now());
                        job.push_status = PushStatus::Error;
                    }),
                )
                .await;
            Err(e)
        }
    };
    inner.active().remove(&job_id);
    result
}

async fn execute_push(inner: &Inner, job_id: JobId, progress: &ProgressHandle) -> Result<Job> {
    let ctx = &inner.ctx;
    let now = Utc::now();
    inner
        .update(
            job_id,
            Box::new(move |job: &mut Job| {
                job.push_status = PushStatus::InProgress;
                job.push_started_at = Some(now);
                job.push_completed_at = None;
            }),
        )
        .await?;

    let items: Vec<_> = ctx
        .repo
        .items_for_job(job_id)
        .await?
        .into_iter()
        .filter(|item| item.remote_id.is_none())
        .collect();
    progress.set_total(items.len() as u64);
    progress.set_status("running", format!("pushing {} items", items.len()));
    info!(%job_id, items = items.len(), "push started");

    let mut pushed = 0usize;
    let mut failed = 0usize;
    let mut cancelled = false;
    for item in &items {
        if progress.is_cancelled() {
            cancelled = true;
            break;
        }
        match push_item(ctx, item).await {
            Ok(remote_id) => {
                pushed += 1;
                metrics::record_push_item("pushed");
                info!(%job_id, item_id = item.id, %remote_id, "item pushed");
            }
            Err(TaskFailure::Product(reason)) => {
                failed += 1;
                metrics::record_push_item("failed");
                warn!(%job_id, item_id = item.id, %reason, "item push failed");
            }
            Err(e @ TaskFailure::QuotaExhausted { .. }) => {
                failed += 1;
                metrics::record_push_item("failed");
                warn!(%job_id, item_id = item.id, error = %e, "item push failed");
            }
        }
        progress.advance();
    }

    let (_, pushed_total) = ctx.repo.item_counts(job_id).await?;
    progress.pushed.set(pushed_total);
    let push_status = if cancelled {
        PushStatus::Cancelled
    } else if pushed == 0 && failed > 0 {
        PushStatus::Error
    } else {
        PushStatus::Completed
    };
    let now = Utc::now();
    let job = inner
        .update(
            job_id,
            Box::new(move |job: &mut Job| {
                job.push_status = push_status;
                job.pushed_count = pushed_total;
                job.push_completed_at = Some(now);
            }),
        )
        .await?;

    let label = match push_status {
        PushStatus::Cancelled => "cancelled",
        PushStatus::Error => "error",
        _ => "completed",
    };
    progress.finish(label, format!("{pushed} pushed, {failed} failed"));
    info!(%job_id, pushed, failed, status = label, "push finished");
    Ok(job)
}
