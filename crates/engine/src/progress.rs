//! Pollable progress for bulk runs
//!
//! Every run gets its own `ProgressHandle`, registered under a fresh `RunId`.
//! The driver writes to it, polling clients read snapshots, and a cancel
//! request flips a flag the driver checks between task completions.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::model::JobId;

/// Identifier of one run (a generation or push pass over a job).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Operation type of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// Enhance, edit images, and push
    Generate,
    /// Push already generated items only
    Push,
}

/// Atomic success counter shared by all tasks of a run.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increment and return the new value.
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::SeqCst);
    }
}

/// Point-in-time view of a run, handed to polling clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub run_id: RunId,
    pub job_id: JobId,
    pub kind: RunKind,
    pub total: u64,
    pub current: u64,
    pub status: String,
    pub message: String,
    pub cancel_requested: bool,
    pub created: u64,
    pub pushed: u64,
    pub finished: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ProgressState {
    total: u64,
    current: u64,
    status: String,
    message: String,
    finished: bool,
}

/// Shared progress record of one run.
#[derive(Debug)]
pub struct ProgressHandle {
    run_id: RunId,
    job_id: JobId,
    kind: RunKind,
    started_at: DateTime<Utc>,
    state: Mutex<ProgressState>,
    cancel: AtomicBool,
    cancel_notify: Notify,
    /// Products with a stored generated item
    pub created: Counter,
    /// Items confirmed in the destination store
    pub pushed: Counter,
}

impl ProgressHandle {
    pub fn new(job_id: JobId, kind: RunKind) -> Self {
        Self {
            run_id: RunId::new(),
            job_id,
            kind,
            started_at: Utc::now(),
            state: Mutex::new(ProgressState {
                status: "starting".to_string(),
                ..Default::default()
            }),
            cancel: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            created: Counter::default(),
            pushed: Counter::default(),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn kind(&self) -> RunKind {
        self.kind
    }

    fn state(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_total(&self, total: u64) {
        self.state().total = total;
    }

    /// Record one more finished product; returns the new position.
    pub fn advance(&self) -> u64 {
        let mut state = self.state();
        state.current += 1;
        state.current
    }

    pub fn set_status(&self, status: &str, message: impl Into<String>) {
        let mut state = self.state();
        state.status = status.to_string();
        state.message = message.into();
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.state().message = message.into();
    }

    /// Mark the run finished with its final status.
    pub fn finish(&self, status: &str, message: impl Into<String>) {
        let mut state = self.state();
        state.status = status.to_string();
        state.message = message.into();
        state.finished = true;
    }

    /// Ask the run to stop. Observed between task completions.
    pub fn request_cancel(&self) {
        if !self.cancel.swap(true, Ordering::SeqCst) {
            self.cancel_notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Resolves once a cancel has been requested.
    pub async fn cancelled(&self) {
        let notified = self.cancel_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state();
        ProgressSnapshot {
            run_id: self.run_id,
            job_id: self.job_id,
            kind: self.kind,
            total: state.total,
            current: state.current,
            status: state.status.clone(),
            message: state.message.clone(),
            cancel_requested: self.is_cancelled(),
            created: self.created.get(),
            pushed: self.pushed.get(),
            finished: state.finished,
            started_at: self.started_at,
        }
    }
}

/// Concurrent map of live and finished runs.
#[derive(Debug, Default)]
pub struct ProgressRegistry {
    runs: Mutex<HashMap<RunId, Arc<ProgressHandle>>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a handle for a new run.
    pub fn start(&self, job_id: JobId, kind: RunKind) -> Arc<ProgressHandle> {
        let handle = Arc::new(ProgressHandle::new(job_id, kind));
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.run_id(), handle.clone());
        handle
    }

    pub fn get(&self, run_id: RunId) -> Option<Arc<ProgressHandle>> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&run_id)
            .cloned()
    }

    /// The most recently started run of `kind`.
    pub fn latest(&self, kind: RunKind) -> Option<Arc<ProgressHandle>> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|handle| handle.kind() == kind)
            .max_by_key(|handle| handle.started_at)
            .cloned()
    }

    /// Unfinished runs for a job.
    pub fn active_for_job(&self, job_id: JobId) -> Vec<Arc<ProgressHandle>> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|handle| handle.job_id() == job_id && !handle.snapshot().finished)
            .cloned()
            .collect()
    }
}
