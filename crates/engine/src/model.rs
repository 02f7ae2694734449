//! Job and product records

use std::fmt;

use capability::Listing;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a bulk job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a job's generation run.
///
/// Transitions:
/// - Pending → Running (start)
/// - Running → Completed | Partial | Stopped | Error (batch end)
/// - Running → WaitingForQuotaReset (all keys exhausted) → Running (retry batch)
/// - Stopped | Error | Partial → Running (resume)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Error,
    Stopped,
    Partial,
    WaitingForQuotaReset,
}

impl JobStatus {
    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Stopped => "stopped",
            JobStatus::Partial => "partial",
            JobStatus::WaitingForQuotaReset => "waiting_for_quota_reset",
        }
    }

    /// No run is in progress for a job in a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Error | JobStatus::Stopped | JobStatus::Partial
        )
    }

    /// Whether `resume` may start a new run. Completed jobs are done and a
    /// running job already has a run.
    pub fn is_resumable(&self) -> bool {
        !matches!(self, JobStatus::Completed | JobStatus::Running)
    }
}

/// Lifecycle of a job's push phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Cancelled,
    Error,
}

/// A bulk enhance-and-publish run over one source batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// The source batch this job draws products from
    pub source_ref: String,
    pub status: JobStatus,
    #[serde(default)]
    pub push_status: PushStatus,
    #[serde(default)]
    pub created_count: u64,
    #[serde(default)]
    pub pushed_count: u64,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub push_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub push_completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, source_ref: impl Into<String>) -> Self {
        Self {
            id,
            source_ref: source_ref.into(),
            status: JobStatus::Pending,
            push_status: PushStatus::NotStarted,
            created_count: 0,
            pushed_count: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            push_started_at: None,
            push_completed_at: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// A scraped product awaiting enhancement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceProduct {
    pub id: u64,
    pub source_ref: String,
    pub title: String,
    pub handle: Option<String>,
    pub body_html: String,
    pub product_type: String,
    pub vendor: String,
    pub tags: Vec<String>,
    pub seo_title: Option<String>,
    pub seo_description: Option<String>,
    pub variants: Vec<SourceVariant>,
    pub images: Vec<SourceImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceVariant {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub sku: String,
    #[serde(default)]
    pub barcode: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub compare_at_price: Option<f64>,
    #[serde(default)]
    pub option1: Option<String>,
    #[serde(default)]
    pub option2: Option<String>,
    #[serde(default)]
    pub option3: Option<String>,
    #[serde(default = "default_true")]
    pub requires_shipping: bool,
    #[serde(default = "default_true")]
    pub taxable: bool,
}

impl Default for SourceVariant {
    fn default() -> Self {
        Self {
            title: String::new(),
            sku: String::new(),
            barcode: String::new(),
            price: 0.0,
            compare_at_price: None,
            option1: None,
            option2: None,
            option3: None,
            requires_shipping: true,
            taxable: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceImage {
    pub url: String,
    #[serde(default)]
    pub position: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    Pushed,
}

/// The enhanced product produced for one source product.
///
/// `remote_id` is the idempotency marker: once set the item is never pushed
/// again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedItem {
    pub id: u64,
    pub job_id: JobId,
    pub source_product_id: u64,
    /// Enhanced fields resolved against the source plus deduplicated variants
    pub listing: Listing,
    /// Edited images in upload order
    pub images: Vec<String>,
    #[serde(default)]
    pub remote_id: Option<String>,
    #[serde(default)]
    pub status: ItemStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub pushed_at: Option<DateTime<Utc>>,
}

/// Item content before the repository assigns an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewItem {
    pub job_id: JobId,
    pub source_product_id: u64,
    pub listing: Listing,
    pub images: Vec<String>,
}
