//! Engine metrics
//!
//! - `engine_products_total` (counter): label `outcome` (success, failed, quota_exhausted)
//! - `engine_jobs_total` (counter): label `status`, the final status of each run
//! - `engine_push_items_total` (counter): label `outcome`, push-only runs

use crate::model::JobStatus;

pub fn record_product(outcome: &'static str) {
    metrics::counter!("engine_products_total", "outcome" => outcome).increment(1);
}

pub fn record_job(status: JobStatus) {
    metrics::counter!("engine_jobs_total", "status" => status.label()).increment(1);
}

pub fn record_push_item(outcome: &'static str) {
    metrics::counter!("engine_push_items_total", "outcome" => outcome).increment(1);
}
