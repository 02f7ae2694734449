//! Job and item persistence
//!
//! `JobRepository` is the single source of truth for "already done": every
//! task re-reads it before repeating paid work, which is what makes a run
//! safe to repeat after a crash.
//!
//! `JsonJobStore` keeps all records in memory and, when given a path, writes
//! the whole state through to a JSON file after every mutation using
//! temp-file + rename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use capability::BoxFuture;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{GeneratedItem, ItemStatus, Job, JobId, JobStatus, NewItem, SourceProduct};

/// Job-update closure applied under the repository's lock.
pub type JobUpdate<'a> = Box<dyn FnOnce(&mut Job) + Send + 'a>;

/// Storage consumed by the engine.
pub trait JobRepository: Send + Sync {
    /// Create a pending job. Fails with `DuplicateJob` when a non-terminal job
    /// already exists for `source_ref`.
    fn create_job<'a>(&'a self, source_ref: &'a str) -> BoxFuture<'a, Result<Job>>;

    fn job(&self, id: JobId) -> BoxFuture<'_, Result<Job>>;

    fn jobs(&self) -> BoxFuture<'_, Result<Vec<Job>>>;

    /// Apply `update` to a job and return the updated row.
    fn update_job<'a>(&'a self, id: JobId, update: JobUpdate<'a>) -> BoxFuture<'a, Result<Job>>;

    /// Source products of a batch, ordered by id.
    fn source_products<'a>(&'a self, source_ref: &'a str)
    -> BoxFuture<'a, Result<Vec<SourceProduct>>>;

    /// Insert or replace source products (matched by id). Returns the count.
    fn add_source_products(&self, products: Vec<SourceProduct>) -> BoxFuture<'_, Result<usize>>;

    /// Move a stopped, failed, or partial job back to `running`. Fails with
    /// `DuplicateJob` when another job for the same source is non-terminal.
    fn reopen_job(&self, id: JobId) -> BoxFuture<'_, Result<Job>>;

    /// The generated item of a source product, whichever job made it.
    fn item_for_product(&self, source_product_id: u64)
    -> BoxFuture<'_, Result<Option<GeneratedItem>>>;

    /// Like `item_for_product`, but an item made by another job is linked to
    /// `job_id` so it counts toward the job now using it.
    fn claim_item(
        &self,
        job_id: JobId,
        source_product_id: u64,
    ) -> BoxFuture<'_, Result<Option<GeneratedItem>>>;

    fn insert_item(&self, item: NewItem) -> BoxFuture<'_, Result<GeneratedItem>>;

    /// Record the remote id of a pushed item.
    fn set_remote_id<'a>(&'a self, item_id: u64, remote_id: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Items of a job, ordered by id.
    fn items_for_job(&self, job_id: JobId) -> BoxFuture<'_, Result<Vec<GeneratedItem>>>;

    /// Stored and pushed item counts for a job.
    fn item_counts(&self, job_id: JobId) -> BoxFuture<'_, Result<(u64, u64)>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    next_job_id: u64,
    next_item_id: u64,
    jobs: BTreeMap<u64, Job>,
    products: BTreeMap<u64, SourceProduct>,
    items: BTreeMap<u64, GeneratedItem>,
}

/// In-memory repository with optional JSON write-through.
pub struct JsonJobStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl JsonJobStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Load from `path`, starting empty when the file does not exist yet.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let state = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Repository(format!("reading data file: {e}")))?;
            let state: StoreState = serde_json::from_str(&contents)
                .map_err(|e| Error::Repository(format!("parsing data file: {e}")))?;
            info!(
                path = %path.display(),
                jobs = state.jobs.len(),
                products = state.products.len(),
                items = state.items.len(),
                "loaded job store"
            );
            state
        } else {
            info!(path = %path.display(), "data file not found, starting with empty store");
            StoreState::default()
        };
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    async fn persist(&self, state: &StoreState) -> Result<()> {
        match &self.path {
            Some(path) => write_atomic(path, state).await,
            None => Ok(()),
        }
    }
}

impl JobRepository for JsonJobStore {
    fn create_job<'a>(&'a self, source_ref: &'a str) -> BoxFuture<'a, Result<Job>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if let Some(existing) = state
                .jobs
                .values()
                .find(|job| job.source_ref == source_ref && !job.status.is_terminal())
            {
                return Err(Error::DuplicateJob {
                    source_ref: source_ref.to_string(),
                    existing: existing.id,
                });
            }
            state.next_job_id += 1;
            let job = Job::new(JobId(state.next_job_id), source_ref);
            state.jobs.insert(job.id.0, job.clone());
            self.persist(&state).await?;
            debug!(job_id = %job.id, source_ref, "created job");
            Ok(job)
        })
    }

    fn job(&self, id: JobId) -> BoxFuture<'_, Result<Job>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            state.jobs.get(&id.0).cloned().ok_or(Error::JobNotFound(id))
        })
    }

    fn jobs(&self) -> BoxFuture<'_, Result<Vec<Job>>> {
        Box::pin(async move { Ok(self.state.lock().await.jobs.values().cloned().collect()) })
    }

    fn update_job<'a>(&'a self, id: JobId, update: JobUpdate<'a>) -> BoxFuture<'a, Result<Job>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let job = state.jobs.get_mut(&id.0).ok_or(Error::JobNotFound(id))?;
            update(job);
            let updated = job.clone();
            self.persist(&state).await?;
            Ok(updated)
        })
    }

    fn source_products<'a>(
        &'a self,
        source_ref: &'a str,
    ) -> BoxFuture<'a, Result<Vec<SourceProduct>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .products
                .values()
                .filter(|p| p.source_ref == source_ref)
                .cloned()
                .collect())
        })
    }

    fn add_source_products(&self, products: Vec<SourceProduct>) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let count = products.len();
            for product in products {
                state.products.insert(product.id, product);
            }
            self.persist(&state).await?;
            Ok(count)
        })
    }

    fn reopen_job(&self, id: JobId) -> BoxFuture<'_, Result<Job>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let job = state.jobs.get(&id.0).ok_or(Error::JobNotFound(id))?;
            if !job.status.is_resumable() {
                return Err(Error::InvalidState {
                    id,
                    action: "resume",
                    status: job.status,
                });
            }
            let source_ref = job.source_ref.clone();
            if let Some(other) = state.jobs.values().find(|other| {
                other.id != id && other.source_ref == source_ref && !other.status.is_terminal()
            }) {
                return Err(Error::DuplicateJob {
                    source_ref,
                    existing: other.id,
                });
            }
            let job = state.jobs.get_mut(&id.0).ok_or(Error::JobNotFound(id))?;
            job.status = JobStatus::Running;
            job.error_message = None;
            let reopened = job.clone();
            self.persist(&state).await?;
            debug!(job_id = %id, "reopened job");
            Ok(reopened)
        })
    }

    fn item_for_product(
        &self,
        source_product_id: u64,
    ) -> BoxFuture<'_, Result<Option<GeneratedItem>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .items
                .values()
                .find(|item| item.source_product_id == source_product_id)
                .cloned())
        })
    }

    fn claim_item(
        &self,
        job_id: JobId,
        source_product_id: u64,
    ) -> BoxFuture<'_, Result<Option<GeneratedItem>>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let Some(item) = state
                .items
                .values_mut()
                .find(|item| item.source_product_id == source_product_id)
            else {
                return Ok(None);
            };
            if item.job_id == job_id {
                return Ok(Some(item.clone()));
            }
            debug!(item_id = item.id, from = %item.job_id, to = %job_id, "linking item to job");
            item.job_id = job_id;
            let claimed = item.clone();
            self.persist(&state).await?;
            Ok(Some(claimed))
        })
    }

    fn insert_item(&self, item: NewItem) -> BoxFuture<'_, Result<GeneratedItem>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.next_item_id += 1;
            let stored = GeneratedItem {
                id: state.next_item_id,
                job_id: item.job_id,
                source_product_id: item.source_product_id,
                listing: item.listing,
                images: item.images,
                remote_id: None,
                status: ItemStatus::Pending,
                created_at: Utc::now(),
                pushed_at: None,
            };
            state.items.insert(stored.id, stored.clone());
            self.persist(&state).await?;
            Ok(stored)
        })
    }

    fn set_remote_id<'a>(&'a self, item_id: u64, remote_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let item = state
                .items
                .get_mut(&item_id)
                .ok_or_else(|| Error::Repository(format!("item {item_id} not found")))?;
            item.remote_id = Some(remote_id.to_string());
            item.status = ItemStatus::Pushed;
            item.pushed_at = Some(Utc::now());
            self.persist(&state).await
        })
    }

    fn items_for_job(&self, job_id: JobId) -> BoxFuture<'_, Result<Vec<GeneratedItem>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .items
                .values()
                .filter(|item| item.job_id == job_id)
                .cloned()
                .collect())
        })
    }

    fn item_counts(&self, job_id: JobId) -> BoxFuture<'_, Result<(u64, u64)>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let (mut created, mut pushed) = (0, 0);
            for item in state.items.values().filter(|item| item.job_id == job_id) {
                created += 1;
                if item.remote_id.is_some() {
                    pushed += 1;
                }
            }
            Ok((created, pushed))
        })
    }
}

async fn write_atomic(path: &Path, state: &StoreState) -> Result<()> {
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| Error::Repository(format!("serializing store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Repository("data path has no parent directory".into()))?;
    let tmp_path = dir.join(format!(".jobs.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Repository(format!("writing temp data file: {e}")))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Repository(format!("renaming temp data file: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceProduct;
    use capability::Listing;

    fn product(id: u64, source_ref: &str) -> SourceProduct {
        SourceProduct {
            id,
            source_ref: source_ref.to_string(),
            title: format!("Product {id}"),
            ..Default::default()
        }
    }

    fn new_item(job_id: JobId, source_product_id: u64) -> NewItem {
        NewItem {
            job_id,
            source_product_id,
            listing: Listing {
                title: format!("Item {source_product_id}"),
                ..Default::default()
            },
            images: vec!["https://img/edited.png".into()],
        }
    }

    #[tokio::test]
    async fn create_job_rejects_second_active_job_for_source() {
        let store = JsonJobStore::in_memory();
        let first = store.create_job("batch-1").await.unwrap();

        let err = store.create_job("batch-1").await.unwrap_err();
        assert!(matches!(err, Error::DuplicateJob { existing, .. } if existing == first.id));

        // A different source is fine
        store.create_job("batch-2").await.unwrap();
    }

    #[tokio::test]
    async fn create_job_allowed_once_previous_is_terminal() {
        let store = JsonJobStore::in_memory();
        let first = store.create_job("batch-1").await.unwrap();
        store
            .update_job(
                first.id,
                Box::new(|job: &mut Job| job.status = JobStatus::Completed),
            )
            .await
            .unwrap();
        let second = store.create_job("batch-1").await.unwrap();
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let store = JsonJobStore::in_memory();
        assert!(matches!(
            store.job(JobId(42)).await,
            Err(Error::JobNotFound(JobId(42)))
        ));
    }

    #[tokio::test]
    async fn source_products_filter_by_batch_in_id_order() {
        let store = JsonJobStore::in_memory();
        store
            .add_source_products(vec![
                product(3, "a"),
                product(1, "a"),
                product(2, "b"),
            ])
            .await
            .unwrap();
        let ids: Vec<u64> = store
            .source_products("a")
            .await
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn items_track_remote_ids_and_counts() {
        let store = JsonJobStore::in_memory();
        let job = store.create_job("a").await.unwrap();
        let first = store.insert_item(new_item(job.id, 1)).await.unwrap();
        store.insert_item(new_item(job.id, 2)).await.unwrap();

        store.set_remote_id(first.id, "gid-1").await.unwrap();

        let found = store.item_for_product(1).await.unwrap().unwrap();
        assert_eq!(found.remote_id.as_deref(), Some("gid-1"));
        assert_eq!(found.status, ItemStatus::Pushed);
        assert!(store.item_for_product(3).await.unwrap().is_none());

        assert_eq!(store.item_counts(job.id).await.unwrap(), (2, 1));
        assert_eq!(store.item_counts(JobId(99)).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn claim_links_item_from_earlier_job() {
        let store = JsonJobStore::in_memory();
        let first = store.create_job("a").await.unwrap();
        let item = store.insert_item(new_item(first.id, 1)).await.unwrap();
        store
            .update_job(first.id, Box::new(|job: &mut Job| job.status = JobStatus::Completed))
            .await
            .unwrap();
        let second = store.create_job("a").await.unwrap();

        let claimed = store.claim_item(second.id, 1).await.unwrap().unwrap();

        assert_eq!(claimed.id, item.id);
        assert_eq!(claimed.job_id, second.id);
        assert_eq!(store.item_counts(second.id).await.unwrap(), (1, 0));
        assert_eq!(store.item_counts(first.id).await.unwrap(), (0, 0));
        assert!(store.claim_item(second.id, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reopen_refuses_when_another_job_is_active_for_source() {
        let store = JsonJobStore::in_memory();
        let first = store.create_job("a").await.unwrap();
        store
            .update_job(first.id, Box::new(|job: &mut Job| job.status = JobStatus::Stopped))
            .await
            .unwrap();
        let second = store.create_job("a").await.unwrap();

        let err = store.reopen_job(first.id).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateJob { existing, .. } if existing == second.id));
        assert_eq!(store.job(first.id).await.unwrap().status, JobStatus::Stopped);

        store
            .update_job(second.id, Box::new(|job: &mut Job| job.status = JobStatus::Partial))
            .await
            .unwrap();
        let reopened = store.reopen_job(first.id).await.unwrap();
        assert_eq!(reopened.status, JobStatus::Running);
        assert!(reopened.error_message.is_none());
    }

    #[tokio::test]
    async fn reopen_refuses_completed_job() {
        let store = JsonJobStore::in_memory();
        let job = store.create_job("a").await.unwrap();
        store
            .update_job(job.id, Box::new(|job: &mut Job| job.status = JobStatus::Completed))
            .await
            .unwrap();
        assert!(matches!(
            store.reopen_job(job.id).await,
            Err(Error::InvalidState { action: "resume", .. })
        ));
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let store = JsonJobStore::open(path.clone()).await.unwrap();
        let job = store.create_job("a").await.unwrap();
        store.add_source_products(vec![product(1, "a")]).await.unwrap();
        store.insert_item(new_item(job.id, 1)).await.unwrap();
        drop(store);

        let reopened = JsonJobStore::open(path).await.unwrap();
        assert_eq!(reopened.job(job.id).await.unwrap().source_ref, "a");
        assert_eq!(reopened.source_products("a").await.unwrap().len(), 1);
        assert_eq!(reopened.items_for_job(job.id).await.unwrap().len(), 1);

        // Ids keep counting from where they left off
        let next = reopened.create_job("b").await.unwrap();
        assert_eq!(next.id, JobId(job.id.0 + 1));
    }
}
