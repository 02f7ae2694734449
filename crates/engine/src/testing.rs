//! In-process fakes for engine tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use capability::{
    BoxFuture, CallError, CommercePublisher, ContentEnhancer, EditError, EnhancedFields,
    ImageEditor, ImageVariation, Listing, ProductDraft, RemoteProduct, RemoteVariant,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rate_gate::GateBank;

use crate::error::{Error, Result as RepoResult};
use crate::model::{GeneratedItem, Job, JobId, NewItem, SourceImage, SourceProduct, SourceVariant};
use crate::progress::ProgressHandle;
use crate::repository::{JobRepository, JobUpdate, JsonJobStore};
use crate::task::{TaskContext, TaskSettings};

pub(crate) const BATCH: &str = "batch-1";

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A valid product: one variant, one image.
pub(crate) fn product(id: u64) -> SourceProduct {
    SourceProduct {
        id,
        source_ref: BATCH.into(),
        title: format!("Product {id}"),
        body_html: format!("<p>Source copy {id}</p>"),
        product_type: "Widgets".into(),
        vendor: "Acme".into(),
        tags: vec!["new".into()],
        variants: vec![SourceVariant {
            title: "Large".into(),
            sku: format!("SKU-{id}"),
            price: 10.0,
            option1: Some("Large".into()),
            ..Default::default()
        }],
        images: vec![SourceImage {
            url: format!("https://img/{id}.jpg"),
            position: 1,
        }],
        ..Default::default()
    }
}

pub(crate) fn product_without_images(id: u64) -> SourceProduct {
    SourceProduct {
        images: Vec::new(),
        ..product(id)
    }
}

#[derive(Default)]
pub(crate) struct FakeEnhancer {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
    cancel_on: Mutex<Option<(String, Arc<ProgressHandle>)>>,
}

impl FakeEnhancer {
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn fail_for(&self, title: &str) {
        lock(&self.failing).insert(title.to_string());
    }

    pub fn panic_for(&self, title: &str) {
        lock(&self.panicking).insert(title.to_string());
    }

    /// Request a stop on `progress` while `title` is being enhanced.
    pub fn cancel_when_enhancing(&self, title: &str, progress: Arc<ProgressHandle>) {
        *lock(&self.cancel_on) = Some((title.to_string(), progress));
    }
}

impl ContentEnhancer for FakeEnhancer {
    fn id(&self) -> &str {
        "fake-enhancer"
    }

    fn enhance<'a>(
        &'a self,
        draft: &'a ProductDraft,
    ) -> BoxFuture<'a, capability::Result<EnhancedFields>> {
        Box::pin(async move {
            lock(&self.calls).push(draft.title.clone());
            if let Some((title, progress)) = lock(&self.cancel_on).as_ref() {
                if *title == draft.title {
                    progress.request_cancel();
                }
            }
            if lock(&self.failing).contains(&draft.title) {
                return Err(CallError::transient("model unavailable"));
            }
            let panics = lock(&self.panicking).contains(&draft.title);
            if panics {
                panic!("enhancer crashed on {}", draft.title);
            }
            Ok(EnhancedFields {
                title: Some(draft.title.clone()),
                body_html: Some(format!("<p>Enhanced {}</p>", draft.title)),
                seo_description: Some(format!("Buy {}", draft.title)),
                ..Default::default()
            })
        })
    }
}

#[derive(Default)]
pub(crate) struct FakeEditor {
    calls: Mutex<Vec<String>>,
    titles: Mutex<Vec<String>>,
    rotate_next: AtomicU32,
    transient_next: AtomicU32,
    exhaust_trigger: Mutex<Option<String>>,
    exhausted_until: Mutex<Option<DateTime<Utc>>>,
    stay_exhausted: AtomicBool,
    resets: AtomicUsize,
}

impl FakeEditor {
    /// Variation labels in call order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Product titles in call order.
    pub fn titles(&self) -> Vec<String> {
        lock(&self.titles).clone()
    }

    pub fn rotate_next(&self, n: u32) {
        self.rotate_next.store(n, Ordering::SeqCst);
    }

    pub fn fail_transient_next(&self, n: u32) {
        self.transient_next.store(n, Ordering::SeqCst);
    }

    /// Exhaust every key on the first edit for `title`. Stays exhausted
    /// until `reset_exhausted`.
    pub fn exhaust_on(&self, title: &str) {
        *lock(&self.exhaust_trigger) = Some(title.to_string());
    }

    /// Make `reset_exhausted` a no-op so the retry pass runs out again.
    pub fn stay_exhausted(&self) {
        self.stay_exhausted.store(true, Ordering::SeqCst);
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl ImageEditor for FakeEditor {
    fn edit<'a>(
        &'a self,
        _source_image: &'a str,
        context: &'a str,
        variation: ImageVariation,
    ) -> BoxFuture<'a, Result<Option<String>, EditError>> {
        Box::pin(async move {
            let title = context.split(" (").next().unwrap_or(context).to_string();
            lock(&self.calls).push(variation.as_str().to_string());
            lock(&self.titles).push(title.clone());

            if let Some(reset_at) = *lock(&self.exhausted_until) {
                return Err(EditError::QuotaExhausted { reset_at });
            }
            {
                let mut trigger = lock(&self.exhaust_trigger);
                if trigger.as_deref() == Some(title.as_str()) {
                    trigger.take();
                    let reset_at = Utc::now() + ChronoDuration::hours(2);
                    *lock(&self.exhausted_until) = Some(reset_at);
                    return Err(EditError::QuotaExhausted { reset_at });
                }
            }
            if take_one(&self.rotate_next) {
                return Err(EditError::Rotated("key-1".into()));
            }
            if take_one(&self.transient_next) {
                return Err(EditError::Call(CallError::transient("connection reset")));
            }
            Ok(Some(format!("edited:{}", variation.as_str())))
        })
    }

    fn reset_exhausted(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.resets.fetch_add(1, Ordering::SeqCst);
            if !self.stay_exhausted.load(Ordering::SeqCst) {
                lock(&self.exhausted_until).take();
            }
        })
    }

    fn health(&self) -> BoxFuture<'_, serde_json::Value> {
        Box::pin(async move {
            let exhausted = lock(&self.exhausted_until).is_some();
            serde_json::json!({
                "status": if exhausted { "unhealthy" } else { "healthy" },
                "keys_total": 1,
                "keys_available": if exhausted { 0 } else { 1 },
            })
        })
    }
}

pub(crate) struct FakePublisher {
    existing: Mutex<HashMap<String, String>>,
    created: Mutex<Vec<String>>,
    failing_creates: Mutex<HashSet<String>>,
    fail_images: AtomicBool,
    total_calls: AtomicUsize,
    image_uploads: AtomicUsize,
    inventory_disables: AtomicUsize,
    next_id: AtomicU64,
}

impl Default for FakePublisher {
    fn default() -> Self {
        Self {
            existing: Mutex::default(),
            created: Mutex::default(),
            failing_creates: Mutex::default(),
            fail_images: AtomicBool::new(false),
            total_calls: AtomicUsize::new(0),
            image_uploads: AtomicUsize::new(0),
            inventory_disables: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        }
    }
}

impl FakePublisher {
    /// Titles of successfully created products, in creation order.
    pub fn created_titles(&self) -> Vec<String> {
        lock(&self.created).clone()
    }

    pub fn image_uploads(&self) -> usize {
        self.image_uploads.load(Ordering::SeqCst)
    }

    pub fn inventory_disables(&self) -> usize {
        self.inventory_disables.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    pub fn seed_existing(&self, title: &str, id: &str) {
        lock(&self.existing).insert(title.to_string(), id.to_string());
    }

    pub fn fail_create_for(&self, title: &str) {
        lock(&self.failing_creates).insert(title.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.failing_creates).clear();
        self.fail_images.store(false, Ordering::SeqCst);
    }

    pub fn fail_images(&self) {
        self.fail_images.store(true, Ordering::SeqCst);
    }

    fn call(&self) {
        self.total_calls.fetch_add(1, Ordering::SeqCst);
    }
}

impl CommercePublisher for FakePublisher {
    fn store_id(&self) -> &str {
        "https://shop.example.com"
    }

    fn find_by_title<'a>(
        &'a self,
        title: &'a str,
    ) -> BoxFuture<'a, capability::Result<Vec<RemoteProduct>>> {
        Box::pin(async move {
            self.call();
            Ok(lock(&self.existing)
                .get(title)
                .map(|id| RemoteProduct {
                    id: id.clone(),
                    variants: Vec::new(),
                })
                .into_iter()
                .collect())
        })
    }

    fn create<'a>(&'a self, listing: &'a Listing) -> BoxFuture<'a, capability::Result<RemoteProduct>> {
        Box::pin(async move {
            self.call();
            if lock(&self.failing_creates).contains(&listing.title) {
                return Err(CallError::transient("502 Bad Gateway"));
            }
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            let id = format!("gid-{n}");
            lock(&self.existing).insert(listing.title.clone(), id.clone());
            lock(&self.created).push(listing.title.clone());
            Ok(RemoteProduct {
                variants: (0..listing.variants.len())
                    .map(|i| RemoteVariant {
                        id: format!("{id}-v{i}"),
                        inventory_item_id: Some(format!("inv-{n}-{i}")),
                    })
                    .collect(),
                id,
            })
        })
    }

    fn add_image<'a>(
        &'a self,
        _product_id: &'a str,
        _image: &'a str,
    ) -> BoxFuture<'a, capability::Result<()>> {
        Box::pin(async move {
            self.call();
            if self.fail_images.load(Ordering::SeqCst) {
                return Err(CallError::transient("image rejected"));
            }
            self.image_uploads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn disable_inventory_tracking<'a>(
        &'a self,
        _inventory_item_id: &'a str,
    ) -> BoxFuture<'a, capability::Result<()>> {
        Box::pin(async move {
            self.call();
            self.inventory_disables.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Repository that delegates to a `JsonJobStore` but can be told to fail.
pub(crate) struct FlakyStore {
    inner: Arc<JsonJobStore>,
    fail_updates: AtomicBool,
    fail_item_reads: AtomicBool,
}

impl FlakyStore {
    /// Every `update_job` fails from now on.
    pub fn fail_updates(&self) {
        self.fail_updates.store(true, Ordering::SeqCst);
    }

    /// Every `items_for_job` fails from now on.
    pub fn fail_item_reads(&self) {
        self.fail_item_reads.store(true, Ordering::SeqCst);
    }

    fn injected<'a, T: Send + 'a>(what: &str) -> BoxFuture<'a, RepoResult<T>> {
        let message = format!("injected {what} failure");
        Box::pin(async move { Err(Error::Repository(message)) })
    }
}

impl JobRepository for FlakyStore {
    fn create_job<'a>(&'a self, source_ref: &'a str) -> BoxFuture<'a, RepoResult<Job>> {
        self.inner.create_job(source_ref)
    }

    fn job(&self, id: JobId) -> BoxFuture<'_, RepoResult<Job>> {
        self.inner.job(id)
    }

    fn jobs(&self) -> BoxFuture<'_, RepoResult<Vec<Job>>> {
        self.inner.jobs()
    }

    fn update_job<'a>(&'a self, id: JobId, update: JobUpdate<'a>) -> BoxFuture<'a, RepoResult<Job>> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Self::injected("update");
        }
        self.inner.update_job(id, update)
    }

    fn reopen_job(&self, id: JobId) -> BoxFuture<'_, RepoResult<Job>> {
        self.inner.reopen_job(id)
    }

    fn source_products<'a>(
        &'a self,
        source_ref: &'a str,
    ) -> BoxFuture<'a, RepoResult<Vec<SourceProduct>>> {
        self.inner.source_products(source_ref)
    }

    fn add_source_products(&self, products: Vec<SourceProduct>) -> BoxFuture<'_, RepoResult<usize>> {
        self.inner.add_source_products(products)
    }

    fn item_for_product(
        &self,
        source_product_id: u64,
    ) -> BoxFuture<'_, RepoResult<Option<GeneratedItem>>> {
        self.inner.item_for_product(source_product_id)
    }

    fn claim_item(
        &self,
        job_id: JobId,
        source_product_id: u64,
    ) -> BoxFuture<'_, RepoResult<Option<GeneratedItem>>> {
        self.inner.claim_item(job_id, source_product_id)
    }

    fn insert_item(&self, item: NewItem) -> BoxFuture<'_, RepoResult<GeneratedItem>> {
        self.inner.insert_item(item)
    }

    fn set_remote_id<'a>(&'a self, item_id: u64, remote_id: &'a str) -> BoxFuture<'a, RepoResult<()>> {
        self.inner.set_remote_id(item_id, remote_id)
    }

    fn items_for_job(&self, job_id: JobId) -> BoxFuture<'_, RepoResult<Vec<GeneratedItem>>> {
        if self.fail_item_reads.load(Ordering::SeqCst) {
            return Self::injected("item read");
        }
        self.inner.items_for_job(job_id)
    }

    fn item_counts(&self, job_id: JobId) -> BoxFuture<'_, RepoResult<(u64, u64)>> {
        self.inner.item_counts(job_id)
    }
}

/// Wired-up context over fakes with one pending job for `BATCH`.
pub(crate) struct Harness {
    pub ctx: TaskContext,
    pub job_id: JobId,
    pub store: Arc<JsonJobStore>,
    pub repo: Arc<FlakyStore>,
    pub enhancer: Arc<FakeEnhancer>,
    pub editor: Arc<FakeEditor>,
    pub publisher: Arc<FakePublisher>,
}

impl Harness {
    pub async fn new() -> Self {
        let store = Arc::new(JsonJobStore::in_memory());
        let repo = Arc::new(FlakyStore {
            inner: store.clone(),
            fail_updates: AtomicBool::new(false),
            fail_item_reads: AtomicBool::new(false),
        });
        let job = store.create_job(BATCH).await.unwrap();
        let enhancer = Arc::new(FakeEnhancer::default());
        let editor = Arc::new(FakeEditor::default());
        let publisher = Arc::new(FakePublisher::default());
        let ctx = TaskContext {
            repo: repo.clone(),
            enhancer: enhancer.clone(),
            editor: editor.clone(),
            publisher: publisher.clone(),
            gates: Arc::new(GateBank::default()),
            settings: TaskSettings::default(),
        };
        Self {
            ctx,
            job_id: job.id,
            store,
            repo,
            enhancer,
            editor,
            publisher,
        }
    }

    /// Import products `1..=n` into the harness batch.
    pub async fn seed(&self, n: u64) {
        let products = (1..=n).map(product).collect();
        self.store.add_source_products(products).await.unwrap();
    }
}
