//! The per-product unit of work
//!
//! Call order within one product is fixed: enhance, main image, angle image,
//! push. Every external call goes through its service's gate. The repository
//! is checked first so a product that already has a generated item, from this
//! job or an earlier one, is never regenerated, and one that already has a
//! remote id is never pushed again.

use std::sync::Arc;
use std::time::Duration;

use capability::{CommercePublisher, ContentEnhancer, EditError, ImageEditor, ImageVariation};
use chrono::{DateTime, Utc};
use rate_gate::{GateBank, Service};
use tracing::{debug, info, instrument, warn};

use crate::error::Error;
use crate::listing::{build_listing, draft, image_context, usable_images, valid_variants};
use crate::model::{GeneratedItem, JobId, NewItem, SourceProduct};
use crate::repository::JobRepository;

/// Retry policy for image edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSettings {
    /// Attempts per image edit, including the first
    pub max_image_attempts: u32,
    /// Backoff unit; attempt `n` waits `n * image_backoff` before the next try
    pub image_backoff: Duration,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            max_image_attempts: 3,
            image_backoff: Duration::from_millis(500),
        }
    }
}

/// Everything a task needs, shared by all tasks of every run.
#[derive(Clone)]
pub struct TaskContext {
    pub repo: Arc<dyn JobRepository>,
    pub enhancer: Arc<dyn ContentEnhancer>,
    pub editor: Arc<dyn ImageEditor>,
    pub publisher: Arc<dyn CommercePublisher>,
    pub gates: Arc<GateBank>,
    pub settings: TaskSettings,
}

/// A product that ended with a generated item confirmed in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub item_id: u64,
    pub remote_id: String,
    /// False when an existing item was reused
    pub generated: bool,
}

/// Why a product did not finish.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskFailure {
    /// Bad source data or a failed call. Recorded; the batch continues.
    #[error("{0}")]
    Product(String),

    /// Every image edit key is exhausted. Escalates to the driver.
    #[error("all image edit keys exhausted until {reset_at}")]
    QuotaExhausted { reset_at: DateTime<Utc> },
}

impl From<Error> for TaskFailure {
    fn from(err: Error) -> Self {
        TaskFailure::Product(err.to_string())
    }
}

impl From<rate_gate::Error> for TaskFailure {
    fn from(err: rate_gate::Error) -> Self {
        TaskFailure::Product(err.to_string())
    }
}

/// Generate and push one product.
#[instrument(skip_all, fields(job_id = %job_id, product_id = product.id))]
pub async fn process_product(
    ctx: &TaskContext,
    job_id: JobId,
    product: &SourceProduct,
) -> Result<TaskOutcome, TaskFailure> {
    if let Some(item) = ctx.repo.claim_item(job_id, product.id).await? {
        if let Some(remote_id) = item.remote_id {
            debug!(item_id = item.id, "already generated and pushed");
            return Ok(TaskOutcome {
                item_id: item.id,
                remote_id,
                generated: false,
            });
        }
        info!(item_id = item.id, "already generated, pushing only");
        let remote_id = push_item(ctx, &item).await?;
        return Ok(TaskOutcome {
            item_id: item.id,
            remote_id,
            generated: false,
        });
    }

    let images = usable_images(product);
    let Some(source_image) = images.first() else {
        return Err(TaskFailure::Product("no usable images".into()));
    };
    if valid_variants(product).is_empty() {
        return Err(TaskFailure::Product("no valid variants".into()));
    }

    let product_draft = draft(product);
    let fields = ctx
        .gates
        .run(&Service::Enhancement, ctx.enhancer.enhance(&product_draft))
        .await?
        .map_err(|e| TaskFailure::Product(format!("enhancement failed: {e}")))?;

    let context = image_context(product);
    let main = edit_with_retry(ctx, &source_image.url, &context, ImageVariation::Main).await?;
    let angle = edit_with_retry(ctx, &source_image.url, &context, ImageVariation::Angle).await?;

    let item = ctx
        .repo
        .insert_item(NewItem {
            job_id,
            source_product_id: product.id,
            listing: build_listing(product, &fields),
            images: vec![main, angle],
        })
        .await?;
    debug!(item_id = item.id, "generated item stored");

    let remote_id = push_item(ctx, &item).await?;
    Ok(TaskOutcome {
        item_id: item.id,
        remote_id,
        generated: true,
    })
}

/// Edit one image, retrying to absorb key rotation and transient failures.
///
/// Total exhaustion is returned at once; retrying cannot help until reset.
async fn edit_with_retry(
    ctx: &TaskContext,
    source_image: &str,
    context: &str,
    variation: ImageVariation,
) -> Result<String, TaskFailure> {
    let attempts = ctx.settings.max_image_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let result = ctx
            .gates
            .run(
                &Service::ImageEdit,
                ctx.editor.edit(source_image, context, variation),
            )
            .await?;

        match result {
            Ok(Some(image)) => return Ok(image),
            Ok(None) => last_error = "no image returned".into(),
            Err(EditError::QuotaExhausted { reset_at }) => {
                return Err(TaskFailure::QuotaExhausted { reset_at });
            }
            Err(EditError::Rotated(key)) => {
                debug!(key = %key, variation = variation.as_str(), "key rotated, retrying");
                last_error = format!("key {key} exhausted");
            }
            Err(EditError::Call(e)) => {
                warn!(attempt, variation = variation.as_str(), error = %e, "image edit failed");
                last_error = e.to_string();
            }
        }

        if attempt < attempts {
            tokio::time::sleep(ctx.settings.image_backoff * attempt).await;
        }
    }

    Err(TaskFailure::Product(format!(
        "{} image edit failed after {attempts} attempts: {last_error}",
        variation.as_str()
    )))
}

/// Push a stored item to the destination store and record its remote id.
///
/// An exact title match already in the store counts as pushed. Image uploads
/// and inventory updates after a successful create only log on failure; the
/// product exists remotely at that point.
pub async fn push_item(ctx: &TaskContext, item: &GeneratedItem) -> Result<String, TaskFailure> {
    let publisher = &ctx.publisher;
    let store = Service::Store(publisher.store_id().to_string());
    let title = &item.listing.title;

    let existing = ctx
        .gates
        .run(&store, publisher.find_by_title(title))
        .await?
        .map_err(|e| TaskFailure::Product(format!("duplicate lookup failed: {e}")))?;
    if let Some(found) = existing.first() {
        info!(item_id = item.id, remote_id = %found.id, "title already in store, recording existing product");
        ctx.repo.set_remote_id(item.id, &found.id).await?;
        return Ok(found.id.clone());
    }

    let created = ctx
        .gates
        .run(&store, publisher.create(&item.listing))
        .await?
        .map_err(|e| TaskFailure::Product(format!("create failed: {e}")))?;

    for image in &item.images {
        if let Err(e) = ctx
            .gates
            .run(&store, publisher.add_image(&created.id, image))
            .await?
        {
            warn!(remote_id = %created.id, error = %e, "image upload failed");
        }
    }

    for variant in &created.variants {
        let Some(inventory_item_id) = &variant.inventory_item_id else {
            continue;
        };
        if let Err(e) = ctx
            .gates
            .run(&store, publisher.disable_inventory_tracking(inventory_item_id))
            .await?
        {
            warn!(
                remote_id = %created.id,
                inventory_item_id = %inventory_item_id,
                error = %e,
                "disabling inventory tracking failed"
            );
        }
    }

    ctx.repo.set_remote_id(item.id, &created.id).await?;
    info!(item_id = item.id, remote_id = %created.id, "pushed");
    Ok(created.id)
}
