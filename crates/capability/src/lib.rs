//! External capabilities consumed by the job engine
//!
//! Defines the traits that decouple the orchestration engine from the concrete
//! services it drives: content enhancement, image editing, and commerce
//! publishing. The engine only relies on each capability's success/failure
//! contract; prompts, payload shapes, and transport live in the implementations.
//!
//! Image editing has two layers:
//! - `ImageEditClient` is one credential's view of the upstream service
//! - `ImageEditor` is the engine-facing front that rotates across credentials
//!   and reports total exhaustion

pub mod error;
pub mod types;

pub use error::{CallError, EditError, ErrorClassification, Result};
pub use types::{
    EnhancedFields, ImageVariation, Listing, ListingVariant, ProductDraft, RemoteProduct,
    RemoteVariant, format_price,
};

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by capability methods.
///
/// Uses `Pin<Box<dyn Future>>` so the traits stay dyn-compatible
/// (`Arc<dyn ContentEnhancer>` etc).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Rewrites a product's copy (title, description, SEO fields).
pub trait ContentEnhancer: Send + Sync {
    /// Identifier for logging (e.g. "http-enhancer").
    fn id(&self) -> &str;

    /// Enhance a draft. Fields the enhancer leaves unset fall back to the
    /// source product's values.
    fn enhance<'a>(&'a self, draft: &'a ProductDraft) -> BoxFuture<'a, Result<EnhancedFields>>;
}

/// A single credential's connection to the image edit service.
///
/// Returns `Ok(None)` when the service answered but produced no image. Quota
/// failures must be reported as `CallError` with `QuotaExceeded` classification
/// so the rotating front can switch credentials.
pub trait ImageEditClient: Send + Sync {
    fn edit<'a>(
        &'a self,
        source_image: &'a str,
        context: &'a str,
        variation: ImageVariation,
    ) -> BoxFuture<'a, Result<Option<String>>>;
}

/// Engine-facing image editing with credential rotation.
pub trait ImageEditor: Send + Sync {
    /// Edit one image.
    ///
    /// - `Err(EditError::Rotated)` means this credential was just retired and
    ///   the caller should try again (a different key will be used)
    /// - `Err(EditError::QuotaExhausted)` means every credential is exhausted
    fn edit<'a>(
        &'a self,
        source_image: &'a str,
        context: &'a str,
        variation: ImageVariation,
    ) -> BoxFuture<'a, std::result::Result<Option<String>, EditError>>;

    /// Clear exhaustion state after the quota period has rolled over.
    fn reset_exhausted(&self) -> BoxFuture<'_, ()>;

    /// Per-credential health summary as JSON.
    fn health(&self) -> BoxFuture<'_, serde_json::Value>;
}

/// Destination store operations used by the push sequence.
///
/// Each call is individually rate-gated by the engine through the store's
/// gate, keyed by `store_id()`.
pub trait CommercePublisher: Send + Sync {
    /// Stable identity of the destination store (e.g. the shop URL).
    fn store_id(&self) -> &str;

    /// Products whose title matches `title` exactly.
    fn find_by_title<'a>(&'a self, title: &'a str) -> BoxFuture<'a, Result<Vec<RemoteProduct>>>;

    fn create<'a>(&'a self, listing: &'a Listing) -> BoxFuture<'a, Result<RemoteProduct>>;

    /// Attach an image (http(s) URL or `data:` URL) to a remote product.
    fn add_image<'a>(&'a self, product_id: &'a str, image: &'a str) -> BoxFuture<'a, Result<()>>;

    fn disable_inventory_tracking<'a>(
        &'a self,
        inventory_item_id: &'a str,
    ) -> BoxFuture<'a, Result<()>>;
}
