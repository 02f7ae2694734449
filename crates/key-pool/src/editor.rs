//! Rotating image edit front
//!
//! Wraps a `KeyRotator` of per-key image edit clients behind the engine's
//! `ImageEditor` trait. Each call uses the next available key; a quota
//! failure retires that key and surfaces as `EditError::Rotated` so the
//! caller's retry lands on a fresh key.

use std::sync::Arc;

use capability::{
    BoxFuture, CallError, EditError, ErrorClassification, ImageEditClient, ImageEditor,
    ImageVariation,
};
use tracing::{debug, warn};

use crate::error::Error;
use crate::pool::KeyRotator;

/// `ImageEditor` that spreads calls across a pool of keys.
pub struct RotatingImageEditor<C> {
    rotator: Arc<KeyRotator<C>>,
}

impl<C> RotatingImageEditor<C> {
    pub fn new(rotator: Arc<KeyRotator<C>>) -> Self {
        Self { rotator }
    }

    pub fn rotator(&self) -> &Arc<KeyRotator<C>> {
        &self.rotator
    }
}

fn pool_error(err: Error) -> EditError {
    match err {
        Error::AllExhausted { reset_at } => EditError::QuotaExhausted { reset_at },
        other => EditError::Call(CallError::transient(other.to_string())),
    }
}

impl<C: ImageEditClient + 'static> ImageEditor for RotatingImageEditor<C> {
    fn edit<'a>(
        &'a self,
        source_image: &'a str,
        context: &'a str,
        variation: ImageVariation,
    ) -> BoxFuture<'a, Result<Option<String>, EditError>> {
        Box::pin(async move {
            let lease = self.rotator.next_client().await.map_err(pool_error)?;
            debug!(key = %lease.key, variation = variation.as_str(), "editing image");

            let err = match lease.client.edit(source_image, context, variation).await {
                Ok(image) => return Ok(image),
                Err(err) => err,
            };

            match err.classification() {
                ErrorClassification::QuotaExceeded => {
                    self.rotator
                        .mark_exhausted(&lease.key)
                        .await
                        .map_err(pool_error)?;
                    Err(EditError::Rotated(lease.key))
                }
                ErrorClassification::Permanent => {
                    warn!(key = %lease.key, error = %err, "image edit key rejected");
                    self.rotator.disable(&lease.key).await.map_err(pool_error)?;
                    Err(EditError::Rotated(lease.key))
                }
                ErrorClassification::Transient => Err(EditError::Call(err)),
            }
        })
    }

    fn reset_exhausted(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.rotator.reset_all())
    }

    fn health(&self) -> BoxFuture<'_, serde_json::Value> {
        Box::pin(self.rotator.health())
    }
}
