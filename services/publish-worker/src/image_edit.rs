//! Per-key image edit client
//!
//! One instance per API key; the key rotator builds them lazily. Failures
//! are classified through the key pool's quota rules so a spent key is
//! retired instead of retried.

use capability::{BoxFuture, CallError, ErrorClassification, ImageEditClient, ImageVariation};
use common::Secret;
use key_pool::{classify_message, classify_status};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::http::send_json;

const KEY_HEADER: &str = "x-goog-api-key";

pub struct HttpImageEditClient {
    http: Client,
    endpoint: String,
    key: Secret<String>,
}

#[derive(Debug, Serialize)]
struct EditRequest<'a> {
    image_url: &'a str,
    context: &'a str,
    variation: ImageVariation,
}

#[derive(Debug, Deserialize)]
struct EditResponse {
    /// Edited image as a `data:` URL or an http(s) URL
    #[serde(default)]
    image: Option<String>,
}

impl HttpImageEditClient {
    pub fn new(http: Client, endpoint: impl Into<String>, key: Secret<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            key,
        }
    }
}

impl ImageEditClient for HttpImageEditClient {
    fn edit<'a>(
        &'a self,
        source_image: &'a str,
        context: &'a str,
        variation: ImageVariation,
    ) -> BoxFuture<'a, capability::Result<Option<String>>> {
        Box::pin(async move {
            let request = self
                .http
                .post(&self.endpoint)
                .header(KEY_HEADER, self.key.expose().as_str())
                .json(&EditRequest {
                    image_url: source_image,
                    context,
                    variation,
                });
            let response: EditResponse = send_json(request, "image edit", classify_status)
                .await
                .map_err(|e| match e.classification() {
                    // Quota text can also arrive on a transport-level failure
                    ErrorClassification::Transient => {
                        CallError::new(classify_message(e.message()), e.message())
                    }
                    _ => e,
                })?;
            Ok(response.image.filter(|image| !image.trim().is_empty()))
        })
    }
}
