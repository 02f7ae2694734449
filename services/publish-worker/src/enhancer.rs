//! Content enhancement over HTTP
//!
//! POSTs the product draft as JSON and expects the enhanced fields back.
//! Prompting and copy cleanup live behind the endpoint.

use capability::{BoxFuture, ContentEnhancer, EnhancedFields, ProductDraft};
use reqwest::Client;

use crate::http::{classify_generic, send_json};

pub struct HttpEnhancer {
    http: Client,
    endpoint: String,
}

impl HttpEnhancer {
    pub fn new(http: Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

impl ContentEnhancer for HttpEnhancer {
    fn id(&self) -> &str {
        "http-enhancer"
    }

    fn enhance<'a>(&'a self, draft: &'a ProductDraft) -> BoxFuture<'a, capability::Result<EnhancedFields>> {
        Box::pin(async move {
            let request = self.http.post(&self.endpoint).json(draft);
            send_json(request, "enhancement", classify_generic).await
        })
    }
}
