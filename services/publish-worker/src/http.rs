//! Shared request plumbing for the upstream clients

use capability::{CallError, ErrorClassification};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;

/// Classification for stores and the enhancer: throttling and server errors
/// are worth another try, other 4xx responses are not.
pub fn classify_generic(status: u16, _body: &str) -> ErrorClassification {
    match status {
        429 | 500..=599 => ErrorClassification::Transient,
        400..=499 => ErrorClassification::Permanent,
        _ => ErrorClassification::Transient,
    }
}

/// Send a request and decode a JSON success body.
///
/// Non-success statuses become a `CallError` classified by `classify`; the
/// message carries `what`, the status, and the (truncated) response body.
pub async fn send_json<T: DeserializeOwned>(
    request: RequestBuilder,
    what: &str,
    classify: fn(u16, &str) -> ErrorClassification,
) -> Result<T, CallError> {
    let response = request
        .send()
        .await
        .map_err(|e| CallError::transient(format!("{what} request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(CallError::new(
            classify(status.as_u16(), &body),
            format!("{what} returned {status}: {}", truncate(&body, 500)),
        ));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| CallError::transient(format!("invalid {what} response: {e}")))
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
