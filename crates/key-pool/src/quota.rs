//! Quota detection for image edit service failures
//!
//! The image edit service reports daily quota exhaustion either as a 429
//! status or, when the failure surfaces through an error message rather than
//! a raw response, as text naming the exhausted resource. Only quota failures
//! retire a key.

use capability::ErrorClassification;

/// Message fragments that mark a failure as quota exhaustion.
const QUOTA_PATTERNS: &[&str] = &["resource_exhausted", "quota exceeded", "429"];

/// Classify an error message as quota exhaustion or a transient failure.
pub fn classify_message(message: &str) -> ErrorClassification {
    let lower = message.to_lowercase();
    if QUOTA_PATTERNS.iter().any(|pattern| lower.contains(pattern)) {
        ErrorClassification::QuotaExceeded
    } else {
        ErrorClassification::Transient
    }
}

/// Classify an upstream failure by HTTP status and response body.
///
/// 429 is always quota exhaustion. 401/403 are Permanent (rejected key).
/// Any other status falls back to the body text, so a 400 carrying
/// `RESOURCE_EXHAUSTED` still retires the key.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    match status {
        429 => ErrorClassification::QuotaExceeded,
        401 | 403 => ErrorClassification::Permanent,
        _ => classify_message(body),
    }
}
