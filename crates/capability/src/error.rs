//! Capability failure types

use chrono::{DateTime, Utc};

/// Classification of capability failures to decide retry/rotation strategy.
///
/// - QuotaExceeded retires the credential that made the call
/// - Permanent disables the credential (rejected key)
/// - Transient is retried (image edits) or recorded as a product failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// Network errors, timeouts, 5xx, malformed responses
    Transient,
    /// The credential's allotment for the current period is used up
    QuotaExceeded,
    /// Invalid credentials (401/403)
    Permanent,
}

impl ErrorClassification {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::Transient => "transient",
            ErrorClassification::QuotaExceeded => "quota_exceeded",
            ErrorClassification::Permanent => "permanent",
        }
    }
}

/// A failed call to an external capability.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{classification:?} failure: {message}", classification = self.classification)]
pub struct CallError {
    classification: ErrorClassification,
    message: String,
}

impl CallError {
    pub fn new(classification: ErrorClassification, message: impl Into<String>) -> Self {
        Self {
            classification,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClassification::Transient, message)
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(ErrorClassification::QuotaExceeded, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorClassification::Permanent, message)
    }

    pub fn classification(&self) -> ErrorClassification {
        self.classification
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Result alias for capability calls.
pub type Result<T> = std::result::Result<T, CallError>;

/// Errors from the rotating image editor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EditError {
    /// The credential used for this call was retired; retry picks another one.
    #[error("credential {0} exhausted, rotated to next key")]
    Rotated(String),

    #[error(transparent)]
    Call(#[from] CallError),

    /// Every credential is exhausted until `reset_at`.
    #[error("all image edit credentials exhausted until {reset_at}")]
    QuotaExhausted { reset_at: DateTime<Utc> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_error_display_carries_classification_and_message() {
        let err = CallError::quota("RESOURCE_EXHAUSTED: daily limit");
        let text = err.to_string();
        assert!(text.contains("QuotaExceeded"), "got: {text}");
        assert!(text.contains("daily limit"), "got: {text}");
        assert_eq!(err.classification(), ErrorClassification::QuotaExceeded);
    }

    #[test]
    fn constructors_set_classification() {
        assert_eq!(
            CallError::transient("timeout").classification(),
            ErrorClassification::Transient
        );
        assert_eq!(
            CallError::permanent("401").classification(),
            ErrorClassification::Permanent
        );
    }

    #[test]
    fn edit_error_wraps_call_error_transparently() {
        let err: EditError = CallError::transient("connection reset").into();
        assert_eq!(err.to_string(), CallError::transient("connection reset").to_string());
    }

    #[test]
    fn classification_labels_are_snake_case() {
        assert_eq!(ErrorClassification::QuotaExceeded.label(), "quota_exceeded");
        assert_eq!(ErrorClassification::Transient.label(), "transient");
        assert_eq!(ErrorClassification::Permanent.label(), "permanent");
    }
}
