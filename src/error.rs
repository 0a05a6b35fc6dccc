//! Error taxonomy and classification of AWS SDK errors.
//!
//! Task-level errors are downgraded to failure entries where the owning task
//! is joined; only validation and setup errors end a run.

use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use std::path::PathBuf;
use thiserror::Error;

/// Failure of a single provider call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Timeouts, connection failures and throttling. Retries belong to the
    /// SDK retry configuration, not to this crate.
    #[error("transient error during {operation}: {message}")]
    Transient { operation: String, message: String },

    /// Denied, not found and every other service-side rejection.
    #[error("{operation} failed ({code}): {message}")]
    Permanent {
        operation: String,
        code: String,
        message: String,
    },
}

impl ProviderError {
    pub fn permanent(operation: &str, code: &str, message: impl Into<String>) -> Self {
        ProviderError::Permanent {
            operation: operation.to_string(),
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn transient(operation: &str, message: impl Into<String>) -> Self {
        ProviderError::Transient {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            ProviderError::Permanent { code, .. } => Some(code),
            ProviderError::Transient { .. } => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code().is_some_and(|c| NOT_FOUND_CODES.contains(&c))
    }
}

#[derive(Debug, Error)]
pub enum RetireError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("pagination of {listing} stalled: cursor repeated {repeats} times")]
    PaginationStall { listing: String, repeats: u32 },

    /// Fatal to the whole run.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("worker for {key} did not finish: {message}")]
    Worker { key: String, message: String },

    #[error("aborted by user")]
    Aborted,
}

impl RetireError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RetireError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RetireError::Validation(_))
    }
}

pub type Result<T, E = RetireError> = std::result::Result<T, E>;

const NOT_FOUND_CODES: &[&str] = &[
    "NoSuchBucket",
    "NoSuchKey",
    "NoSuchVersion",
    "NotFound",
    "ResourceNotFoundException",
];

const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "SlowDown",
    "RequestLimitExceeded",
    "ServiceUnavailable",
];

/// Classify an error code reported by a service response.
pub fn classify_code(operation: &str, code: Option<&str>, message: Option<&str>) -> ProviderError {
    let message = message.unwrap_or("unknown error").to_string();
    match code {
        Some(c) if THROTTLING_CODES.contains(&c) => ProviderError::transient(operation, message),
        Some(c) => ProviderError::permanent(operation, c, message),
        None => ProviderError::permanent(operation, "Unknown", message),
    }
}

/// Convert any SDK operation error into a [`ProviderError`].
///
/// The SDK error types of all service crates share the smithy runtime, so this
/// works for S3, CloudWatch Logs and STS alike.
pub fn from_sdk<E, R>(operation: &str, err: SdkError<E, R>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            ProviderError::transient(operation, DisplayErrorContext(&err).to_string())
        }
        _ => {
            let message = err
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| DisplayErrorContext(&err).to_string());
            classify_code(operation, err.code(), Some(&message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_is_transient() {
        for code in THROTTLING_CODES {
            let err = classify_code("list", Some(code), Some("slow down"));
            assert!(matches!(err, ProviderError::Transient { .. }), "{code}");
        }
    }

    #[test]
    fn not_found_is_permanent() {
        for code in NOT_FOUND_CODES {
            let err = classify_code("head_bucket", Some(code), None);
            assert!(err.is_not_found(), "{code}");
            assert!(matches!(err, ProviderError::Permanent { .. }));
        }
    }

    #[test]
    fn access_denied_is_permanent_but_not_missing() {
        let err = classify_code("get_object", Some("AccessDenied"), Some("denied"));
        assert_eq!(err.code(), Some("AccessDenied"));
        assert!(!err.is_not_found());
    }

    #[test]
    fn only_validation_is_fatal() {
        assert!(RetireError::Validation("no bucket".into()).is_fatal());
        assert!(!RetireError::from(ProviderError::transient("x", "timeout")).is_fatal());
        assert!(!RetireError::PaginationStall { listing: "l".into(), repeats: 3 }.is_fatal());
    }
}
