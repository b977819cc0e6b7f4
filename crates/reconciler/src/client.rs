//! Remote resource client boundary.
//!
//! The reconciler talks to the remote API only through
//! [`BackendServiceClient`]. Every failure an implementation reports must be
//! classified into an [`ApiError`] so retry policy can tell transient
//! failures (retry with backoff) from permanent ones (surface immediately).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use thiserror::Error;

use crate::diff::ServicePatch;
use crate::types::{ObservedState, ResolvedState};

/// Coarse failure category driving retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The resource does not exist.
    NotFound,
    /// The write raced another writer (stale fingerprint, already exists).
    Conflict,
    /// Network failures, timeouts, rate limiting, 5xx - may retry.
    Transient,
    /// Validation failures and other 4xx - never retry.
    Permanent,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// A classified failure from the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("resource '{name}' not found")]
    NotFound { name: String },

    #[error("conflict: {reason}")]
    Conflict { reason: String },

    #[error("transient failure: {reason}")]
    Transient { reason: String },

    #[error("permanent failure: {reason}")]
    Permanent { reason: String },
}

impl ApiError {
    /// Create a not-found error.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Create a conflict error.
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    /// Create a transient error.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    /// Create a permanent error.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    /// A call that did not complete within its deadline.
    pub fn timeout(after: Duration) -> Self {
        Self::transient(format!("call timed out after {}ms", after.as_millis()))
    }

    /// A connection-level failure (refused, reset, DNS).
    pub fn network(reason: impl fmt::Display) -> Self {
        Self::transient(format!("network error: {reason}"))
    }

    /// Classify an HTTP response status.
    ///
    /// 404 is not-found, 409/412 are conflicts, 408/429/5xx are transient,
    /// every other non-success status is permanent.
    pub fn from_status(status: StatusCode, name: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            StatusCode::NOT_FOUND => Self::not_found(name),
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                Self::conflict(format!("{status}: {message}"))
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                Self::transient(format!("{status}: {message}"))
            }
            s if s.is_server_error() => Self::transient(format!("{status}: {message}")),
            _ => Self::permanent(format!("{status}: {message}")),
        }
    }

    /// The category of this error.
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Conflict { .. } => ErrorCategory::Conflict,
            Self::Transient { .. } => ErrorCategory::Transient,
            Self::Permanent { .. } => ErrorCategory::Permanent,
        }
    }

    /// Whether retrying with backoff may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Whether the resource does not exist.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the write conflicted with another writer.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// What a successful write returned.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The full post-write representation.
    Observed(Box<ObservedState>),
    /// Only an acknowledgement; the representation must be fetched.
    Accepted,
}

impl WriteOutcome {
    /// The representation, if the write returned one.
    pub fn into_observed(self) -> Option<ObservedState> {
        match self {
            Self::Observed(observed) => Some(*observed),
            Self::Accepted => None,
        }
    }
}

/// CRUD access to backend services on the remote API.
#[async_trait]
pub trait BackendServiceClient: Send + Sync {
    /// Fetch the current representation.
    async fn get(&self, name: &str) -> Result<ObservedState, ApiError>;

    /// Create a backend service from a fully-resolved description.
    async fn insert(&self, desired: &ResolvedState) -> Result<WriteOutcome, ApiError>;

    /// Apply an in-place patch, guarded by the patch's fingerprint.
    async fn update(&self, name: &str, patch: &ServicePatch) -> Result<WriteOutcome, ApiError>;

    /// Delete the backend service.
    async fn delete(&self, name: &str) -> Result<(), ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let cases = [
            (StatusCode::NOT_FOUND, ErrorCategory::NotFound),
            (StatusCode::CONFLICT, ErrorCategory::Conflict),
            (StatusCode::PRECONDITION_FAILED, ErrorCategory::Conflict),
            (StatusCode::TOO_MANY_REQUESTS, ErrorCategory::Transient),
            (StatusCode::REQUEST_TIMEOUT, ErrorCategory::Transient),
            (StatusCode::INTERNAL_SERVER_ERROR, ErrorCategory::Transient),
            (StatusCode::SERVICE_UNAVAILABLE, ErrorCategory::Transient),
            (StatusCode::BAD_REQUEST, ErrorCategory::Permanent),
            (StatusCode::FORBIDDEN, ErrorCategory::Permanent),
            (StatusCode::UNPROCESSABLE_ENTITY, ErrorCategory::Permanent),
        ];

        for (status, expected) in cases {
            let err = ApiError::from_status(status, "svc", "boom");
            assert_eq!(err.category(), expected, "status {status}");
        }
    }

    #[test]
    fn test_not_found_names_resource() {
        let err = ApiError::from_status(StatusCode::NOT_FOUND, "blablah", "");
        assert_eq!(err, ApiError::not_found("blablah"));
        assert!(err.to_string().contains("blablah"));
    }

    #[test]
    fn test_timeouts_and_network_errors_are_transient() {
        assert!(ApiError::timeout(Duration::from_millis(250)).is_transient());
        assert!(ApiError::network("connection reset").is_transient());
        assert!(!ApiError::permanent("invalid field").is_transient());
    }
}
