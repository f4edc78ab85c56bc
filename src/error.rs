//! Error types for the execution engine.
//!
//! Every failure the core can produce maps to one of a closed set of
//! [`ErrorKind`]s. The kind decides how the outcome is surfaced: a handful
//! of kinds become `success=false` with an `error` body, everything else is
//! reported inside the `data` block of the execution result (see
//! [`crate::result`]).

use std::time::Duration;

use serde::Serialize;

/// Closed set of error kinds surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Isolation backend (Docker) not reachable.
    BackendUnavailable,
    /// Sandbox image could not be pulled (after one retry).
    ImagePullFailed,
    /// Sandbox creation failed (configuration or resource exhaustion).
    StartFailed,
    /// Payload exceeded its wall-clock limit.
    Timeout,
    /// Payload exceeded its memory cap.
    OutOfMemory,
    /// Payload itself exited non-zero; not an error of the core.
    PayloadCrashed,
    /// Policy resolution failed; execution proceeds with the default policy.
    PolicyFetchFailed,
    /// A single outbound request was denied; normal payload-visible behavior.
    PolicyDenied,
    /// Concurrency ceiling exceeded and the queue deadline passed.
    QueueFull,
    /// Malformed execution request.
    BadRequest,
    /// Programmer error; carries a correlation id.
    Internal,
}

impl ErrorKind {
    /// Whether this kind surfaces as `success=false` with an `error` body.
    ///
    /// All other kinds are reported through the `data` block (sentinel exit
    /// codes, audit entries) because they describe observable payload
    /// behavior rather than a failure of the core.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ErrorKind::BadRequest
                | ErrorKind::BackendUnavailable
                | ErrorKind::QueueFull
                | ErrorKind::Internal
        )
    }
}

/// Errors produced by the execution engine and its subsystems.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Docker daemon is not available or not running.
    #[error("isolation backend not available: {reason}")]
    BackendUnavailable { reason: String },

    /// Failed to pull the sandbox image.
    #[error("image pull failed for {image}: {reason}")]
    ImagePullFailed { image: String, reason: String },

    /// Failed to create or start the sandbox.
    #[error("sandbox start failed: {reason}")]
    StartFailed { reason: String },

    /// Payload exceeded the wall-clock limit.
    #[error("payload timed out after {0:?}")]
    Timeout(Duration),

    /// Payload was killed by the memory cap.
    #[error("payload exceeded memory limit of {limit_bytes} bytes")]
    OutOfMemory { limit_bytes: u64 },

    /// Concurrency ceiling reached and the queue deadline expired.
    #[error("execution queue full after waiting {0:?}")]
    QueueFull(Duration),

    /// Malformed execution request.
    #[error("bad request: {reason}")]
    BadRequest { reason: String },

    /// Policy service could not be reached or returned garbage.
    #[error("policy fetch failed: {reason}")]
    PolicyFetchFailed { reason: String },

    /// Configuration error at startup.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// Docker API error.
    #[error("docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Programmer error, surfaced with a correlation id.
    #[error("internal error [{correlation_id}]: {reason}")]
    Internal {
        correlation_id: uuid::Uuid,
        reason: String,
    },
}

impl Error {
    /// Construct an internal error with a fresh correlation id.
    pub fn internal(reason: impl Into<String>) -> Self {
        Error::Internal {
            correlation_id: uuid::Uuid::new_v4(),
            reason: reason.into(),
        }
    }

    /// Map this error to its externally visible kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Error::ImagePullFailed { .. } => ErrorKind::ImagePullFailed,
            Error::StartFailed { .. } => ErrorKind::StartFailed,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Error::QueueFull(_) => ErrorKind::QueueFull,
            Error::BadRequest { .. } => ErrorKind::BadRequest,
            Error::PolicyFetchFailed { .. } => ErrorKind::PolicyFetchFailed,
            Error::Config { .. } => ErrorKind::Internal,
            Error::Docker(_) => ErrorKind::BackendUnavailable,
            Error::Io(_) => ErrorKind::Internal,
            Error::Internal { .. } => ErrorKind::Internal,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_unavailable_display() {
        let err = Error::BackendUnavailable {
            reason: "daemon not running".to_string(),
        };
        assert!(err.to_string().contains("daemon not running"));
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
    }

    #[test]
    fn test_timeout_display() {
        let err = Error::Timeout(Duration::from_secs(30));
        let msg = err.to_string();
        assert!(msg.contains("timed out"));
        assert!(msg.contains("30"));
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_oom_display() {
        let err = Error::OutOfMemory {
            limit_bytes: 512 * 1024 * 1024,
        };
        assert!(err.to_string().contains("memory limit"));
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    }

    #[test]
    fn test_internal_carries_correlation_id() {
        let err = Error::internal("broken invariant");
        let msg = err.to_string();
        assert!(msg.contains("broken invariant"));
        if let Error::Internal { correlation_id, .. } = err {
            assert!(!correlation_id.is_nil());
        } else {
            panic!("expected Internal");
        }
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(ErrorKind::BadRequest.is_terminal());
        assert!(ErrorKind::BackendUnavailable.is_terminal());
        assert!(ErrorKind::QueueFull.is_terminal());
        assert!(ErrorKind::Internal.is_terminal());

        assert!(!ErrorKind::Timeout.is_terminal());
        assert!(!ErrorKind::OutOfMemory.is_terminal());
        assert!(!ErrorKind::PolicyDenied.is_terminal());
        assert!(!ErrorKind::PolicyFetchFailed.is_terminal());
        assert!(!ErrorKind::PayloadCrashed.is_terminal());
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::BackendUnavailable).unwrap();
        assert_eq!(json, "\"backend_unavailable\"");
        let json = serde_json::to_string(&ErrorKind::QueueFull).unwrap();
        assert_eq!(json, "\"queue_full\"");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = Error::from(io_err);
        assert!(err.to_string().contains("access denied"));
    }
}
