//! Unified error type for the communication substrate.
//!
//! Mirrors the taxonomy every service in this crate is specified against:
//! validation failures are surfaced immediately, storage-backend hiccups are
//! retried internally and only escalate once retries are exhausted, and a
//! handful of domain invariants (duplicate keys, conflicting mutations) get
//! their own variants so callers can branch on them without string matching.

use thiserror::Error;

/// Error type shared by every public operation in this crate.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A caller-supplied value failed validation (empty field, out-of-range
    /// priority, malformed tenant id, pattern that fails to compile, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint was violated.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// A domain invariant was violated (e.g. deleting the active tenant).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The storage backend is transiently unavailable. Surfaced only after
    /// the adapter's internal retry budget is exhausted.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The caller's cancellation token fired before the operation completed.
    #[error("operation cancelled")]
    Cancelled,

    /// Transport-level failure talking to the backend (connection, decode).
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend response could not be decoded into the expected shape.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Misconfiguration (missing URL, bad credentials shape, ...).
    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Whether retrying the operation that produced this error is sensible.
    ///
    /// Only transient, backend-level failures are retryable; validation and
    /// domain-invariant errors are retried never, since the input won't
    /// change on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::Transport(_))
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Self::BackendUnavailable(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_unavailable_is_retryable() {
        assert!(StorageError::BackendUnavailable("timeout".into()).is_retryable());
    }

    #[test]
    fn invalid_argument_is_not_retryable() {
        assert!(!StorageError::InvalidArgument("bad priority".into()).is_retryable());
    }

    #[test]
    fn conflict_is_not_retryable() {
        assert!(!StorageError::Conflict("active tenant".into()).is_retryable());
    }

    #[test]
    fn display_messages_are_stable() {
        assert_eq!(
            StorageError::not_found("message msg-1").to_string(),
            "not found: message msg-1"
        );
        assert_eq!(
            StorageError::conflict("cannot delete active agency").to_string(),
            "conflict: cannot delete active agency"
        );
    }
}
