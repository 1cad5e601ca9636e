//! Error taxonomy shared by every data server backend.
//!
//! Operation errors (bad arguments, contention, type mismatches) and
//! infrastructure errors (worker unreachable, corrupt snapshot) live in one
//! enum so that callers handle every backend the same way. [`ErrorKind`] is the
//! serializable twin used to carry an error across the worker socket.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DataServerError>;

/// Errors produced by a data server.
#[derive(Debug, Error)]
pub enum DataServerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("namespace already exists: {0}")]
    AlreadyExists(String),

    #[error("key is locked: {0}")]
    Locked(String),

    #[error("timed out waiting for the lock on {0}")]
    LockTimeout(String),

    #[error("lock token does not match the holder of {0}")]
    InvalidToken(String),

    #[error("value stored at {0} is not a number")]
    NotANumber(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("snapshot is corrupt: {0}")]
    PersistenceCorrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire-level discriminant of a [`DataServerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    Locked,
    LockTimeout,
    InvalidToken,
    NotANumber,
    BackendUnavailable,
    PersistenceCorrupt,
}

impl DataServerError {
    /// Returns the wire discriminant for this error.
    ///
    /// Local I/O failures have no counterpart on the caller's side of the
    /// socket and are reported as [`ErrorKind::BackendUnavailable`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Locked(_) => ErrorKind::Locked,
            Self::LockTimeout(_) => ErrorKind::LockTimeout,
            Self::InvalidToken(_) => ErrorKind::InvalidToken,
            Self::NotANumber(_) => ErrorKind::NotANumber,
            Self::BackendUnavailable(_) | Self::Io(_) => ErrorKind::BackendUnavailable,
            Self::PersistenceCorrupt(_) => ErrorKind::PersistenceCorrupt,
        }
    }

    /// The human-readable detail carried by the error, without the variant prefix.
    pub fn detail(&self) -> String {
        match self {
            Self::InvalidArgument(s)
            | Self::NotFound(s)
            | Self::AlreadyExists(s)
            | Self::Locked(s)
            | Self::LockTimeout(s)
            | Self::InvalidToken(s)
            | Self::NotANumber(s)
            | Self::BackendUnavailable(s)
            | Self::PersistenceCorrupt(s) => s.clone(),
            Self::Io(e) => e.to_string(),
        }
    }

    /// Rebuilds an error from its wire form.
    pub fn from_parts(kind: ErrorKind, detail: String) -> Self {
        match kind {
            ErrorKind::InvalidArgument => Self::InvalidArgument(detail),
            ErrorKind::NotFound => Self::NotFound(detail),
            ErrorKind::AlreadyExists => Self::AlreadyExists(detail),
            ErrorKind::Locked => Self::Locked(detail),
            ErrorKind::LockTimeout => Self::LockTimeout(detail),
            ErrorKind::InvalidToken => Self::InvalidToken(detail),
            ErrorKind::NotANumber => Self::NotANumber(detail),
            ErrorKind::BackendUnavailable => Self::BackendUnavailable(detail),
            ErrorKind::PersistenceCorrupt => Self::PersistenceCorrupt(detail),
        }
    }

    /// Returns `true` for failures of the storage machinery rather than of the
    /// individual call. Hosts typically log these and retry or fall back.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_) | Self::PersistenceCorrupt(_) | Self::Io(_)
        )
    }
}

// Identifies a key in error messages.
pub(crate) fn key_label(namespace: &str, key: &str) -> String {
    format!("{namespace}/{key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_rebuild_the_same_variant() {
        let original = DataServerError::NotANumber("ns/a".into());
        let rebuilt = DataServerError::from_parts(original.kind(), original.detail());
        assert!(matches!(rebuilt, DataServerError::NotANumber(ref s) if s == "ns/a"));
    }

    #[test]
    fn io_travels_as_backend_unavailable() {
        let err = DataServerError::from(std::io::Error::other("disk gone"));
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert_eq!(err.detail(), "disk gone");
        assert!(err.is_infrastructure());
    }

    #[test]
    fn operation_errors_are_not_infrastructure() {
        assert!(!DataServerError::Locked("ns/a".into()).is_infrastructure());
        assert!(!DataServerError::InvalidToken("ns/a".into()).is_infrastructure());
        assert!(DataServerError::PersistenceCorrupt("bad".into()).is_infrastructure());
    }

    #[test]
    fn kind_uses_camel_case_on_the_wire() {
        let json = serde_json::to_string(&ErrorKind::LockTimeout).unwrap();
        assert_eq!(json, "\"lockTimeout\"");
    }
}
