//! Unified error type for the canopy core library.
//!
//! [`CanopyError`] covers the failures that reach a caller outside the core:
//! malformed envelopes, bad history queries and history file problems.
//! Modules keep their own narrower error types ([`FrameError`](crate::frame::FrameError),
//! [`LinkError`](crate::link::LinkError), [`ConfigError`](crate::config::ConfigError),
//! [`StorageError`]) and the storage one converts into this one with `?`.
//!
//! None of these errors is fatal to the hub. Each is isolated to the session
//! or operation that produced it.
//!
//! # Example
//!
//! ```rust
//! use canopy_core::error::{CanopyError, Result};
//! use canopy_core::Envelope;
//!
//! fn parse(raw: &str) -> Result<Envelope> {
//!     Envelope::from_json(raw)
//! }
//!
//! let err = parse("{oops").unwrap_err();
//! assert!(matches!(err, CanopyError::MalformedEnvelope(_)));
//! assert_eq!(err.error_code(), "MALFORMED_ENVELOPE");
//! ```

use thiserror::Error;

use crate::storage::StorageError;

/// The unified error type for canopy operations.
#[derive(Debug, Error)]
pub enum CanopyError {
    // =========================================================================
    // REQUEST ERRORS
    // =========================================================================
    /// An inbound payload is not a well-formed envelope.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// A history query asked for an unusable number of entries.
    #[error("Invalid limit: {0}")]
    InvalidLimit(String),

    // =========================================================================
    // PERSISTENCE ERRORS
    // =========================================================================
    /// The history file could not be read, parsed or written.
    #[error("Persistence error: {0}")]
    PersistenceError(String),
}

/// A specialized [`Result`] type for canopy operations.
pub type Result<T> = std::result::Result<T, CanopyError>;

impl CanopyError {
    /// Returns `true` for errors caused by caller input.
    #[inline]
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::MalformedEnvelope(_) | Self::InvalidLimit(_))
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::MalformedEnvelope(_) | Self::InvalidLimit(_) => 400,
            Self::PersistenceError(_) => 500,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::MalformedEnvelope(_) => "MALFORMED_ENVELOPE",
            Self::InvalidLimit(_) => "INVALID_LIMIT",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
        }
    }
}

impl From<StorageError> for CanopyError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ReadError { path, source } => {
                Self::PersistenceError(format!("Failed to read {}: {source}", path.display()))
            }
            StorageError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {}: {source}", path.display()))
            }
            StorageError::ParseError { path, source } => {
                Self::PersistenceError(format!("Failed to parse {}: {source}", path.display()))
            }
            StorageError::SerializeError(e) => Self::PersistenceError(e.to_string()),
            StorageError::CreateDirError { path, source } => Self::PersistenceError(format!(
                "Failed to create directory {}: {source}",
                path.display()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_client_error_classification() {
        assert!(CanopyError::MalformedEnvelope("x".into()).is_client_error());
        assert!(CanopyError::InvalidLimit("zero".into()).is_client_error());
        assert!(!CanopyError::PersistenceError("disk full".into()).is_client_error());
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(
            CanopyError::MalformedEnvelope("bad".into()).http_status_code(),
            400
        );
        assert_eq!(CanopyError::InvalidLimit("0".into()).http_status_code(), 400);
        assert_eq!(
            CanopyError::PersistenceError("error".into()).http_status_code(),
            500
        );
    }

    #[test]
    fn test_from_storage_error_keeps_path() {
        let err: CanopyError = StorageError::WriteError {
            path: PathBuf::from("/data/history.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        }
        .into();
        assert_eq!(err.error_code(), "PERSISTENCE_ERROR");
        let text = err.to_string();
        assert!(text.contains("/data/history.json"));
        assert!(text.contains("denied"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<CanopyError>();
        assert_sync::<CanopyError>();
    }
}
