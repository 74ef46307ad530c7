//! Error types for ObjectIO
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for ObjectIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for ObjectIO
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("attribute compare failed on {object}: {attr}")]
    CompareMismatch { object: String, attr: String },

    #[error("storage error: {0}")]
    Storage(String),

    // Object errors
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("object already exists: {0}")]
    ObjectExists(String),

    #[error("object busy: {0}")]
    Busy(String),

    // Pool and tier errors
    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    // Internal errors
    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

/// POSIX error numbers reported to clients
mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
    pub const EOPNOTSUPP: i32 = 95;
}

impl Error {
    /// Create an object not found error
    pub fn not_found(object: impl ToString) -> Self {
        Self::ObjectNotFound(object.to_string())
    }

    /// Create a busy error
    pub fn busy(object: impl ToString) -> Self {
        Self::Busy(object.to_string())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an internal inconsistency error
    pub fn inconsistency(msg: impl Into<String>) -> Self {
        Self::InternalInconsistency(msg.into())
    }

    /// Create a not implemented error
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        Self::NotImplemented(feature.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Check if this is a retryable error
    ///
    /// Only `Busy` qualifies: the conflicting operation will finish and the
    /// caller may simply try again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::ObjectNotFound(_) | Self::PoolNotFound(_))
    }

    /// Negative errno as returned by the client library
    #[must_use]
    pub const fn errno(&self) -> i32 {
        let code = match self {
            Self::ObjectNotFound(_) | Self::PoolNotFound(_) => errno::ENOENT,
            Self::Busy(_) => errno::EBUSY,
            Self::ObjectExists(_) => errno::EEXIST,
            Self::Configuration(_) | Self::InvalidArgument(_) | Self::CompareMismatch { .. } => {
                errno::EINVAL
            }
            Self::NotImplemented(_) => errno::EOPNOTSUPP,
            Self::DiskIo(_)
            | Self::ChecksumMismatch { .. }
            | Self::Storage(_)
            | Self::InternalInconsistency(_)
            | Self::Serialization(_)
            | Self::Deserialization(_) => errno::EIO,
        };
        -code
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::busy("foo").is_retryable());
        assert!(!Error::not_found("foo").is_retryable());
        assert!(!Error::configuration("bad").is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::not_found("foo").is_not_found());
        assert!(Error::PoolNotFound("cache".into()).is_not_found());
        assert!(!Error::busy("foo").is_not_found());
    }

    #[test]
    fn test_error_errno() {
        assert_eq!(Error::not_found("foo").errno(), -2);
        assert_eq!(Error::busy("foo").errno(), -16);
        assert_eq!(Error::ObjectExists("foo".into()).errno(), -17);
        assert_eq!(Error::configuration("x").errno(), -22);
        assert_eq!(Error::not_implemented("x").errno(), -95);
        assert_eq!(Error::inconsistency("x").errno(), -5);
    }
}
