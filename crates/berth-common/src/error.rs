//! Error types for Berth
//!
//! Every store operation reports failures through [`Error`]. The variants
//! form a small taxonomy callers match on (`is_not_found`,
//! `is_already_exists`, ...); the message carries the object id and bucket
//! path so a failure can be diagnosed without re-deriving it.

use thiserror::Error;

/// Common result type for Berth operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Berth
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no transaction in context")]
    NoTransaction,

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an already exists error
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create a failed precondition error
    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        Self::FailedPrecondition(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Prefix the message with additional context, keeping the variant.
    #[must_use]
    pub fn context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            Self::NotFound(m) => Self::NotFound(format!("{ctx}: {m}")),
            Self::AlreadyExists(m) => Self::AlreadyExists(format!("{ctx}: {m}")),
            Self::FailedPrecondition(m) => Self::FailedPrecondition(format!("{ctx}: {m}")),
            Self::InvalidArgument(m) => Self::InvalidArgument(format!("{ctx}: {m}")),
            Self::Storage(m) => Self::Storage(format!("{ctx}: {m}")),
            Self::Serialization(m) => Self::Serialization(format!("{ctx}: {m}")),
            Self::Deserialization(m) => Self::Deserialization(format!("{ctx}: {m}")),
            Self::Internal(m) => Self::Internal(format!("{ctx}: {m}")),
            other => other,
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is an already exists error
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Check if this is a failed precondition error
    #[must_use]
    pub fn is_failed_precondition(&self) -> bool {
        matches!(self, Self::FailedPrecondition(_))
    }

    /// Check if this is an invalid argument error
    #[must_use]
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }

    /// Check if the call was made outside a transaction
    #[must_use]
    pub fn is_no_transaction(&self) -> bool {
        matches!(self, Self::NoTransaction)
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            Self::Deserialization(e.to_string())
        } else {
            Self::Serialization(e.to_string())
        }
    }
}
