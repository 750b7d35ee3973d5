//! Storage-level errors.
//!
//! Everything that talks to redb directly returns [`MetaStoreResult`]; the
//! store APIs convert into the common taxonomy, where storage failures
//! surface as `Error::Storage`.

use berth_common::Error;

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("corrupt record at {path}: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

impl From<MetaStoreError> for Error {
    fn from(e: MetaStoreError) -> Self {
        match e {
            MetaStoreError::Io(io) => Self::Io(io),
            MetaStoreError::Bincode(b) => Self::Deserialization(b.to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Error for a stored value that cannot be decoded
pub(crate) fn corrupt(path: impl std::fmt::Display, reason: impl std::fmt::Display) -> MetaStoreError {
    MetaStoreError::Corrupt {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}
