//! Error types for the chat store.

use thiserror::Error;

/// Errors that can occur against the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database stayed locked past the busy timeout
    #[error("database busy")]
    Busy,

    /// Any other SQLite failure
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored row could not be mapped back to a message
    #[error("invalid stored row: {0}")]
    InvalidRow(String),
}

impl StoreError {
    pub(crate) fn from_sqlite(err: rusqlite::Error) -> StoreError {
        if let rusqlite::Error::SqliteFailure(ref failure, _) = err {
            if failure.code == rusqlite::ErrorCode::DatabaseBusy
                || failure.code == rusqlite::ErrorCode::DatabaseLocked
            {
                return StoreError::Busy;
            }
        }
        StoreError::Sqlite(err)
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
