//! Error types for the store.

use thiserror::Error;

/// Result type for store operations.
pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    /// The underlying database driver failed.
    #[error("database driver error: {0}")]
    Driver(#[from] sqlx::Error),

    /// A persisted row does not decode into its domain type.
    #[error("invalid persisted data: {0}")]
    InvalidData(String),

    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation would violate a store contract.
    #[error("store contract violation: {0}")]
    Contract(String),
}
