use common::OperationId;
use thiserror::Error;

use crate::Version;

/// Errors that can occur when interacting with the execution-info store.
#[derive(Debug, Error)]
pub enum ExecutionStoreError {
    /// The record was modified by someone else since it was loaded.
    #[error(
        "Concurrency conflict for {operation_name}/{operation_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        operation_name: String,
        operation_id: OperationId,
        expected: Version,
        actual: Version,
    },

    /// The record does not exist (it was never created or has been deleted).
    #[error("Execution info not found: {operation_name}/{operation_id}")]
    NotFound {
        operation_name: String,
        operation_id: OperationId,
    },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExecutionStoreError {
    /// Returns true if retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExecutionStoreError::ConcurrencyConflict { .. } | ExecutionStoreError::Database(_)
        )
    }
}

/// Result type for execution-info store operations.
pub type Result<T> = std::result::Result<T, ExecutionStoreError>;
