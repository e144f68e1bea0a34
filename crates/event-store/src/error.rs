use thiserror::Error;

use crate::BatchId;

/// Errors that can occur when interacting with the event log or snapshot store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// A competing writer already committed into one of the batch's slots,
    /// either an (aggregate id, sequence number) pair or a global position.
    #[error("Conflict committing batch {batch_id}: {reason}")]
    Conflict { batch_id: BatchId, reason: String },

    /// A batch with missing, duplicate or non-contiguous sequence numbers.
    #[error("Sequence validation failed: {0}")]
    Validation(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    /// Returns true for the only error class the command processor retries.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EventStoreError::Conflict { .. })
    }
}

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;
