//! Projection error types.

use common::GlobalSequenceNumber;
use thiserror::Error;

/// Errors that can occur during projection processing.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// An error occurred in the event log.
    #[error("Event store error: {0}")]
    EventStore(#[from] event_store::EventStoreError),

    /// Failed to deserialize an event payload.
    #[error("Event deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// A projection-specific error.
    #[error("Projection error: {0}")]
    Projection(String),

    /// No projection with this name is registered.
    #[error("Unknown projection: {0}")]
    UnknownProjection(String),

    /// A projection did not reach the target position in time.
    #[error("Projection {projection} did not reach position {target} in time")]
    Timeout {
        projection: String,
        target: GlobalSequenceNumber,
    },

    /// The catch-up worker is no longer running.
    #[error("Catch-up worker stopped")]
    WorkerStopped,
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;
