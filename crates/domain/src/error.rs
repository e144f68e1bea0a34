//! Domain error types.

use common::{AggregateId, SequenceNumber};
use event_store::{EventStoreError, GlobalSequenceNumber};
use thiserror::Error;

use crate::processor::CommandProcessingResult;

/// Type-erased error raised by command handlers and aggregates.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while loading, hydrating and mutating aggregates.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// Aggregate not found.
    #[error("Aggregate not found: {aggregate_type} with id {aggregate_id}")]
    AggregateNotFound {
        aggregate_type: &'static str,
        aggregate_id: AggregateId,
    },

    /// An existing id was loaded as the wrong aggregate type.
    #[error("Aggregate {aggregate_id} is a {actual}, not a {expected}")]
    WrongAggregateType {
        aggregate_id: AggregateId,
        expected: &'static str,
        actual: String,
    },

    /// The stored stream skips or repeats a sequence number.
    #[error("Aggregate {aggregate_id} expected event {expected}, found {actual}")]
    InconsistentStream {
        aggregate_id: AggregateId,
        expected: SequenceNumber,
        actual: SequenceNumber,
    },

    /// Historical instances are read-only.
    #[error("Aggregate {aggregate_id} was loaded at cutoff {cutoff} and cannot emit events")]
    ReadOnly {
        aggregate_id: AggregateId,
        cutoff: GlobalSequenceNumber,
    },

    /// A snapshot could not be restored or taken.
    #[error("Snapshot error for {aggregate_id}: {source}")]
    Snapshot {
        aggregate_id: AggregateId,
        #[source]
        source: serde_json::Error,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by [`CommandProcessor::process_command`](crate::CommandProcessor::process_command).
#[derive(Debug, Error)]
pub enum CommandProcessingError {
    /// A declared domain error, passed through as raised by the handler.
    #[error("{0}")]
    Domain(BoxError),

    /// Any other failure while executing or committing the command. The
    /// original error is kept as the source.
    #[error("Processing {command_type} failed: {source}")]
    Failed {
        command_type: &'static str,
        #[source]
        source: BoxError,
    },

    /// Every attempt collided with a competing writer.
    #[error("Processing {command_type} gave up after {attempts} conflicting attempts")]
    ConflictRetriesExhausted {
        command_type: &'static str,
        attempts: u32,
        #[source]
        source: EventStoreError,
    },

    /// No handler is registered for the command type.
    #[error("No handler registered for command type {0}")]
    UnknownCommand(&'static str),

    /// The batch is durably committed, but handing it to the dispatcher failed.
    #[error("Events were committed ({result:?}) but dispatch failed: {source}")]
    Dispatch {
        result: CommandProcessingResult,
        #[source]
        source: BoxError,
    },

    /// Log or dispatcher initialization failed.
    #[error("Initialization failed: {0}")]
    Initialization(#[source] BoxError),
}

impl CommandProcessingError {
    /// Returns the pass-through domain error if it is an `E`.
    pub fn domain_error<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            CommandProcessingError::Domain(error) => error.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Returns true if the events were committed despite the error.
    pub fn is_committed(&self) -> bool {
        matches!(self, CommandProcessingError::Dispatch { .. })
    }
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;
