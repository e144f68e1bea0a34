//! Append-only event log contract, snapshot store contract, and their
//! in-memory and PostgreSQL backends.

pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod snapshot;
pub mod store;

pub use common::{AggregateId, BatchId, Cutoff, GlobalSequenceNumber, SequenceNumber};
pub use error::{EventStoreError, Result};
pub use event::{CommittedBatch, EventEnvelope, EventEnvelopeBuilder, EventId, Metadata};
pub use memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use snapshot::{Snapshot, SnapshotStore};
pub use store::{EventLog, EventLogExt, PageStream, SequenceExpectations, validate_batch};
