//! Identifier and position types shared by every crate in the workspace.

pub mod types;

pub use types::{AggregateId, BatchId, Cutoff, GlobalSequenceNumber, SequenceNumber};
