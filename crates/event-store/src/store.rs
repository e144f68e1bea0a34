use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::stream;

use crate::{
    AggregateId, BatchId, EventEnvelope, EventStoreError, GlobalSequenceNumber, Result,
    SequenceNumber,
};

/// A stream of pages read from the global log, in ascending position order.
pub type PageStream<'a> = Pin<Box<dyn Stream<Item = Result<Vec<EventEnvelope>>> + Send + 'a>>;

/// Core trait for append-only event logs.
///
/// A log keeps two orders: the global order (every committed event has a
/// unique, strictly increasing global sequence number) and a per-aggregate
/// order (sequence numbers 0, 1, 2... per aggregate id). Both are enforced as
/// uniqueness constraints; colliding with a competing writer surfaces as
/// [`EventStoreError::Conflict`].
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Prepares the backend (creates tables, runs migrations).
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Appends a batch atomically - either every event is stored or none is.
    ///
    /// Events must already carry their batch id and global sequence numbers.
    async fn append(&self, batch_id: BatchId, events: &[EventEnvelope]) -> Result<()>;

    /// Loads an aggregate's events with sequence number `>= from`, ascending.
    async fn load_by_aggregate(
        &self,
        aggregate_id: AggregateId,
        from: SequenceNumber,
    ) -> Result<Vec<EventEnvelope>>;

    /// Returns the aggregate's first event, if it has any history.
    async fn first_event(&self, aggregate_id: AggregateId) -> Result<Option<EventEnvelope>> {
        Ok(self
            .load_by_aggregate(aggregate_id, SequenceNumber::FIRST)
            .await?
            .into_iter()
            .next())
    }

    /// Reads at most `limit` events with global position `>= from`, ascending.
    async fn read_all(&self, from: GlobalSequenceNumber, limit: usize)
    -> Result<Vec<EventEnvelope>>;

    /// Returns the next unused global sequence number.
    async fn next_global_sequence_number(&self) -> Result<GlobalSequenceNumber>;
}

#[async_trait]
impl<T> EventLog for Arc<T>
where
    T: EventLog + ?Sized,
{
    async fn initialize(&self) -> Result<()> {
        (**self).initialize().await
    }

    async fn append(&self, batch_id: BatchId, events: &[EventEnvelope]) -> Result<()> {
        (**self).append(batch_id, events).await
    }

    async fn load_by_aggregate(
        &self,
        aggregate_id: AggregateId,
        from: SequenceNumber,
    ) -> Result<Vec<EventEnvelope>> {
        (**self).load_by_aggregate(aggregate_id, from).await
    }

    async fn first_event(&self, aggregate_id: AggregateId) -> Result<Option<EventEnvelope>> {
        (**self).first_event(aggregate_id).await
    }

    async fn read_all(
        &self,
        from: GlobalSequenceNumber,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>> {
        (**self).read_all(from, limit).await
    }

    async fn next_global_sequence_number(&self) -> Result<GlobalSequenceNumber> {
        (**self).next_global_sequence_number().await
    }
}

/// Extension trait providing convenience methods for event logs.
pub trait EventLogExt: EventLog {
    /// Streams the global log from `from` to its current end in pages of
    /// at most `page_size` events.
    fn read_pages(&self, from: GlobalSequenceNumber, page_size: usize) -> PageStream<'_> {
        let page_size = page_size.max(1);
        Box::pin(stream::unfold(Some(from), move |cursor| async move {
            let from = cursor?;
            match self.read_all(from, page_size).await {
                Ok(page) if page.is_empty() => None,
                Ok(page) => {
                    let next = page
                        .last()
                        .and_then(|e| e.global_sequence_number)
                        .map(|last| last.next());
                    Some((Ok(page), next))
                }
                Err(e) => Some((Err(e), None)),
            }
        }))
    }
}

// Blanket implementation for all EventLog implementations
impl<T: EventLog + ?Sized> EventLogExt for T {}

/// Positions a batch is expected to start at.
///
/// Left empty, only the intra-batch rules of [`validate_batch`] apply.
#[derive(Debug, Clone, Default)]
pub struct SequenceExpectations {
    /// The freshly-read next available global position.
    pub next_global: Option<GlobalSequenceNumber>,

    /// Per aggregate, one past its highest committed sequence number.
    pub next_local: HashMap<AggregateId, SequenceNumber>,
}

impl SequenceExpectations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_global(mut self, position: GlobalSequenceNumber) -> Self {
        self.next_global = Some(position);
        self
    }

    pub fn next_local(mut self, aggregate_id: AggregateId, sequence_number: SequenceNumber) -> Self {
        self.next_local.insert(aggregate_id, sequence_number);
        self
    }
}

/// Validates a stamped batch before it is appended.
///
/// - the batch is non-empty and every event carries the same batch id
/// - global sequence numbers are present, gap-free and strictly increasing
/// - per aggregate, sequence numbers are gap-free and strictly increasing
/// - an aggregate id is never tagged with two aggregate types
/// - when expectations are given, the runs start exactly where expected
pub fn validate_batch(events: &[EventEnvelope], expectations: &SequenceExpectations) -> Result<()> {
    let Some(first) = events.first() else {
        return Err(EventStoreError::Validation(
            "cannot append an empty batch".to_string(),
        ));
    };

    let batch_id = first.batch_id.ok_or_else(|| {
        EventStoreError::Validation("event has no batch id".to_string())
    })?;
    let first_global = first.committed_position()?;

    if let Some(expected) = expectations.next_global
        && first_global != expected
    {
        return Err(EventStoreError::Validation(format!(
            "batch starts at global sequence number {first_global}, expected {expected}"
        )));
    }

    let mut last_local: HashMap<AggregateId, (SequenceNumber, &str)> = HashMap::new();

    for (offset, event) in events.iter().enumerate() {
        if event.batch_id != Some(batch_id) {
            return Err(EventStoreError::Validation(format!(
                "event {} does not belong to batch {batch_id}",
                event.event_id
            )));
        }

        let global = event.committed_position()?;
        let expected_global = first_global.offset(offset);
        if global != expected_global {
            return Err(EventStoreError::Validation(format!(
                "global sequence numbers must be contiguous: expected {expected_global}, got {global}"
            )));
        }

        let expected_local = match last_local.get(&event.aggregate_id) {
            Some((previous, aggregate_type)) => {
                if *aggregate_type != event.aggregate_type {
                    return Err(EventStoreError::Validation(format!(
                        "aggregate {} tagged as both {aggregate_type} and {}",
                        event.aggregate_id, event.aggregate_type
                    )));
                }
                Some(previous.next())
            }
            None => expectations.next_local.get(&event.aggregate_id).copied(),
        };

        if let Some(expected_local) = expected_local
            && event.sequence_number != expected_local
        {
            return Err(EventStoreError::Validation(format!(
                "sequence numbers for aggregate {} must be contiguous: expected {expected_local}, got {}",
                event.aggregate_id, event.sequence_number
            )));
        }

        last_local.insert(
            event.aggregate_id,
            (event.sequence_number, event.aggregate_type.as_str()),
        );
    }

    Ok(())
}
