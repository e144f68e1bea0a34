use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    AggregateId, BatchId, Cutoff, EventEnvelope, EventStoreError, GlobalSequenceNumber, Result,
    SequenceNumber, Snapshot, SnapshotStore,
    store::{EventLog, SequenceExpectations, validate_batch},
};

#[derive(Default)]
struct LogState {
    /// Global order; an event's index is its global sequence number.
    events: Vec<EventEnvelope>,
    /// Per-aggregate indexes into `events`; position i holds sequence number i.
    streams: HashMap<AggregateId, Vec<usize>>,
}

/// In-memory event log and snapshot store for tests and embedding.
///
/// Provides the same conflict semantics as the PostgreSQL implementation:
/// writing into an occupied global or per-aggregate slot is a conflict,
/// skipping ahead of the next free slot is a validation error.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<LogState>>,
    snapshots: Arc<RwLock<HashMap<AggregateId, Vec<Snapshot>>>>,
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.log.read().await.events.len()
    }

    /// Returns the number of snapshots kept for an aggregate.
    pub async fn snapshot_count(&self, aggregate_id: AggregateId) -> usize {
        self.snapshots
            .read()
            .await
            .get(&aggregate_id)
            .map_or(0, Vec::len)
    }
}

fn slot_check<T: Ord + std::fmt::Display>(
    batch_id: BatchId,
    slot: &str,
    actual: T,
    next_free: T,
) -> Result<()> {
    match actual.cmp(&next_free) {
        std::cmp::Ordering::Equal => Ok(()),
        std::cmp::Ordering::Less => Err(EventStoreError::Conflict {
            batch_id,
            reason: format!("{slot} {actual} is already taken (next free is {next_free})"),
        }),
        std::cmp::Ordering::Greater => Err(EventStoreError::Validation(format!(
            "{slot} {actual} leaves a gap (next free is {next_free})"
        ))),
    }
}

#[async_trait]
impl EventLog for InMemoryEventStore {
    async fn append(&self, batch_id: BatchId, events: &[EventEnvelope]) -> Result<()> {
        validate_batch(events, &SequenceExpectations::default())?;
        if events.iter().any(|e| e.batch_id != Some(batch_id)) {
            return Err(EventStoreError::Validation(format!(
                "events are not stamped with batch {batch_id}"
            )));
        }

        let mut log = self.log.write().await;

        let next_global = GlobalSequenceNumber::new(log.events.len() as i64);
        slot_check(
            batch_id,
            "global sequence number",
            events[0].committed_position()?,
            next_global,
        )?;

        let mut seen = HashSet::new();
        for event in events {
            if seen.insert(event.aggregate_id) {
                let next_local = SequenceNumber::new(
                    log.streams.get(&event.aggregate_id).map_or(0, Vec::len) as i64,
                );
                slot_check(
                    batch_id,
                    &format!("sequence number of aggregate {}", event.aggregate_id),
                    event.sequence_number,
                    next_local,
                )?;
            }
        }

        for event in events {
            let index = log.events.len();
            log.streams
                .entry(event.aggregate_id)
                .or_default()
                .push(index);
            log.events.push(event.clone());
        }

        Ok(())
    }

    async fn load_by_aggregate(
        &self,
        aggregate_id: AggregateId,
        from: SequenceNumber,
    ) -> Result<Vec<EventEnvelope>> {
        let log = self.log.read().await;
        let Some(stream) = log.streams.get(&aggregate_id) else {
            return Ok(Vec::new());
        };
        let start = from.as_i64().max(0) as usize;
        Ok(stream
            .iter()
            .skip(start)
            .map(|&index| log.events[index].clone())
            .collect())
    }

    async fn first_event(&self, aggregate_id: AggregateId) -> Result<Option<EventEnvelope>> {
        let log = self.log.read().await;
        Ok(log
            .streams
            .get(&aggregate_id)
            .and_then(|stream| stream.first())
            .map(|&index| log.events[index].clone()))
    }

    async fn read_all(
        &self,
        from: GlobalSequenceNumber,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>> {
        let log = self.log.read().await;
        let start = from.as_i64().max(0) as usize;
        Ok(log.events.iter().skip(start).take(limit).cloned().collect())
    }

    async fn next_global_sequence_number(&self) -> Result<GlobalSequenceNumber> {
        Ok(GlobalSequenceNumber::new(
            self.log.read().await.events.len() as i64,
        ))
    }
}

#[async_trait]
impl SnapshotStore for InMemoryEventStore {
    async fn try_get(
        &self,
        aggregate_id: AggregateId,
        schema_version: u32,
        cutoff: Cutoff,
    ) -> Result<Option<Snapshot>> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(&aggregate_id).and_then(|candidates| {
            candidates
                .iter()
                .filter(|s| s.usable_for(schema_version, cutoff))
                .max_by_key(|s| s.valid_from)
                .cloned()
        }))
    }

    async fn save(&self, snapshot: Snapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        let kept = snapshots.entry(snapshot.aggregate_id).or_default();
        kept.retain(|s| {
            !(s.schema_version == snapshot.schema_version && s.valid_from == snapshot.valid_from)
        });
        kept.push(snapshot);
        Ok(())
    }
}
