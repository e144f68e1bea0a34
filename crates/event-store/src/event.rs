use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AggregateId, BatchId, EventStoreError, GlobalSequenceNumber, Result, SequenceNumber};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Free-form key/value metadata attached to an event.
///
/// The map is immutable once built: [`Metadata::with`] and
/// [`Metadata::merge_missing`] return new maps instead of editing in place,
/// so a retried attempt never observes keys written by an aborted one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, serde_json::Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of this map with `key` set to `value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    /// Gap-fill merge: keys already present here win, keys only present in
    /// `defaults` are copied over.
    pub fn merge_missing(&self, defaults: &Metadata) -> Metadata {
        let mut merged = self.0.clone();
        for (key, value) in &defaults.0 {
            merged
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        Metadata(merged)
    }
}

impl<K: Into<String>, V: Into<serde_json::Value>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Metadata(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// An event envelope containing a domain event along with its metadata.
///
/// The local sequence number is set when the event is emitted; the batch id
/// and global sequence number stay empty until the command processor stamps
/// the batch right before appending it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// The type of the event (e.g., "AccountOpened").
    pub event_type: String,

    /// The aggregate this event belongs to.
    pub aggregate_id: AggregateId,

    /// The type tag of the owning aggregate (e.g., "Account").
    pub aggregate_type: String,

    /// Position of this event within its aggregate's stream.
    pub sequence_number: SequenceNumber,

    /// Log-wide position, assigned at commit time.
    pub global_sequence_number: Option<GlobalSequenceNumber>,

    /// The batch this event was committed in.
    pub batch_id: Option<BatchId>,

    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,

    /// The event payload as JSON.
    pub payload: serde_json::Value,

    /// Additional metadata about the event.
    pub metadata: Metadata,
}

impl EventEnvelope {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Returns the global position, failing for events that were never committed.
    pub fn committed_position(&self) -> Result<GlobalSequenceNumber> {
        self.global_sequence_number.ok_or_else(|| {
            EventStoreError::Validation(format!(
                "event {} of aggregate {} has no global sequence number",
                self.sequence_number, self.aggregate_id
            ))
        })
    }

    /// Returns a copy stamped for commit.
    pub fn stamped(
        &self,
        batch_id: BatchId,
        global_sequence_number: GlobalSequenceNumber,
        defaults: &Metadata,
    ) -> Self {
        Self {
            batch_id: Some(batch_id),
            global_sequence_number: Some(global_sequence_number),
            metadata: self.metadata.merge_missing(defaults),
            ..self.clone()
        }
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    event_type: Option<String>,
    aggregate_id: Option<AggregateId>,
    aggregate_type: Option<String>,
    sequence_number: Option<SequenceNumber>,
    global_sequence_number: Option<GlobalSequenceNumber>,
    batch_id: Option<BatchId>,
    timestamp: Option<DateTime<Utc>>,
    payload: Option<serde_json::Value>,
    metadata: Metadata,
}

impl EventEnvelopeBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn aggregate_id(mut self, id: AggregateId) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn sequence_number(mut self, sequence_number: SequenceNumber) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }

    pub fn global_sequence_number(mut self, position: GlobalSequenceNumber) -> Self {
        self.global_sequence_number = Some(position);
        self
    }

    pub fn batch_id(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> std::result::Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Replaces the whole metadata map.
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Tries to build the event envelope, returning None if required fields are missing.
    pub fn try_build(self) -> Option<EventEnvelope> {
        Some(EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            event_type: self.event_type?,
            aggregate_id: self.aggregate_id?,
            aggregate_type: self.aggregate_type?,
            sequence_number: self.sequence_number?,
            global_sequence_number: self.global_sequence_number,
            batch_id: self.batch_id,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            payload: self.payload?,
            metadata: self.metadata,
        })
    }

    /// Builds the event envelope.
    ///
    /// # Panics
    ///
    /// Panics if event_type, aggregate_id, aggregate_type, sequence_number
    /// or payload are not set. Use [`try_build`](Self::try_build) outside tests.
    pub fn build(self) -> EventEnvelope {
        self.try_build()
            .expect("event_type, aggregate_id, aggregate_type, sequence_number and payload are required")
    }
}

/// A batch that has been durably appended, carrying final global positions.
#[derive(Debug, Clone)]
pub struct CommittedBatch {
    pub batch_id: BatchId,
    pub events: Vec<EventEnvelope>,
}

impl CommittedBatch {
    pub fn new(batch_id: BatchId, events: Vec<EventEnvelope>) -> Self {
        Self { batch_id, events }
    }

    /// Highest global position in the batch.
    pub fn max_global_sequence_number(&self) -> Option<GlobalSequenceNumber> {
        self.events
            .iter()
            .filter_map(|e| e.global_sequence_number)
            .max()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
