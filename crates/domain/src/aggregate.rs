//! Core aggregate and domain event traits, and the live aggregate root.

use std::any::Any;
use std::time::Duration;

use chrono::Utc;
use common::{AggregateId, Cutoff, SequenceNumber};
use event_store::{EventEnvelope, EventId, Metadata, Snapshot};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{DomainError, Result};

/// Trait for domain events.
///
/// Domain events represent facts that have happened in the domain.
/// They are immutable and should be named in past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Returns the event type name.
    fn event_type(&self) -> &'static str;
}

/// Trait for aggregates in an event-sourced system.
///
/// An aggregate's entire state is derived by replaying its own ordered event
/// stream. It is mutated only through [`Aggregate::apply`]:
/// - Given the same state and event, `apply` always produces the same new state
/// - It must not have side effects
/// - It must not fail (events represent facts that have happened)
pub trait Aggregate: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The type of events this aggregate produces and consumes.
    type Event: DomainEvent;

    /// The type of errors this aggregate's command logic can produce.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Returns the aggregate type name, stored on every event it emits.
    fn aggregate_type() -> &'static str;

    /// Applies an event to the aggregate, updating its state.
    fn apply(&mut self, event: Self::Event);

    /// Snapshot schema version. `None` disables snapshotting for this type.
    ///
    /// Bump the version whenever the serialized shape of the state changes;
    /// snapshots written under any other version are ignored.
    fn snapshot_version() -> Option<u32> {
        None
    }

    /// Events emitted once when an aggregate with no history is created.
    fn created(_id: AggregateId) -> Vec<Self::Event> {
        Vec::new()
    }
}

/// A live aggregate instance together with its replay position.
#[derive(Debug)]
pub struct AggregateRoot<A: Aggregate> {
    id: AggregateId,
    cutoff: Cutoff,
    state: A,
    sequence_number: Option<SequenceNumber>,
    checked_out_at: Option<SequenceNumber>,
    hydration_time: Duration,
    is_new: bool,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Creates a bare instance with no events applied.
    pub fn new(id: AggregateId, cutoff: Cutoff) -> Self {
        Self {
            id,
            cutoff,
            state: A::default(),
            sequence_number: None,
            checked_out_at: None,
            hydration_time: Duration::ZERO,
            is_new: false,
        }
    }

    pub fn id(&self) -> AggregateId {
        self.id
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn cutoff(&self) -> Cutoff {
        self.cutoff
    }

    /// Sequence number of the last applied event, `None` if nothing was applied.
    pub fn sequence_number(&self) -> Option<SequenceNumber> {
        self.sequence_number
    }

    /// True if the aggregate had no history when it was checked out.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub(crate) fn mark_new(&mut self) {
        self.is_new = true;
    }

    /// Applies a committed event, enforcing type and sequence continuity.
    pub fn replay(&mut self, envelope: &EventEnvelope) -> Result<()> {
        if envelope.aggregate_type != A::aggregate_type() {
            return Err(DomainError::WrongAggregateType {
                aggregate_id: self.id,
                expected: A::aggregate_type(),
                actual: envelope.aggregate_type.clone(),
            });
        }

        let expected = SequenceNumber::after(self.sequence_number);
        if envelope.sequence_number != expected {
            return Err(DomainError::InconsistentStream {
                aggregate_id: self.id,
                expected,
                actual: envelope.sequence_number,
            });
        }

        let event: A::Event = serde_json::from_value(envelope.payload.clone())?;
        self.state.apply(event);
        self.sequence_number = Some(envelope.sequence_number);
        Ok(())
    }

    /// Applies a new event and returns its envelope, numbered from the
    /// current replay position.
    ///
    /// The envelope carries only `metadata`; the batch id, global sequence
    /// number and command metadata are added when the batch is committed.
    pub fn emit(&mut self, event: A::Event, metadata: &Metadata) -> Result<EventEnvelope> {
        if let Cutoff::At(cutoff) = self.cutoff {
            return Err(DomainError::ReadOnly {
                aggregate_id: self.id,
                cutoff,
            });
        }

        let sequence_number = SequenceNumber::after(self.sequence_number);
        let envelope = EventEnvelope {
            event_id: EventId::new(),
            event_type: event.event_type().to_string(),
            aggregate_id: self.id,
            aggregate_type: A::aggregate_type().to_string(),
            sequence_number,
            global_sequence_number: None,
            batch_id: None,
            timestamp: Utc::now(),
            payload: serde_json::to_value(&event)?,
            metadata: metadata.clone(),
        };

        self.state.apply(event);
        self.sequence_number = Some(sequence_number);
        Ok(envelope)
    }
}

/// Object-safe view of an [`AggregateRoot`], so repositories and the unit
/// of work can hydrate and cache roots of any aggregate type.
pub trait Hydratable: Any + Send + Sync {
    fn aggregate_id(&self) -> AggregateId;

    fn aggregate_type(&self) -> &'static str;

    fn snapshot_version(&self) -> Option<u32>;

    fn cutoff(&self) -> Cutoff;

    /// Sequence number of the last applied event.
    fn sequence_number(&self) -> Option<SequenceNumber>;

    /// Sequence number the root had when it was handed out.
    fn checked_out_at(&self) -> Option<SequenceNumber>;

    fn replay(&mut self, envelope: &EventEnvelope) -> Result<()>;

    /// Replaces the state with a snapshot's. The root is untouched on error.
    fn restore(&mut self, snapshot: Snapshot) -> Result<()>;

    /// Serializes the current state.
    fn snapshot_state(&self) -> Result<serde_json::Value>;

    fn mark_checked_out(&mut self);

    fn hydration_time(&self) -> Duration;

    fn set_hydration_time(&mut self, elapsed: Duration);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// True if events were applied after the root was handed out.
    fn advanced_since_checkout(&self) -> bool {
        self.sequence_number() != self.checked_out_at()
    }
}

impl<A: Aggregate> Hydratable for AggregateRoot<A> {
    fn aggregate_id(&self) -> AggregateId {
        self.id
    }

    fn aggregate_type(&self) -> &'static str {
        A::aggregate_type()
    }

    fn snapshot_version(&self) -> Option<u32> {
        A::snapshot_version()
    }

    fn cutoff(&self) -> Cutoff {
        self.cutoff
    }

    fn sequence_number(&self) -> Option<SequenceNumber> {
        self.sequence_number
    }

    fn checked_out_at(&self) -> Option<SequenceNumber> {
        self.checked_out_at
    }

    fn replay(&mut self, envelope: &EventEnvelope) -> Result<()> {
        AggregateRoot::replay(self, envelope)
    }

    fn restore(&mut self, snapshot: Snapshot) -> Result<()> {
        if snapshot.aggregate_type != A::aggregate_type() {
            return Err(DomainError::WrongAggregateType {
                aggregate_id: self.id,
                expected: A::aggregate_type(),
                actual: snapshot.aggregate_type,
            });
        }

        let sequence_number = snapshot.sequence_number;
        let state: A = snapshot
            .into_state()
            .map_err(|source| DomainError::Snapshot {
                aggregate_id: self.id,
                source,
            })?;
        self.state = state;
        self.sequence_number = Some(sequence_number);
        Ok(())
    }

    fn snapshot_state(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&self.state).map_err(|source| DomainError::Snapshot {
            aggregate_id: self.id,
            source,
        })
    }

    fn mark_checked_out(&mut self) {
        self.checked_out_at = self.sequence_number;
    }

    fn hydration_time(&self) -> Duration {
        self.hydration_time
    }

    fn set_hydration_time(&mut self, elapsed: Duration) {
        self.hydration_time = elapsed;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use common::{BatchId, GlobalSequenceNumber};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub enum CounterEvent {
        Incremented { by: i64 },
    }

    impl DomainEvent for CounterEvent {
        fn event_type(&self) -> &'static str {
            "Incremented"
        }
    }

    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    pub struct Counter {
        pub total: i64,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("counter overflow")]
    pub struct CounterError;

    impl Aggregate for Counter {
        type Event = CounterEvent;
        type Error = CounterError;

        fn aggregate_type() -> &'static str {
            "Counter"
        }

        fn apply(&mut self, event: Self::Event) {
            match event {
                CounterEvent::Incremented { by } => self.total += by,
            }
        }
    }

    fn committed(envelope: EventEnvelope, global: i64) -> EventEnvelope {
        envelope.stamped(
            BatchId::new(),
            GlobalSequenceNumber::new(global),
            &Metadata::new(),
        )
    }

    #[test]
    fn test_emit_numbers_events_from_replay_position() {
        let mut root = AggregateRoot::<Counter>::new(AggregateId::new(), Cutoff::Unbounded);

        let first = root
            .emit(CounterEvent::Incremented { by: 2 }, &Metadata::new())
            .unwrap();
        let second = root
            .emit(CounterEvent::Incremented { by: 3 }, &Metadata::new())
            .unwrap();

        assert_eq!(first.sequence_number, SequenceNumber::FIRST);
        assert_eq!(second.sequence_number, SequenceNumber::new(1));
        assert_eq!(first.aggregate_type, "Counter");
        assert!(first.global_sequence_number.is_none());
        assert_eq!(root.state().total, 5);
    }

    #[test]
    fn test_replay_rebuilds_state() {
        let id = AggregateId::new();
        let mut source = AggregateRoot::<Counter>::new(id, Cutoff::Unbounded);
        let events: Vec<_> = (0..3)
            .map(|i| {
                let e = source
                    .emit(CounterEvent::Incremented { by: 1 }, &Metadata::new())
                    .unwrap();
                committed(e, i)
            })
            .collect();

        let mut root = AggregateRoot::<Counter>::new(id, Cutoff::Unbounded);
        for event in &events {
            root.replay(event).unwrap();
        }

        assert_eq!(root.state().total, 3);
        assert_eq!(root.sequence_number(), Some(SequenceNumber::new(2)));
    }

    #[test]
    fn test_replay_rejects_gaps() {
        let id = AggregateId::new();
        let mut source = AggregateRoot::<Counter>::new(id, Cutoff::Unbounded);
        source
            .emit(CounterEvent::Incremented { by: 1 }, &Metadata::new())
            .unwrap();
        let skipped = source
            .emit(CounterEvent::Incremented { by: 1 }, &Metadata::new())
            .unwrap();

        let mut root = AggregateRoot::<Counter>::new(id, Cutoff::Unbounded);
        let result = root.replay(&committed(skipped, 1));

        assert!(matches!(result, Err(DomainError::InconsistentStream { .. })));
    }

    #[test]
    fn test_replay_rejects_wrong_aggregate_type() {
        let id = AggregateId::new();
        let mut source = AggregateRoot::<Counter>::new(id, Cutoff::Unbounded);
        let mut foreign = source
            .emit(CounterEvent::Incremented { by: 1 }, &Metadata::new())
            .unwrap();
        foreign.aggregate_type = "Account".to_string();

        let mut root = AggregateRoot::<Counter>::new(id, Cutoff::Unbounded);
        let result = root.replay(&committed(foreign, 0));

        assert!(matches!(
            result,
            Err(DomainError::WrongAggregateType { expected: "Counter", .. })
        ));
    }

    #[test]
    fn test_historical_roots_cannot_emit() {
        let mut root = AggregateRoot::<Counter>::new(
            AggregateId::new(),
            Cutoff::at(GlobalSequenceNumber::new(4)),
        );

        let result = root.emit(CounterEvent::Incremented { by: 1 }, &Metadata::new());
        assert!(matches!(result, Err(DomainError::ReadOnly { .. })));
    }

    #[test]
    fn test_restore_keeps_root_on_bad_state() {
        let id = AggregateId::new();
        let mut root = AggregateRoot::<Counter>::new(id, Cutoff::Unbounded);
        let snapshot = Snapshot::from_state(
            id,
            "Counter",
            1,
            SequenceNumber::new(9),
            GlobalSequenceNumber::new(9),
            &serde_json::json!({"total": "not a number"}),
        )
        .unwrap();

        let result = Hydratable::restore(&mut root, snapshot);

        assert!(matches!(result, Err(DomainError::Snapshot { .. })));
        assert_eq!(root.sequence_number(), None);
    }

    #[test]
    fn test_advanced_since_checkout_tracks_emission() {
        let mut root = AggregateRoot::<Counter>::new(AggregateId::new(), Cutoff::Unbounded);
        root.mark_checked_out();
        assert!(!root.advanced_since_checkout());

        root.emit(CounterEvent::Incremented { by: 1 }, &Metadata::new())
            .unwrap();
        assert!(root.advanced_since_checkout());
    }
}
