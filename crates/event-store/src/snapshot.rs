use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AggregateId, Cutoff, GlobalSequenceNumber, Result, SequenceNumber};

/// A materialized aggregate state that can seed a rehydration.
///
/// A snapshot is a pure optimization: losing one, or two writers racing to
/// save one, never affects correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// The aggregate this snapshot belongs to.
    pub aggregate_id: AggregateId,

    /// The type of aggregate (e.g., "Account").
    pub aggregate_type: String,

    /// Declared schema version of the serialized state.
    pub schema_version: u32,

    /// Sequence number of the last event folded into `state`.
    pub sequence_number: SequenceNumber,

    /// Global position at/after which the snapshot may be used.
    pub valid_from: GlobalSequenceNumber,

    /// When the snapshot was created.
    pub timestamp: DateTime<Utc>,

    /// The serialized aggregate state.
    pub state: serde_json::Value,
}

impl Snapshot {
    /// Creates a snapshot from a serializable state.
    pub fn from_state<T: Serialize>(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        schema_version: u32,
        sequence_number: SequenceNumber,
        valid_from: GlobalSequenceNumber,
        state: &T,
    ) -> std::result::Result<Self, serde_json::Error> {
        Ok(Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            schema_version,
            sequence_number,
            valid_from,
            timestamp: Utc::now(),
            state: serde_json::to_value(state)?,
        })
    }

    /// Deserializes the snapshot state into a concrete type.
    pub fn into_state<T: for<'de> Deserialize<'de>>(self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_value(self.state)
    }

    /// Returns true if this snapshot may seed a read at `cutoff` for an
    /// aggregate currently declaring `schema_version`.
    pub fn usable_for(&self, schema_version: u32, cutoff: Cutoff) -> bool {
        self.schema_version == schema_version && cutoff.allows_snapshot(self.valid_from)
    }
}

/// Storage for aggregate snapshots, shared across processes.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Returns the newest snapshot with the given schema version whose
    /// `valid_from` is strictly below the cutoff.
    async fn try_get(
        &self,
        aggregate_id: AggregateId,
        schema_version: u32,
        cutoff: Cutoff,
    ) -> Result<Option<Snapshot>>;

    /// Saves a snapshot. Concurrent saves for the same slot are last-writer-wins.
    async fn save(&self, snapshot: Snapshot) -> Result<()>;
}

#[async_trait]
impl<T> SnapshotStore for Arc<T>
where
    T: SnapshotStore + ?Sized,
{
    async fn try_get(
        &self,
        aggregate_id: AggregateId,
        schema_version: u32,
        cutoff: Cutoff,
    ) -> Result<Option<Snapshot>> {
        (**self).try_get(aggregate_id, schema_version, cutoff).await
    }

    async fn save(&self, snapshot: Snapshot) -> Result<()> {
        (**self).save(snapshot).await
    }
}
