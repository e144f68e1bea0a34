//! Snapshot-backed hydration.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::{AggregateId, Cutoff, GlobalSequenceNumber, SequenceNumber};
use event_store::{CommittedBatch, Snapshot, SnapshotStore};
use futures_util::future::BoxFuture;

use crate::aggregate::Hydratable;
use crate::error::{BoxError, DomainError, Result};
use crate::repository::{AggregateRepository, Finalizer};

/// When to write a new snapshot after a commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotPolicy {
    /// Only re-save when hydrating the aggregate took at least this long.
    /// `None` saves after every commit that advanced the aggregate.
    pub min_hydration_time: Option<Duration>,
}

impl SnapshotPolicy {
    pub fn always() -> Self {
        Self::default()
    }

    pub fn when_hydration_exceeds(threshold: Duration) -> Self {
        Self {
            min_hydration_time: Some(threshold),
        }
    }

    pub fn should_save(&self, hydration_time: Duration) -> bool {
        self.min_hydration_time
            .is_none_or(|threshold| hydration_time >= threshold)
    }
}

/// Repository decorator that seeds hydration from the newest usable
/// snapshot and replays only the tail after it.
///
/// Aggregate types that return `None` from
/// [`Aggregate::snapshot_version`](crate::Aggregate::snapshot_version) pass
/// straight through to the inner repository.
pub struct SnapshottingRepository<R> {
    inner: R,
    store: Arc<dyn SnapshotStore>,
    policy: SnapshotPolicy,
}

impl<R: AggregateRepository> SnapshottingRepository<R> {
    pub fn new(inner: R, store: Arc<dyn SnapshotStore>, policy: SnapshotPolicy) -> Self {
        Self {
            inner,
            store,
            policy,
        }
    }

    async fn seed_from_snapshot(&self, root: &mut dyn Hydratable, version: u32, cutoff: Cutoff) {
        let aggregate_id = root.aggregate_id();
        let snapshot = match self.store.try_get(aggregate_id, version, cutoff).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(%aggregate_id, %error, "snapshot lookup failed, replaying full history");
                return;
            }
        };

        let sequence_number = snapshot.sequence_number;
        let valid_from = snapshot.valid_from;
        match root.restore(snapshot) {
            Ok(()) => {
                tracing::debug!(%aggregate_id, %sequence_number, %valid_from, "hydrating from snapshot");
            }
            Err(error @ DomainError::Snapshot { .. }) => {
                tracing::warn!(%aggregate_id, %error, "unusable snapshot, replaying full history");
            }
            Err(error) => {
                // a type mismatch is not something a full replay can fix
                tracing::error!(%aggregate_id, %error, "snapshot belongs to another aggregate type");
            }
        }
    }
}

#[async_trait]
impl<R: AggregateRepository> AggregateRepository for SnapshottingRepository<R> {
    async fn hydrate(&self, root: &mut dyn Hydratable, cutoff: Cutoff) -> Result<()> {
        if let Some(version) = root.snapshot_version()
            && root.sequence_number().is_none()
        {
            self.seed_from_snapshot(root, version, cutoff).await;
        }

        let started = Instant::now();
        self.inner.hydrate(root, cutoff).await?;
        root.set_hydration_time(started.elapsed());
        Ok(())
    }

    async fn exists(&self, aggregate_id: AggregateId, cutoff: Cutoff) -> Result<bool> {
        self.inner.exists(aggregate_id, cutoff).await
    }

    fn finalizer(&self, root: &dyn Hydratable) -> Result<Option<Finalizer>> {
        let Some(schema_version) = root.snapshot_version() else {
            return Ok(None);
        };
        if !root.advanced_since_checkout() || !self.policy.should_save(root.hydration_time()) {
            return Ok(None);
        }
        let Some(sequence_number) = root.sequence_number() else {
            return Ok(None);
        };

        let pending = PendingSnapshot {
            aggregate_id: root.aggregate_id(),
            aggregate_type: root.aggregate_type(),
            schema_version,
            sequence_number,
            state: root.snapshot_state()?,
            store: Arc::clone(&self.store),
        };

        Ok(Some(Box::new(
            move |batch: &CommittedBatch| -> BoxFuture<'static, std::result::Result<(), BoxError>> {
                let valid_from = batch.max_global_sequence_number();
                Box::pin(pending.save(valid_from))
            },
        )))
    }
}

/// Aggregate state captured before the append, saved once the batch's
/// final global position is known.
struct PendingSnapshot {
    aggregate_id: AggregateId,
    aggregate_type: &'static str,
    schema_version: u32,
    sequence_number: SequenceNumber,
    state: serde_json::Value,
    store: Arc<dyn SnapshotStore>,
}

impl PendingSnapshot {
    async fn save(
        self,
        valid_from: Option<GlobalSequenceNumber>,
    ) -> std::result::Result<(), BoxError> {
        let Some(valid_from) = valid_from else {
            return Ok(());
        };

        let snapshot = Snapshot::from_state(
            self.aggregate_id,
            self.aggregate_type,
            self.schema_version,
            self.sequence_number,
            valid_from,
            &self.state,
        )?;
        self.store.save(snapshot).await?;

        metrics::counter!("snapshots_saved_total", "aggregate_type" => self.aggregate_type)
            .increment(1);
        tracing::debug!(
            aggregate_id = %self.aggregate_id,
            sequence_number = %self.sequence_number,
            %valid_from,
            "snapshot saved"
        );
        Ok(())
    }
}
