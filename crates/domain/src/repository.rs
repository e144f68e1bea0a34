//! Aggregate hydration from the event log.

use async_trait::async_trait;
use common::{AggregateId, Cutoff, SequenceNumber};
use event_store::{CommittedBatch, EventLog};
use futures_util::future::BoxFuture;

use crate::aggregate::{Aggregate, AggregateRoot, Hydratable};
use crate::error::{BoxError, DomainError, Result};

/// Work to run once a batch has been durably appended.
///
/// Receives the committed batch, carrying its final global sequence numbers.
pub type Finalizer = Box<
    dyn FnOnce(&CommittedBatch) -> BoxFuture<'static, std::result::Result<(), BoxError>>
        + Send
        + Sync,
>;

/// Loads aggregate roots by replaying their history.
#[async_trait]
pub trait AggregateRepository: Send + Sync {
    /// Brings `root` up to date with every event visible at `cutoff`,
    /// continuing from the root's current replay position.
    async fn hydrate(&self, root: &mut dyn Hydratable, cutoff: Cutoff) -> Result<()>;

    /// Returns true if the aggregate has at least one event visible at `cutoff`.
    async fn exists(&self, aggregate_id: AggregateId, cutoff: Cutoff) -> Result<bool>;

    /// Post-commit work for a root that took part in a committed batch.
    fn finalizer(&self, _root: &dyn Hydratable) -> Result<Option<Finalizer>> {
        Ok(None)
    }
}

/// Extension trait providing typed loading for repositories.
#[async_trait]
pub trait AggregateRepositoryExt: AggregateRepository {
    /// Loads an aggregate root of type `A`.
    ///
    /// Fails with [`DomainError::AggregateNotFound`] when no events are
    /// visible, unless `create_if_not_exists` is set, in which case the root
    /// is returned as new.
    async fn get<A: Aggregate>(
        &self,
        aggregate_id: AggregateId,
        cutoff: Cutoff,
        create_if_not_exists: bool,
    ) -> Result<AggregateRoot<A>> {
        let mut root = AggregateRoot::<A>::new(aggregate_id, cutoff);
        self.hydrate(&mut root, cutoff).await?;

        if root.sequence_number().is_none() {
            if !create_if_not_exists {
                return Err(DomainError::AggregateNotFound {
                    aggregate_type: A::aggregate_type(),
                    aggregate_id,
                });
            }
            root.mark_new();
        }

        root.mark_checked_out();
        Ok(root)
    }
}

// Blanket implementation for all AggregateRepository implementations
impl<T: AggregateRepository + ?Sized> AggregateRepositoryExt for T {}

/// Rebuilds aggregates by full replay of their event streams.
#[derive(Clone)]
pub struct EventSourcedRepository<L> {
    log: L,
}

impl<L: EventLog> EventSourcedRepository<L> {
    pub fn new(log: L) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &L {
        &self.log
    }
}

#[async_trait]
impl<L: EventLog> AggregateRepository for EventSourcedRepository<L> {
    #[tracing::instrument(skip(self, root), fields(aggregate_id = %root.aggregate_id(), aggregate_type = root.aggregate_type()))]
    async fn hydrate(&self, root: &mut dyn Hydratable, cutoff: Cutoff) -> Result<()> {
        let from = SequenceNumber::after(root.sequence_number());
        let events = self.log.load_by_aggregate(root.aggregate_id(), from).await?;

        let mut applied = 0usize;
        for event in &events {
            if !cutoff.admits(event.committed_position()?) {
                break;
            }
            root.replay(event)?;
            applied += 1;
        }

        tracing::debug!(from = %from, applied, "replayed events");
        Ok(())
    }

    async fn exists(&self, aggregate_id: AggregateId, cutoff: Cutoff) -> Result<bool> {
        match self.log.first_event(aggregate_id).await? {
            Some(first) => Ok(cutoff.admits(first.committed_position()?)),
            None => Ok(false),
        }
    }
}
