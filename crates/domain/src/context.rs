//! The handle command handlers use to load and mutate aggregates.

use std::future::Future;

use common::{AggregateId, Cutoff, GlobalSequenceNumber};
use event_store::{CommittedBatch, Metadata};
use futures_util::future::BoxFuture;

use crate::aggregate::Aggregate;
use crate::error::{BoxError, Result};
use crate::unit_of_work::UnitOfWork;

/// Access to aggregates within one processing attempt.
///
/// Every load goes through the attempt's unit of work, so a handler that
/// loads the same aggregate twice sees its own earlier changes.
pub struct CommandContext<'a> {
    uow: &'a mut UnitOfWork,
}

impl<'a> CommandContext<'a> {
    pub fn new(uow: &'a mut UnitOfWork) -> Self {
        Self { uow }
    }

    /// Loads the current state of an existing aggregate.
    pub async fn load<A: Aggregate>(&mut self, aggregate_id: AggregateId) -> Result<&A> {
        let root = self
            .uow
            .get::<A>(aggregate_id, Cutoff::Unbounded, false)
            .await?;
        Ok(root.state())
    }

    /// Loads a read-only view of an aggregate as of a global position.
    pub async fn load_at<A: Aggregate>(
        &mut self,
        aggregate_id: AggregateId,
        position: GlobalSequenceNumber,
    ) -> Result<&A> {
        let root = self
            .uow
            .get::<A>(aggregate_id, Cutoff::at(position), false)
            .await?;
        Ok(root.state())
    }

    /// Returns true if the aggregate currently has history.
    pub async fn exists(&self, aggregate_id: AggregateId) -> Result<bool> {
        self.uow.exists(aggregate_id, Cutoff::Unbounded).await
    }

    /// Runs command logic against an aggregate, creating it if it has no
    /// history, and emits the returned events.
    ///
    /// An error from `command` is returned boxed as-is, so the processor can
    /// recognise declared domain errors by type.
    pub async fn execute<A, F>(
        &mut self,
        aggregate_id: AggregateId,
        command: F,
    ) -> std::result::Result<(), BoxError>
    where
        A: Aggregate,
        F: FnOnce(&A) -> std::result::Result<Vec<A::Event>, A::Error> + Send,
    {
        self.execute_with_metadata(aggregate_id, Metadata::new(), command)
            .await
    }

    /// Like [`execute`](Self::execute), attaching `metadata` to every
    /// emitted event. These keys take precedence over the command's metadata.
    pub async fn execute_with_metadata<A, F>(
        &mut self,
        aggregate_id: AggregateId,
        metadata: Metadata,
        command: F,
    ) -> std::result::Result<(), BoxError>
    where
        A: Aggregate,
        F: FnOnce(&A) -> std::result::Result<Vec<A::Event>, A::Error> + Send,
    {
        let root = self
            .uow
            .get::<A>(aggregate_id, Cutoff::Unbounded, true)
            .await?;

        let events = command(root.state())?;
        let mut emitted = Vec::with_capacity(events.len());
        for event in events {
            emitted.push(root.emit(event, &metadata)?);
        }

        for envelope in emitted {
            self.uow.add_emitted_event(envelope);
        }
        Ok(())
    }

    /// Registers work to run once this attempt's batch is committed.
    ///
    /// Runs after snapshot saving, in registration order. Nothing runs if
    /// the attempt is retried or fails.
    pub fn on_committed<F, Fut>(&mut self, finalizer: F)
    where
        F: FnOnce(CommittedBatch) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.uow.on_committed(Box::new(
            move |batch: &CommittedBatch| -> BoxFuture<'static, std::result::Result<(), BoxError>> {
                Box::pin(finalizer(batch.clone()))
            },
        ));
    }
}
