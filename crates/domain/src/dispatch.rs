//! Hand-off of committed batches to the read side.

use std::sync::Arc;

use async_trait::async_trait;
use event_store::CommittedBatch;

use crate::error::BoxError;

/// Receives every batch the command processor commits.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    /// Prepares the read side, optionally discarding existing views.
    async fn initialize(&self, _purge_existing_views: bool) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called after a batch is durably committed.
    async fn dispatch(&self, batch: &CommittedBatch) -> Result<(), BoxError>;
}

#[async_trait]
impl<T> EventDispatcher for Arc<T>
where
    T: EventDispatcher + ?Sized,
{
    async fn initialize(&self, purge_existing_views: bool) -> Result<(), BoxError> {
        (**self).initialize(purge_existing_views).await
    }

    async fn dispatch(&self, batch: &CommittedBatch) -> Result<(), BoxError> {
        (**self).dispatch(batch).await
    }
}

/// Dispatcher that drops every batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDispatcher;

#[async_trait]
impl EventDispatcher for NullDispatcher {
    async fn dispatch(&self, _batch: &CommittedBatch) -> Result<(), BoxError> {
        Ok(())
    }
}
