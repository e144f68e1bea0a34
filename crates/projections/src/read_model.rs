//! In-memory read models and the projection that maintains them.

use std::sync::Arc;

use async_trait::async_trait;
use event_store::EventEnvelope;
use tokio::sync::RwLock;

use crate::Result;
use crate::projection::{Projection, ProjectionPosition};

/// A denormalized, query-optimized view built from committed events.
///
/// `apply` sees every committed event in global order, whatever its
/// aggregate type; views ignore the events they do not care about.
pub trait ReadModel: Default + Send + Sync + 'static {
    /// Folds one committed event into the view.
    fn apply(&mut self, event: &EventEnvelope) -> Result<()>;

    /// Returns the number of entries in this read model.
    fn count(&self) -> usize;
}

struct State<M> {
    model: M,
    position: ProjectionPosition,
}

/// A projection keeping its read model and watermark in memory.
///
/// Clones share the same state, so one clone can be registered with the
/// catch-up worker while others serve queries.
pub struct InMemoryProjection<M> {
    name: &'static str,
    state: Arc<RwLock<State<M>>>,
}

impl<M> Clone for InMemoryProjection<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            state: Arc::clone(&self.state),
        }
    }
}

impl<M: ReadModel> InMemoryProjection<M> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(RwLock::new(State {
                model: M::default(),
                position: ProjectionPosition::initial(),
            })),
        }
    }

    /// Runs a query against the current read model.
    pub async fn read<R>(&self, query: impl FnOnce(&M) -> R) -> R {
        query(&self.state.read().await.model)
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.model.count()
    }

    pub async fn position(&self) -> ProjectionPosition {
        self.state.read().await.position
    }
}

#[async_trait]
impl<M: ReadModel> Projection for InMemoryProjection<M> {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn dispatch(&self, events: &[EventEnvelope]) -> Result<()> {
        let mut state = self.state.write().await;
        for event in events {
            let position = event.committed_position()?;
            if state.position.has_reached(position) {
                continue;
            }
            state.model.apply(event)?;
            state.position = state.position.advance(position);
        }
        Ok(())
    }

    async fn low_watermark(&self, _allow_cached: bool) -> Result<ProjectionPosition> {
        Ok(self.state.read().await.position)
    }

    async fn reset(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.model = M::default();
        state.position = ProjectionPosition::initial();
        Ok(())
    }
}
