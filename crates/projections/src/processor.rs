//! Feeds the committed log to projections.

use std::sync::Arc;

use common::GlobalSequenceNumber;
use event_store::{EventLog, EventLogExt};
use futures_util::StreamExt;

use crate::Result;
use crate::projection::{Projection, ProjectionPosition};

/// How far a catch-up pass must bring the projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUpRequest {
    /// `None` means the current end of the log.
    pub target: Option<GlobalSequenceNumber>,
    /// Whether projections may report cached watermarks.
    pub allow_cached: bool,
}

impl CatchUpRequest {
    /// Catch up to the current end, re-reading every watermark.
    pub fn to_end() -> Self {
        Self {
            target: None,
            allow_cached: false,
        }
    }

    /// Catch up to at least `target`.
    pub fn to(target: GlobalSequenceNumber, allow_cached: bool) -> Self {
        Self {
            target: Some(target),
            allow_cached,
        }
    }
}

/// Streams the log to registered projections.
///
/// Each projection only receives events past its own watermark, so
/// projections registered at different times catch up independently.
pub struct ProjectionProcessor<L> {
    log: L,
    projections: Vec<Arc<dyn Projection>>,
    page_size: usize,
}

impl<L: EventLog> ProjectionProcessor<L> {
    pub const DEFAULT_PAGE_SIZE: usize = 500;

    /// Creates a new processor reading from the given log.
    pub fn new(log: L) -> Self {
        Self {
            log,
            projections: Vec::new(),
            page_size: Self::DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Registers a projection with this processor.
    pub fn register(&mut self, projection: impl Projection + 'static) {
        self.projections.push(Arc::new(projection));
    }

    /// Returns the number of registered projections.
    pub fn projection_count(&self) -> usize {
        self.projections.len()
    }

    pub fn projections(&self) -> &[Arc<dyn Projection>] {
        &self.projections
    }

    /// The lowest position every registered projection has processed.
    /// `None` when no projection is registered.
    pub async fn low_watermark(&self, allow_cached: bool) -> Result<Option<ProjectionPosition>> {
        let mut low: Option<ProjectionPosition> = None;
        for projection in &self.projections {
            let position = projection.low_watermark(allow_cached).await?;
            low = Some(low.map_or(position, |l| l.min(position)));
        }
        Ok(low)
    }

    /// Brings projections up to the request's target, reading the log from
    /// just past the low watermark to its current end.
    ///
    /// Returns the number of events read from the log.
    #[tracing::instrument(skip(self))]
    pub async fn catch_up(&self, request: CatchUpRequest) -> Result<usize> {
        let mut positions = Vec::with_capacity(self.projections.len());
        for projection in &self.projections {
            positions.push(projection.low_watermark(request.allow_cached).await?);
        }

        let Some(low) = positions.iter().min().copied() else {
            return Ok(0);
        };
        if let Some(target) = request.target
            && low.has_reached(target)
        {
            tracing::debug!(%low, %target, "projections already caught up");
            return Ok(0);
        }

        let mut read = 0usize;
        let mut pages = self.log.read_pages(low.next(), self.page_size);
        while let Some(page) = pages.next().await {
            let page = page?;
            read += page.len();

            for (projection, position) in self.projections.iter().zip(positions.iter_mut()) {
                let start = page.partition_point(|event| {
                    event
                        .global_sequence_number
                        .is_some_and(|p| position.has_reached(p))
                });
                let pending = &page[start..];
                let Some(last) = pending.last() else {
                    continue;
                };

                projection.dispatch(pending).await?;
                *position = position.advance(last.committed_position()?);
                metrics::counter!("projections_events_processed", "projection" => projection.name())
                    .increment(pending.len() as u64);
            }
        }

        tracing::info!(from = %low.next(), events_read = read, "catch-up complete");
        Ok(read)
    }

    /// Catches every projection up to the current end of the log.
    pub async fn run_catch_up(&self) -> Result<usize> {
        self.catch_up(CatchUpRequest::to_end()).await
    }

    /// Resets all projections and replays all events from the log.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild_all(&self) -> Result<usize> {
        for projection in &self.projections {
            projection.reset().await?;
        }
        self.run_catch_up().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_model::{InMemoryProjection, ReadModel};
    use common::{AggregateId, BatchId, SequenceNumber};
    use event_store::{EventEnvelope, InMemoryEventStore};

    /// Records the global positions it was fed.
    #[derive(Default)]
    struct Seen(Vec<i64>);

    impl ReadModel for Seen {
        fn apply(&mut self, event: &EventEnvelope) -> Result<()> {
            self.0.push(event.committed_position()?.as_i64());
            Ok(())
        }

        fn count(&self) -> usize {
            self.0.len()
        }
    }

    async fn commit(store: &InMemoryEventStore, count: i64) {
        let next = store.next_global_sequence_number().await.unwrap();
        let aggregate_id = AggregateId::new();
        let batch_id = BatchId::new();
        let events: Vec<EventEnvelope> = (0..count)
            .map(|i| {
                EventEnvelope::builder()
                    .aggregate_id(aggregate_id)
                    .aggregate_type("Test")
                    .event_type("Tested")
                    .sequence_number(SequenceNumber::new(i))
                    .global_sequence_number(next.offset(i as usize))
                    .batch_id(batch_id)
                    .payload_raw(serde_json::json!({ "n": i }))
                    .build()
            })
            .collect();
        store.append(batch_id, &events).await.unwrap();
    }

    fn seen(name: &'static str) -> InMemoryProjection<Seen> {
        InMemoryProjection::new(name)
    }

    #[tokio::test]
    async fn test_catch_up_processes_all_events_in_pages() {
        let store = InMemoryEventStore::new();
        commit(&store, 3).await;
        commit(&store, 2).await;

        let projection = seen("seen");
        let mut processor = ProjectionProcessor::new(store).with_page_size(2);
        processor.register(projection.clone());

        assert_eq!(processor.run_catch_up().await.unwrap(), 5);
        assert_eq!(projection.read(|s| s.0.clone()).await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_catch_up_skips_already_processed() {
        let store = InMemoryEventStore::new();
        commit(&store, 3).await;

        let projection = seen("seen");
        let mut processor = ProjectionProcessor::new(store.clone());
        processor.register(projection.clone());

        processor.run_catch_up().await.unwrap();
        commit(&store, 1).await;
        assert_eq!(processor.run_catch_up().await.unwrap(), 1);

        assert_eq!(projection.read(|s| s.0.clone()).await, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_reached_target_reads_nothing() {
        let store = InMemoryEventStore::new();
        commit(&store, 2).await;

        let mut processor = ProjectionProcessor::new(store);
        processor.register(seen("seen"));
        processor.run_catch_up().await.unwrap();

        let read = processor
            .catch_up(CatchUpRequest::to(GlobalSequenceNumber::new(1), true))
            .await
            .unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_lagging_projection_gets_only_what_it_missed() {
        let store = InMemoryEventStore::new();
        commit(&store, 3).await;

        let early = seen("early");
        let mut processor = ProjectionProcessor::new(store.clone());
        processor.register(early.clone());
        processor.run_catch_up().await.unwrap();

        commit(&store, 1).await;
        let late = seen("late");
        processor.register(late.clone());
        processor.run_catch_up().await.unwrap();

        assert_eq!(early.read(|s| s.0.clone()).await, vec![0, 1, 2, 3]);
        assert_eq!(late.read(|s| s.0.clone()).await, vec![0, 1, 2, 3]);
        assert_eq!(
            processor.low_watermark(true).await.unwrap(),
            Some(ProjectionPosition::at(GlobalSequenceNumber::new(3)))
        );
    }

    #[tokio::test]
    async fn test_rebuild_resets_and_replays() {
        let store = InMemoryEventStore::new();
        commit(&store, 2).await;

        let projection = seen("seen");
        let mut processor = ProjectionProcessor::new(store);
        processor.register(projection.clone());

        processor.run_catch_up().await.unwrap();
        processor.rebuild_all().await.unwrap();

        assert_eq!(projection.read(|s| s.0.clone()).await, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_no_projections_is_a_no_op() {
        let store = InMemoryEventStore::new();
        commit(&store, 2).await;

        let processor = ProjectionProcessor::new(store);

        assert_eq!(processor.run_catch_up().await.unwrap(), 0);
        assert_eq!(processor.low_watermark(false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_log_catch_up() {
        let projection = seen("seen");
        let mut processor = ProjectionProcessor::new(InMemoryEventStore::new());
        processor.register(projection.clone());

        assert_eq!(processor.run_catch_up().await.unwrap(), 0);
        assert_eq!(projection.count().await, 0);
    }
}
