use std::collections::HashMap;

use common::{AggregateId, BatchId, SequenceNumber};
use criterion::{Criterion, criterion_group, criterion_main};
use event_store::{EventEnvelope, EventLog, InMemoryEventStore};
use projections::{InMemoryProjection, ProjectionProcessor, ReadModel};

#[derive(Default)]
struct EventsPerAggregate(HashMap<AggregateId, usize>);

impl ReadModel for EventsPerAggregate {
    fn apply(&mut self, event: &EventEnvelope) -> projections::Result<()> {
        *self.0.entry(event.aggregate_id).or_default() += 1;
        Ok(())
    }

    fn count(&self) -> usize {
        self.0.len()
    }
}

/// Populate a log with `aggregates` batches of three events each.
async fn populate_store(store: &InMemoryEventStore, aggregates: usize) {
    for _ in 0..aggregates {
        let next = store.next_global_sequence_number().await.unwrap();
        let aggregate_id = AggregateId::new();
        let batch_id = BatchId::new();
        let events: Vec<EventEnvelope> = (0..3)
            .map(|i| {
                EventEnvelope::builder()
                    .aggregate_id(aggregate_id)
                    .aggregate_type("Bench")
                    .event_type("Benched")
                    .sequence_number(SequenceNumber::new(i))
                    .global_sequence_number(next.offset(i as usize))
                    .batch_id(batch_id)
                    .payload_raw(serde_json::json!({ "i": i }))
                    .build()
            })
            .collect();
        store.append(batch_id, &events).await.unwrap();
    }
}

fn bench_catch_up(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryEventStore::new();
    rt.block_on(populate_store(&store, 1000));

    let mut group = c.benchmark_group("projections/catch_up_3000_events");
    for page_size in [100usize, 500] {
        group.bench_function(format!("page_{page_size}"), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let mut processor =
                        ProjectionProcessor::new(store.clone()).with_page_size(page_size);
                    processor.register(InMemoryProjection::<EventsPerAggregate>::new("bench"));
                    processor.run_catch_up().await.unwrap();
                });
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_catch_up);
criterion_main!(benches);
