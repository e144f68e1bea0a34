//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container and need Docker.
//! Run with:
//!
//! ```bash
//! cargo test -p event-store --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use event_store::{
    AggregateId, BatchId, Cutoff, EventEnvelope, EventLog, EventLogExt, GlobalSequenceNumber,
    Metadata, PostgresEventStore, SequenceNumber, Snapshot, SnapshotStore,
};
use futures_util::StreamExt;
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            PostgresEventStore::new(temp_pool.clone())
                .initialize()
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresEventStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE events, snapshots")
        .execute(&pool)
        .await
        .unwrap();

    PostgresEventStore::new(pool)
}

fn create_test_event(
    aggregate_id: AggregateId,
    sequence: i64,
    global: GlobalSequenceNumber,
    batch_id: BatchId,
) -> EventEnvelope {
    EventEnvelope::builder()
        .aggregate_id(aggregate_id)
        .aggregate_type("TestAggregate")
        .event_type("TestEvent")
        .sequence_number(SequenceNumber::new(sequence))
        .payload_raw(serde_json::json!({"test": true}))
        .metadata(Metadata::new().with("source", "integration"))
        .build()
        .stamped(batch_id, global, &Metadata::new())
}

async fn append_one(store: &PostgresEventStore, aggregate_id: AggregateId, sequence: i64) {
    let next = store.next_global_sequence_number().await.unwrap();
    let batch = BatchId::new();
    store
        .append(batch, &[create_test_event(aggregate_id, sequence, next, batch)])
        .await
        .unwrap();
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_append_and_load_round_trips_all_fields() {
    let store = get_test_store().await;
    let aggregate_id = AggregateId::new();
    let batch = BatchId::new();

    let events = vec![
        create_test_event(aggregate_id, 0, GlobalSequenceNumber::new(0), batch),
        create_test_event(aggregate_id, 1, GlobalSequenceNumber::new(1), batch),
    ];
    store.append(batch, &events).await.unwrap();

    let loaded = store
        .load_by_aggregate(aggregate_id, SequenceNumber::FIRST)
        .await
        .unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[1].sequence_number, SequenceNumber::new(1));
    assert_eq!(loaded[1].global_sequence_number, Some(GlobalSequenceNumber::new(1)));
    assert_eq!(loaded[0].batch_id, Some(batch));
    assert_eq!(
        loaded[0].metadata.get("source"),
        Some(&serde_json::json!("integration"))
    );
    assert_eq!(
        store.next_global_sequence_number().await.unwrap(),
        GlobalSequenceNumber::new(2)
    );

    let first = store.first_event(aggregate_id).await.unwrap().unwrap();
    assert_eq!(first.sequence_number, SequenceNumber::FIRST);
    assert!(store.first_event(AggregateId::new()).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_competing_writer_is_reported_as_conflict() {
    let store = get_test_store().await;
    let aggregate_id = AggregateId::new();
    append_one(&store, aggregate_id, 0).await;

    let batch = BatchId::new();
    let stale = create_test_event(aggregate_id, 0, GlobalSequenceNumber::new(1), batch);
    let result = store.append(batch, &[stale]).await;

    assert!(result.unwrap_err().is_conflict());
    let loaded = store
        .load_by_aggregate(aggregate_id, SequenceNumber::FIRST)
        .await
        .unwrap();
    assert_eq!(loaded.len(), 1);
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_concurrent_appends_to_same_slot_commit_once() {
    let store = get_test_store().await;
    let a = AggregateId::new();
    let b = AggregateId::new();

    let batch_a = BatchId::new();
    let batch_b = BatchId::new();
    let first = create_test_event(a, 0, GlobalSequenceNumber::FIRST, batch_a);
    let second = create_test_event(b, 0, GlobalSequenceNumber::FIRST, batch_b);

    let (left, right) = tokio::join!(
        store.append(batch_a, std::slice::from_ref(&first)),
        store.append(batch_b, std::slice::from_ref(&second)),
    );

    let outcomes = [left, right];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        outcomes
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| e.is_conflict())
    );
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_read_pages_streams_in_global_order() {
    let store = get_test_store().await;
    for _ in 0..5 {
        append_one(&store, AggregateId::new(), 0).await;
    }

    let mut positions = Vec::new();
    let mut pages = store.read_pages(GlobalSequenceNumber::FIRST, 2);
    while let Some(page) = pages.next().await {
        positions.extend(page.unwrap().into_iter().filter_map(|e| e.global_sequence_number));
    }

    let expected: Vec<_> = (0..5).map(GlobalSequenceNumber::new).collect();
    assert_eq!(positions, expected);
}

#[tokio::test]
#[serial]
#[ignore = "requires Docker"]
async fn test_snapshots_respect_version_and_cutoff() {
    let store = get_test_store().await;
    let aggregate_id = AggregateId::new();

    for valid_from in [2, 6] {
        let snapshot = Snapshot::from_state(
            aggregate_id,
            "TestAggregate",
            1,
            SequenceNumber::new(valid_from),
            GlobalSequenceNumber::new(valid_from),
            &serde_json::json!({"valid_from": valid_from}),
        )
        .unwrap();
        store.save(snapshot.clone()).await.unwrap();
        // saving the same slot twice is an upsert
        store.save(snapshot).await.unwrap();
    }

    let newest = store
        .try_get(aggregate_id, 1, Cutoff::Unbounded)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(newest.valid_from, GlobalSequenceNumber::new(6));

    let older = store
        .try_get(aggregate_id, 1, Cutoff::at(GlobalSequenceNumber::new(6)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(older.valid_from, GlobalSequenceNumber::new(2));

    assert!(
        store
            .try_get(aggregate_id, 2, Cutoff::Unbounded)
            .await
            .unwrap()
            .is_none()
    );
}
