//! Integration tests: command processor → catch-up worker → projections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{AggregateId, BatchId, GlobalSequenceNumber, SequenceNumber};
use domain::{
    Aggregate, AggregateCommand, Command, CommandProcessingResult, CommandProcessor,
    CommandRegistry, DomainEvent,
};
use event_store::{EventEnvelope, EventLog, InMemoryEventStore};
use projections::{
    CatchUpConfig, CatchUpHandle, CatchUpRequest, InMemoryProjection, Projection,
    ProjectionError, ProjectionPosition, ProjectionProcessor, ReadModel,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Wallet {
    balance: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum WalletEvent {
    Credited { amount: i64 },
}

impl DomainEvent for WalletEvent {
    fn event_type(&self) -> &'static str {
        "Credited"
    }
}

#[derive(Debug, thiserror::Error)]
#[error("wallet rejected credit")]
struct WalletError;

impl Aggregate for Wallet {
    type Event = WalletEvent;
    type Error = WalletError;

    fn aggregate_type() -> &'static str {
        "Wallet"
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            WalletEvent::Credited { amount } => self.balance += amount,
        }
    }
}

struct Credit {
    id: AggregateId,
    amount: i64,
}

impl Command for Credit {
    const COMMAND_TYPE: &'static str = "Credit";
}

impl AggregateCommand for Credit {
    type Aggregate = Wallet;

    fn target(&self) -> AggregateId {
        self.id
    }

    fn execute(&self, _wallet: &Wallet) -> Result<Vec<WalletEvent>, WalletError> {
        Ok(vec![WalletEvent::Credited {
            amount: self.amount,
        }])
    }
}

#[derive(Default)]
struct Balances(HashMap<AggregateId, i64>);

impl ReadModel for Balances {
    fn apply(&mut self, event: &EventEnvelope) -> projections::Result<()> {
        if event.aggregate_type != Wallet::aggregate_type() {
            return Ok(());
        }
        let event_body: WalletEvent = serde_json::from_value(event.payload.clone())?;
        let WalletEvent::Credited { amount } = event_body;
        *self.0.entry(event.aggregate_id).or_default() += amount;
        Ok(())
    }

    fn count(&self) -> usize {
        self.0.len()
    }
}

/// Fails its first `failures` dispatches.
struct Flaky {
    failures: AtomicUsize,
    inner: InMemoryProjection<Balances>,
}

#[async_trait]
impl Projection for Flaky {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn dispatch(&self, events: &[EventEnvelope]) -> projections::Result<()> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProjectionError::Projection("downstream unavailable".into()));
        }
        self.inner.dispatch(events).await
    }

    async fn low_watermark(&self, allow_cached: bool) -> projections::Result<ProjectionPosition> {
        self.inner.low_watermark(allow_cached).await
    }

    async fn reset(&self) -> projections::Result<()> {
        self.inner.reset().await
    }
}

const WAIT: Duration = Duration::from_secs(5);

fn quiet_config() -> CatchUpConfig {
    CatchUpConfig {
        page_size: 2,
        refresh_interval: Duration::from_secs(3600),
        poll_interval: Duration::from_millis(5),
    }
}

fn registry() -> CommandRegistry {
    CommandRegistry::new().aggregate::<Credit>()
}

fn spawn_balances(
    store: &InMemoryEventStore,
    config: &CatchUpConfig,
) -> (CatchUpHandle, InMemoryProjection<Balances>) {
    let balances = InMemoryProjection::<Balances>::new("balances");
    let mut processor = ProjectionProcessor::new(store.clone());
    processor.register(balances.clone());
    (processor.spawn(config), balances)
}

async fn credit(
    processor: &CommandProcessor<InMemoryEventStore>,
    id: AggregateId,
    amount: i64,
) -> CommandProcessingResult {
    processor
        .process_command(&Credit { id, amount })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_dispatched_commits_become_visible() {
    let store = InMemoryEventStore::new();
    let (handle, balances) = spawn_balances(&store, &quiet_config());
    let processor = CommandProcessor::builder(store.clone())
        .registry(registry())
        .dispatcher(handle.clone())
        .build();

    let alice = AggregateId::new();
    let bob = AggregateId::new();
    credit(&processor, alice, 10).await;
    credit(&processor, bob, 5).await;
    let last = credit(&processor, alice, 7).await;

    handle.wait_until_processed(&last, WAIT).await.unwrap();

    assert_eq!(balances.read(|b| b.0[&alice]).await, 17);
    assert_eq!(balances.read(|b| b.0[&bob]).await, 5);
    assert_eq!(
        balances.position().await,
        ProjectionPosition::at(GlobalSequenceNumber::new(2))
    );
}

#[tokio::test]
async fn test_periodic_refresh_observes_foreign_writes() {
    let store = InMemoryEventStore::new();
    let config = CatchUpConfig {
        refresh_interval: Duration::from_millis(10),
        ..quiet_config()
    };
    let (handle, balances) = spawn_balances(&store, &config);

    // Another writer with no dispatcher attached.
    let foreign = CommandProcessor::builder(store.clone())
        .registry(registry())
        .build();
    let id = AggregateId::new();
    let result = credit(&foreign, id, 3).await;

    handle.wait_until_processed(&result, WAIT).await.unwrap();
    assert_eq!(balances.read(|b| b.0[&id]).await, 3);
}

#[tokio::test]
async fn test_wait_times_out_naming_the_projection() {
    let store = InMemoryEventStore::new();
    let (handle, _balances) = spawn_balances(&store, &quiet_config());

    let error = handle
        .wait_for_projection(
            "balances",
            GlobalSequenceNumber::new(0),
            Duration::from_millis(30),
        )
        .await
        .unwrap_err();

    match error {
        ProjectionError::Timeout { projection, target } => {
            assert_eq!(projection, "balances");
            assert_eq!(target, GlobalSequenceNumber::new(0));
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_projection_is_rejected() {
    let (handle, _balances) = spawn_balances(&InMemoryEventStore::new(), &quiet_config());

    let error = handle
        .wait_for_projection("missing", GlobalSequenceNumber::FIRST, WAIT)
        .await
        .unwrap_err();

    assert!(matches!(error, ProjectionError::UnknownProjection(name) if name == "missing"));
}

#[tokio::test]
async fn test_no_events_needs_no_wait() {
    let (handle, _balances) = spawn_balances(&InMemoryEventStore::new(), &quiet_config());

    handle
        .wait_until_processed(&CommandProcessingResult::no_events(), Duration::ZERO)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_failed_attempt_does_not_stop_the_worker() {
    let store = InMemoryEventStore::new();
    let flaky = Flaky {
        failures: AtomicUsize::new(1),
        inner: InMemoryProjection::new("flaky-inner"),
    };
    let view = flaky.inner.clone();
    let mut processor = ProjectionProcessor::new(store.clone());
    processor.register(flaky);
    let handle = processor.spawn(&quiet_config());

    let writer = CommandProcessor::builder(store.clone())
        .registry(registry())
        .build();
    let id = AggregateId::new();
    credit(&writer, id, 4).await;

    let first = handle.catch_up(CatchUpRequest::to_end()).await;
    assert!(matches!(first, Err(ProjectionError::Projection(_))));

    let second = handle.catch_up(CatchUpRequest::to_end()).await.unwrap();
    assert_eq!(second, 1);
    assert_eq!(view.read(|b| b.0[&id]).await, 4);
}

#[tokio::test]
async fn test_initialize_with_purge_rebuilds_views() {
    let store = InMemoryEventStore::new();
    let (handle, balances) = spawn_balances(&store, &quiet_config());
    let processor = CommandProcessor::builder(store.clone())
        .registry(registry())
        .dispatcher(handle.clone())
        .build();

    let id = AggregateId::new();
    let result = credit(&processor, id, 8).await;
    handle.wait_until_processed(&result, WAIT).await.unwrap();

    processor.initialize(true).await.unwrap();

    assert_eq!(balances.count().await, 1);
    assert_eq!(balances.read(|b| b.0[&id]).await, 8);
}

#[tokio::test]
async fn test_initialize_catches_up_existing_log() {
    let store = InMemoryEventStore::new();
    let writer = CommandProcessor::builder(store.clone())
        .registry(registry())
        .build();
    let id = AggregateId::new();
    credit(&writer, id, 2).await;
    credit(&writer, id, 2).await;
    credit(&writer, id, 2).await;

    let (handle, balances) = spawn_balances(&store, &quiet_config());
    let processor = CommandProcessor::builder(store.clone())
        .registry(registry())
        .dispatcher(handle)
        .build();
    processor.initialize(false).await.unwrap();

    assert_eq!(balances.read(|b| b.0[&id]).await, 6);
}

#[tokio::test]
async fn test_shutdown_drains_queued_requests() {
    let store = InMemoryEventStore::new();
    let (handle, balances) = spawn_balances(&store, &quiet_config());
    let writer = CommandProcessor::builder(store.clone())
        .registry(registry())
        .build();
    let id = AggregateId::new();
    let result = credit(&writer, id, 9).await;

    handle.request(CatchUpRequest::to_end()).unwrap();
    handle.clone().shutdown().await.unwrap();

    assert!(
        balances
            .position()
            .await
            .has_reached(result.new_position().unwrap())
    );
    assert!(matches!(
        handle.request(CatchUpRequest::to_end()),
        Err(ProjectionError::WorkerStopped)
    ));
}

#[tokio::test]
async fn test_malformed_payload_is_a_deserialization_error() {
    let store = InMemoryEventStore::new();
    let batch_id = BatchId::new();
    let garbled = EventEnvelope::builder()
        .aggregate_id(AggregateId::new())
        .aggregate_type(Wallet::aggregate_type())
        .event_type("Credited")
        .sequence_number(SequenceNumber::FIRST)
        .global_sequence_number(GlobalSequenceNumber::FIRST)
        .batch_id(batch_id)
        .payload_raw(serde_json::json!({"Credited": {"amount": "plenty"}}))
        .build();
    store.append(batch_id, &[garbled]).await.unwrap();
    let (handle, balances) = spawn_balances(&store, &quiet_config());

    let error = handle.catch_up(CatchUpRequest::to_end()).await.unwrap_err();

    assert!(matches!(error, ProjectionError::Deserialization(_)));
    assert_eq!(balances.position().await, ProjectionPosition::initial());
}
