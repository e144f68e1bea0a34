//! Demo entry point: opens accounts, moves money concurrently and reads the
//! balances view once the catch-up worker has caught up.
//!
//! Uses PostgreSQL when `DATABASE_URL` is set, the in-memory store otherwise.

mod bank;

use std::sync::Arc;
use std::time::Duration;

use common::AggregateId;
use domain::{BoxError, CommandProcessor, ProcessorConfig};
use event_store::{EventLog, InMemoryEventStore, PostgresEventStore, SnapshotStore};
use projections::{CatchUpConfig, InMemoryProjection, ProjectionProcessor};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::bank::{AccountError, Balances, Deposit, OpenAccount, Transfer};

const PROJECTION_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // 3. Pick a backend and run
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = sqlx::PgPool::connect(&url).await?;
            tracing::info!("using PostgreSQL event store");
            run(PostgresEventStore::new(pool)).await?;
        }
        Err(_) => {
            tracing::info!("DATABASE_URL not set, using in-memory event store");
            run(InMemoryEventStore::new()).await?;
        }
    }

    println!("{}", metrics_handle.render());
    Ok(())
}

async fn run<S>(store: S) -> Result<(), BoxError>
where
    S: EventLog + SnapshotStore + Clone + 'static,
{
    let balances = InMemoryProjection::<Balances>::new("balances");
    let mut projections = ProjectionProcessor::new(store.clone());
    projections.register(balances.clone());
    let catch_up = projections.spawn(&CatchUpConfig::from_env());

    let processor = Arc::new(
        CommandProcessor::builder(store.clone())
            .registry(bank::registry())
            .dispatcher(catch_up.clone())
            .snapshots(store)
            .domain_error::<AccountError>()
            .config(ProcessorConfig::from_env())
            .build(),
    );
    processor.initialize(false).await?;

    let alice = AggregateId::new();
    let bob = AggregateId::new();
    for (id, owner) in [(alice, "alice"), (bob, "bob")] {
        processor
            .process_command(&OpenAccount {
                id,
                owner: owner.to_string(),
            })
            .await?;
    }

    // Concurrent deposits against one account; conflicts are retried.
    let mut tellers = JoinSet::new();
    for teller in 0..8 {
        let processor = Arc::clone(&processor);
        tellers.spawn(async move {
            processor
                .process_command(&Deposit {
                    id: alice,
                    amount: 25,
                    teller: format!("teller-{teller}"),
                })
                .await
        });
    }
    while let Some(joined) = tellers.join_next().await {
        joined??;
    }

    let last = processor
        .process_command(&Transfer {
            from: alice,
            to: bob,
            amount: 75,
        })
        .await?;

    match processor
        .process_command(&Transfer {
            from: bob,
            to: alice,
            amount: 1_000,
        })
        .await
    {
        Ok(_) => tracing::warn!("overdraft was accepted"),
        Err(error) => match error.domain_error::<AccountError>() {
            Some(reason) => {
                metrics::counter!("demo_transfers_rejected_total").increment(1);
                tracing::info!(%reason, "transfer rejected");
            }
            None => return Err(error.into()),
        },
    }

    catch_up
        .wait_until_processed(&last, PROJECTION_TIMEOUT)
        .await?;
    balances
        .read(|view| {
            view.record_metrics();
            for (owner, balance) in view.iter() {
                println!("{owner}: {balance}");
            }
        })
        .await;

    catch_up.shutdown().await?;
    Ok(())
}
