use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, BatchId, Cutoff, EventEnvelope, EventId, EventStoreError, GlobalSequenceNumber,
    Metadata, Result, SequenceNumber, Snapshot, SnapshotStore,
    store::{EventLog, SequenceExpectations, validate_batch},
};

const EVENT_COLUMNS: &str = "global_sequence_number, event_id, batch_id, aggregate_id, \
     aggregate_type, sequence_number, event_type, timestamp, payload, metadata";

/// PostgreSQL-backed event log and snapshot store.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Creates a new PostgreSQL event store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_event(row: PgRow) -> Result<EventEnvelope> {
        let metadata: Metadata = serde_json::from_value(row.try_get("metadata")?)?;

        Ok(EventEnvelope {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            event_type: row.try_get("event_type")?,
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            sequence_number: SequenceNumber::new(row.try_get("sequence_number")?),
            global_sequence_number: Some(GlobalSequenceNumber::new(
                row.try_get("global_sequence_number")?,
            )),
            batch_id: Some(BatchId::from_uuid(row.try_get::<Uuid, _>("batch_id")?)),
            timestamp: row.try_get("timestamp")?,
            payload: row.try_get("payload")?,
            metadata,
        })
    }

    fn row_to_snapshot(row: PgRow) -> Result<Snapshot> {
        Ok(Snapshot {
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            schema_version: row.try_get::<i32, _>("schema_version")? as u32,
            sequence_number: SequenceNumber::new(row.try_get("sequence_number")?),
            valid_from: GlobalSequenceNumber::new(row.try_get("valid_from")?),
            timestamp: row.try_get("timestamp")?,
            state: row.try_get("state")?,
        })
    }

    /// Reads the next free global position and per-aggregate sequence numbers
    /// inside the append transaction.
    async fn current_expectations(
        tx: &mut Transaction<'_, Postgres>,
        events: &[EventEnvelope],
    ) -> Result<SequenceExpectations> {
        let max_global: Option<i64> =
            sqlx::query_scalar("SELECT MAX(global_sequence_number) FROM events")
                .fetch_one(&mut **tx)
                .await?;
        let mut expectations = SequenceExpectations::new()
            .next_global(GlobalSequenceNumber::new(max_global.map_or(0, |m| m + 1)));

        let mut next_local = HashMap::new();
        for event in events {
            if next_local.contains_key(&event.aggregate_id) {
                continue;
            }
            let max_local: Option<i64> = sqlx::query_scalar(
                "SELECT MAX(sequence_number) FROM events WHERE aggregate_id = $1",
            )
            .bind(event.aggregate_id.as_uuid())
            .fetch_one(&mut **tx)
            .await?;
            next_local.insert(
                event.aggregate_id,
                SequenceNumber::new(max_local.map_or(0, |m| m + 1)),
            );
        }
        expectations.next_local = next_local;
        Ok(expectations)
    }
}

/// Classifies a slot that is already occupied as a conflict and a slot
/// beyond the next free one as a validation error.
fn check_slots(
    batch_id: BatchId,
    events: &[EventEnvelope],
    expectations: &SequenceExpectations,
) -> Result<()> {
    let first_global = events[0].committed_position()?;
    if let Some(next_global) = expectations.next_global {
        if first_global < next_global {
            return Err(EventStoreError::Conflict {
                batch_id,
                reason: format!("global sequence number {first_global} is already taken"),
            });
        }
        if first_global > next_global {
            return Err(EventStoreError::Validation(format!(
                "global sequence number {first_global} leaves a gap (next free is {next_global})"
            )));
        }
    }

    let mut checked = HashMap::new();
    for event in events {
        if checked.insert(event.aggregate_id, ()).is_some() {
            continue;
        }
        let Some(next_local) = expectations.next_local.get(&event.aggregate_id) else {
            continue;
        };
        if event.sequence_number < *next_local {
            return Err(EventStoreError::Conflict {
                batch_id,
                reason: format!(
                    "sequence number {} of aggregate {} is already taken",
                    event.sequence_number, event.aggregate_id
                ),
            });
        }
        if event.sequence_number > *next_local {
            return Err(EventStoreError::Validation(format!(
                "sequence number {} of aggregate {} leaves a gap (next free is {next_local})",
                event.sequence_number, event.aggregate_id
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl EventLog for PostgresEventStore {
    #[tracing::instrument(skip(self))]
    async fn initialize(&self) -> Result<()> {
        self.run_migrations().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, events), fields(event_count = events.len()))]
    async fn append(&self, batch_id: BatchId, events: &[EventEnvelope]) -> Result<()> {
        validate_batch(events, &SequenceExpectations::default())?;

        let mut tx = self.pool.begin().await?;

        let expectations = Self::current_expectations(&mut tx, events).await?;
        check_slots(batch_id, events, &expectations)?;

        for event in events {
            let global = event.committed_position()?;
            let metadata_json = serde_json::to_value(&event.metadata)?;

            sqlx::query(
                r#"
                INSERT INTO events (global_sequence_number, event_id, batch_id, aggregate_id,
                                    aggregate_type, sequence_number, event_type, timestamp,
                                    payload, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(global.as_i64())
            .bind(event.event_id.as_uuid())
            .bind(batch_id.as_uuid())
            .bind(event.aggregate_id.as_uuid())
            .bind(&event.aggregate_type)
            .bind(event.sequence_number.as_i64())
            .bind(&event.event_type)
            .bind(event.timestamp)
            .bind(&event.payload)
            .bind(metadata_json)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                // A writer that committed first owns the slot
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.is_unique_violation()
                {
                    return EventStoreError::Conflict {
                        batch_id,
                        reason: format!(
                            "slot taken at global sequence number {global} ({})",
                            db_err.constraint().unwrap_or("unique constraint")
                        ),
                    };
                }
                EventStoreError::Database(e)
            })?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_by_aggregate(
        &self,
        aggregate_id: AggregateId,
        from: SequenceNumber,
    ) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE aggregate_id = $1 AND sequence_number >= $2 \
             ORDER BY sequence_number ASC"
        ))
        .bind(aggregate_id.as_uuid())
        .bind(from.as_i64())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn first_event(&self, aggregate_id: AggregateId) -> Result<Option<EventEnvelope>> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE aggregate_id = $1 \
             ORDER BY sequence_number ASC \
             LIMIT 1"
        ))
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_event).transpose()
    }

    async fn read_all(
        &self,
        from: GlobalSequenceNumber,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE global_sequence_number >= $1 \
             ORDER BY global_sequence_number ASC \
             LIMIT $2"
        ))
        .bind(from.as_i64())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn next_global_sequence_number(&self) -> Result<GlobalSequenceNumber> {
        let next: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(global_sequence_number) + 1, 0) FROM events")
                .fetch_one(&self.pool)
                .await?;
        Ok(GlobalSequenceNumber::new(next))
    }
}

#[async_trait]
impl SnapshotStore for PostgresEventStore {
    async fn try_get(
        &self,
        aggregate_id: AggregateId,
        schema_version: u32,
        cutoff: Cutoff,
    ) -> Result<Option<Snapshot>> {
        let limit = match cutoff {
            Cutoff::Unbounded => None,
            Cutoff::At(position) => Some(position.as_i64()),
        };

        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT aggregate_id, aggregate_type, schema_version, sequence_number,
                   valid_from, timestamp, state
            FROM snapshots
            WHERE aggregate_id = $1
              AND schema_version = $2
              AND ($3::BIGINT IS NULL OR valid_from < $3)
            ORDER BY valid_from DESC
            LIMIT 1
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .bind(schema_version as i32)
        .bind(limit)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_snapshot).transpose()
    }

    async fn save(&self, snapshot: Snapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (aggregate_id, aggregate_type, schema_version, sequence_number,
                                   valid_from, timestamp, state)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (aggregate_id, schema_version, valid_from) DO UPDATE SET
                aggregate_type = EXCLUDED.aggregate_type,
                sequence_number = EXCLUDED.sequence_number,
                timestamp = EXCLUDED.timestamp,
                state = EXCLUDED.state
            "#,
        )
        .bind(snapshot.aggregate_id.as_uuid())
        .bind(&snapshot.aggregate_type)
        .bind(snapshot.schema_version as i32)
        .bind(snapshot.sequence_number.as_i64())
        .bind(snapshot.valid_from.as_i64())
        .bind(snapshot.timestamp)
        .bind(&snapshot.state)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
