//! Postgres-backed event store implementation.
//!
//! ## Error Mapping
//!
//! | SQLx error | Postgres code | `EventStoreError` |
//! |------------|---------------|-------------------|
//! | Database (unique violation) | `23505` | `Concurrency` (another writer took the sequence number) |
//! | Database (other) | any | `InvalidAppend` |
//! | `PoolClosed` / `PoolTimedOut` / `Io` | n/a | `Unavailable` |
//! | Other | n/a | `InvalidAppend` |
//!
//! The `EventStore` trait is synchronous; calls are bridged onto the current
//! tokio runtime with `Handle::block_on`, so they must run on a blocking
//! thread (the command gateway uses `spawn_blocking`).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use tally_core::{AggregateId, ExpectedVersion};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent, validate_batch};

const SCHEMA: &str = include_str!("../../migrations/0001_event_store.sql");

/// Postgres-backed append-only event store.
///
/// `append()` reads `MAX(sequence_number)` inside a transaction, checks it
/// against `expected_version` and inserts the batch. A writer that races
/// between the read and the insert trips the `(aggregate_id, sequence_number)`
/// unique constraint, which surfaces as `Concurrency`.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the event log and read-model tables if they are missing.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id), err)]
    pub async fn load_stream_async(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT global_position, event_id, aggregate_id, aggregate_type, sequence_number,
                   event_type, event_version, occurred_at, payload
            FROM events
            WHERE aggregate_id = $1
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(aggregate_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        rows.iter().map(decode_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn load_all_async(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT global_position, event_id, aggregate_id, aggregate_type, sequence_number,
                   event_type, event_version, occurred_at, payload
            FROM events
            ORDER BY global_position ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_all", e))?;

        rows.iter().map(decode_row).collect()
    }

    #[instrument(
        skip(self, events),
        fields(event_count = events.len(), expected_version = ?expected_version),
        err
    )]
    pub async fn append_events(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }
        validate_batch(&events)?;

        let aggregate_id = events[0].aggregate_id.clone();
        let aggregate_type = events[0].aggregate_type.clone();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let (current_version, existing_type) = check_stream_version(&mut tx, &aggregate_id).await?;

        if let Some(existing) = existing_type {
            if existing != aggregate_type {
                tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{existing}', attempted append with '{aggregate_type}'"
                )));
            }
        }

        if !expected_version.matches(current_version) {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, found {current_version}"
            )));
        }

        let mut stored_events = Vec::with_capacity(events.len());
        let mut next_sequence = current_version + 1;

        for event in events {
            let row = sqlx::query(
                r#"
                INSERT INTO events (
                    event_id, aggregate_id, aggregate_type, sequence_number,
                    event_type, event_version, occurred_at, payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING global_position
                "#,
            )
            .bind(event.event_id)
            .bind(aggregate_id.as_str())
            .bind(&aggregate_type)
            .bind(next_sequence as i64)
            .bind(&event.event_type)
            .bind(event.event_version as i32)
            .bind(event.occurred_at)
            .bind(&event.payload)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_event", e))?;

            let global_position: i64 = row
                .try_get("global_position")
                .map_err(|e| map_sqlx_error("insert_event", e))?;

            stored_events.push(StoredEvent {
                event_id: event.event_id,
                aggregate_id: event.aggregate_id,
                aggregate_type: event.aggregate_type,
                sequence_number: next_sequence,
                global_position: global_position as u64,
                event_type: event.event_type,
                event_version: event.event_version,
                occurred_at: event.occurred_at,
                payload: event.payload,
            });
            next_sequence += 1;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(stored_events)
    }
}

/// Returns `(current_version, aggregate_type)`; `(0, None)` for a new stream.
async fn check_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    aggregate_id: &AggregateId,
) -> Result<(u64, Option<String>), EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(MAX(sequence_number), 0) AS current_version,
            MAX(aggregate_type) AS aggregate_type
        FROM events
        WHERE aggregate_id = $1
        "#,
    )
    .bind(aggregate_id.as_str())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current_version: Option<i64> = row
        .try_get("current_version")
        .map_err(|e| map_sqlx_error("check_stream_version", e))?;
    let aggregate_type: Option<String> = row
        .try_get("aggregate_type")
        .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    Ok((current_version.unwrap_or(0) as u64, aggregate_type))
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::Concurrency(msg),
                _ => EventStoreError::InvalidAppend(msg),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            EventStoreError::Unavailable(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => EventStoreError::Unavailable(format!("io error in {operation}: {e}")),
        other => EventStoreError::InvalidAppend(format!("sqlx error in {operation}: {other}")),
    }
}

#[derive(Debug)]
struct StoredEventRow {
    global_position: i64,
    event_id: uuid::Uuid,
    aggregate_id: String,
    aggregate_type: String,
    sequence_number: i64,
    event_type: String,
    event_version: i32,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for StoredEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEventRow {
            global_position: row.try_get("global_position")?,
            event_id: row.try_get("event_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            sequence_number: row.try_get("sequence_number")?,
            event_type: row.try_get("event_type")?,
            event_version: row.try_get("event_version")?,
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
        })
    }
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<StoredEvent, EventStoreError> {
    let row = StoredEventRow::from_row(row)
        .map_err(|e| EventStoreError::InvalidAppend(format!("failed to decode event row: {e}")))?;
    let aggregate_id = row
        .aggregate_id
        .parse()
        .map_err(|e| EventStoreError::InvalidAppend(format!("stored aggregate_id is invalid: {e}")))?;

    Ok(StoredEvent {
        event_id: row.event_id,
        aggregate_id,
        aggregate_type: row.aggregate_type,
        sequence_number: row.sequence_number as u64,
        global_position: row.global_position as u64,
        event_type: row.event_type,
        event_version: row.event_version as u32,
        occurred_at: row.occurred_at,
        payload: row.payload,
    })
}

pub(crate) fn runtime() -> Result<tokio::runtime::Handle, EventStoreError> {
    tokio::runtime::Handle::try_current().map_err(|_| {
        EventStoreError::Unavailable("postgres store requires a tokio runtime".to_string())
    })
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        runtime()?.block_on(self.append_events(events, expected_version))
    }

    fn load_stream(&self, aggregate_id: &AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        runtime()?.block_on(self.load_stream_async(aggregate_id))
    }

    fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        runtime()?.block_on(self.load_all_async())
    }
}
