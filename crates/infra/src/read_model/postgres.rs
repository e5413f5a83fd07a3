//! Postgres-backed read models for the conference scenario.
//!
//! Like the event store, these bridge the synchronous `ReadModelStore` API
//! onto the ambient tokio runtime and must not be called from an async
//! worker thread.

use std::future::Future;
use std::sync::Arc;

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use tally_core::AggregateId;

use super::{ReadModelError, ReadModelStore};
use crate::projections::{ConferenceRow, ConferenceSpeaker};

pub(crate) fn block_on<F: Future>(fut: F) -> Result<F::Output, ReadModelError> {
    let handle = tokio::runtime::Handle::try_current()
        .map_err(|_| ReadModelError::Unavailable("postgres read model requires a tokio runtime".to_string()))?;
    Ok(handle.block_on(fut))
}

pub(crate) fn map_sqlx_error(err: sqlx::Error) -> ReadModelError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            ReadModelError::Corrupt(err.to_string())
        }
        other => ReadModelError::Unavailable(other.to_string()),
    }
}

fn parse_id(raw: String) -> Result<AggregateId, ReadModelError> {
    raw.parse()
        .map_err(|e| ReadModelError::Corrupt(format!("stored conference id {raw:?}: {e}")))
}

fn conference_from_row(row: PgRow) -> Result<ConferenceRow, ReadModelError> {
    Ok(ConferenceRow {
        id: parse_id(row.try_get("id").map_err(map_sqlx_error)?)?,
        name: row.try_get("name").map_err(map_sqlx_error)?,
    })
}

#[derive(Debug, Clone)]
pub struct PostgresConferenceStore {
    pool: Arc<PgPool>,
}

impl PostgresConferenceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

impl ReadModelStore<AggregateId, ConferenceRow> for PostgresConferenceStore {
    fn upsert(&self, key: AggregateId, value: ConferenceRow) -> Result<(), ReadModelError> {
        block_on(
            sqlx::query(
                r#"
                INSERT INTO conferences (id, name) VALUES ($1, $2)
                ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name
                "#,
            )
            .bind(key.as_str())
            .bind(&value.name)
            .execute(&*self.pool),
        )?
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    fn get(&self, key: &AggregateId) -> Result<Option<ConferenceRow>, ReadModelError> {
        block_on(
            sqlx::query("SELECT id, name FROM conferences WHERE id = $1")
                .bind(key.as_str())
                .fetch_optional(&*self.pool),
        )?
        .map_err(map_sqlx_error)?
        .map(conference_from_row)
        .transpose()
    }

    fn list_all(&self) -> Result<Vec<ConferenceRow>, ReadModelError> {
        block_on(
            sqlx::query("SELECT id, name FROM conferences ORDER BY id")
                .fetch_all(&*self.pool),
        )?
        .map_err(map_sqlx_error)?
        .into_iter()
        .map(conference_from_row)
        .collect()
    }

    fn clear(&self) -> Result<(), ReadModelError> {
        block_on(sqlx::query("DELETE FROM conferences").execute(&*self.pool))?.map_err(map_sqlx_error)?;
        Ok(())
    }
}

fn speaker_from_row(row: PgRow) -> Result<ConferenceSpeaker, ReadModelError> {
    Ok(ConferenceSpeaker {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        conference_id: parse_id(row.try_get("conference_id").map_err(map_sqlx_error)?)?,
        conference_name: row.try_get("conference_name").map_err(map_sqlx_error)?,
        speaker_name: row.try_get("speaker_name").map_err(map_sqlx_error)?,
    })
}

#[derive(Debug, Clone)]
pub struct PostgresSpeakerStore {
    pool: Arc<PgPool>,
}

impl PostgresSpeakerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

impl ReadModelStore<String, ConferenceSpeaker> for PostgresSpeakerStore {
    fn upsert(&self, key: String, value: ConferenceSpeaker) -> Result<(), ReadModelError> {
        block_on(
            sqlx::query(
                r#"
                INSERT INTO conference_speakers (id, conference_id, conference_name, speaker_name)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO UPDATE SET
                    conference_name = EXCLUDED.conference_name,
                    speaker_name = EXCLUDED.speaker_name
                "#,
            )
            .bind(&key)
            .bind(value.conference_id.as_str())
            .bind(&value.conference_name)
            .bind(&value.speaker_name)
            .execute(&*self.pool),
        )?
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    fn get(&self, key: &String) -> Result<Option<ConferenceSpeaker>, ReadModelError> {
        block_on(
            sqlx::query(
                "SELECT id, conference_id, conference_name, speaker_name FROM conference_speakers WHERE id = $1",
            )
            .bind(key)
            .fetch_optional(&*self.pool),
        )?
        .map_err(map_sqlx_error)?
        .map(speaker_from_row)
        .transpose()
    }

    fn list_all(&self) -> Result<Vec<ConferenceSpeaker>, ReadModelError> {
        block_on(
            sqlx::query(
                "SELECT id, conference_id, conference_name, speaker_name FROM conference_speakers ORDER BY id",
            )
            .fetch_all(&*self.pool),
        )?
        .map_err(map_sqlx_error)?
        .into_iter()
        .map(speaker_from_row)
        .collect()
    }

    fn clear(&self) -> Result<(), ReadModelError> {
        block_on(sqlx::query("DELETE FROM conference_speakers").execute(&*self.pool))?.map_err(map_sqlx_error)?;
        Ok(())
    }
}
