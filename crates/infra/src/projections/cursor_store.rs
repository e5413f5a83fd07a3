//! Projection cursor/offset persistence.
//!
//! A cursor is the last applied `sequence_number` per (projection, aggregate)
//! stream. Envelopes at or below it are redeliveries and are skipped; clearing
//! a projection's cursors and replaying the store rebuilds it deterministically.

use std::collections::HashMap;
use std::sync::RwLock;

use tally_core::AggregateId;

use crate::read_model::ReadModelError;

pub trait ProjectionCursorStore: Send + Sync {
    /// Last applied sequence number (0 when the stream was never seen).
    fn get_cursor(&self, projection_name: &str, aggregate_id: &AggregateId) -> Result<u64, ReadModelError>;

    fn update_cursor(
        &self,
        projection_name: &str,
        aggregate_id: &AggregateId,
        sequence_number: u64,
    ) -> Result<(), ReadModelError>;

    /// Forget every cursor of one projection (for rebuilds).
    fn clear_cursors(&self, projection_name: &str) -> Result<(), ReadModelError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCursorStore {
    cursors: RwLock<HashMap<(String, AggregateId), u64>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> ReadModelError {
    ReadModelError::Unavailable("cursor lock poisoned".to_string())
}

impl ProjectionCursorStore for InMemoryCursorStore {
    fn get_cursor(&self, projection_name: &str, aggregate_id: &AggregateId) -> Result<u64, ReadModelError> {
        let cursors = self.cursors.read().map_err(|_| poisoned())?;
        Ok(cursors
            .get(&(projection_name.to_string(), aggregate_id.clone()))
            .copied()
            .unwrap_or(0))
    }

    fn update_cursor(
        &self,
        projection_name: &str,
        aggregate_id: &AggregateId,
        sequence_number: u64,
    ) -> Result<(), ReadModelError> {
        self.cursors
            .write()
            .map_err(|_| poisoned())?
            .insert((projection_name.to_string(), aggregate_id.clone()), sequence_number);
        Ok(())
    }

    fn clear_cursors(&self, projection_name: &str) -> Result<(), ReadModelError> {
        self.cursors
            .write()
            .map_err(|_| poisoned())?
            .retain(|(name, _), _| name != projection_name);
        Ok(())
    }
}

#[cfg(feature = "postgres")]
pub use self::postgres::PostgresCursorStore;

#[cfg(feature = "postgres")]
mod postgres {
    use std::sync::Arc;

    use sqlx::{PgPool, Row};

    use tally_core::AggregateId;

    use super::ProjectionCursorStore;
    use crate::read_model::postgres::{block_on, map_sqlx_error};
    use crate::read_model::ReadModelError;

    /// Postgres-backed cursors in `projection_offsets`.
    #[derive(Debug, Clone)]
    pub struct PostgresCursorStore {
        pool: Arc<PgPool>,
    }

    impl PostgresCursorStore {
        pub fn new(pool: PgPool) -> Self {
            Self { pool: Arc::new(pool) }
        }
    }

    impl ProjectionCursorStore for PostgresCursorStore {
        fn get_cursor(&self, projection_name: &str, aggregate_id: &AggregateId) -> Result<u64, ReadModelError> {
            let row = block_on(
                sqlx::query(
                    r#"
                    SELECT last_sequence_number
                    FROM projection_offsets
                    WHERE projection_name = $1 AND aggregate_id = $2
                    "#,
                )
                .bind(projection_name)
                .bind(aggregate_id.as_str())
                .fetch_optional(&*self.pool),
            )?
            .map_err(map_sqlx_error)?;

            match row {
                Some(row) => {
                    let seq: i64 = row.try_get("last_sequence_number").map_err(map_sqlx_error)?;
                    Ok(seq as u64)
                }
                None => Ok(0),
            }
        }

        fn update_cursor(
            &self,
            projection_name: &str,
            aggregate_id: &AggregateId,
            sequence_number: u64,
        ) -> Result<(), ReadModelError> {
            block_on(
                sqlx::query(
                    r#"
                    INSERT INTO projection_offsets (projection_name, aggregate_id, last_sequence_number)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (projection_name, aggregate_id)
                    DO UPDATE SET
                        last_sequence_number = EXCLUDED.last_sequence_number,
                        updated_at = NOW()
                    "#,
                )
                .bind(projection_name)
                .bind(aggregate_id.as_str())
                .bind(sequence_number as i64)
                .execute(&*self.pool),
            )?
            .map_err(map_sqlx_error)?;
            Ok(())
        }

        fn clear_cursors(&self, projection_name: &str) -> Result<(), ReadModelError> {
            block_on(
                sqlx::query("DELETE FROM projection_offsets WHERE projection_name = $1")
                    .bind(projection_name)
                    .execute(&*self.pool),
            )?
            .map_err(map_sqlx_error)?;
            Ok(())
        }
    }
}
