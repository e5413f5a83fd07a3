use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use tally_core::{AggregateId, ExpectedVersion};
use tally_events::EventEnvelope;

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// The store assigns sequence numbers during append:
///
/// 1. **Domain event**: returned by the aggregate's `handle()`
/// 2. **UncommittedEvent**: JSON payload plus stream metadata
/// 3. **StoredEvent**: persisted with its `sequence_number`
/// 4. **EventEnvelope**: published to the bus for projections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A stored event in an append-only stream.
///
/// `sequence_number` starts at 1 per stream and has no gaps. `global_position`
/// orders events across all streams in append order and is what `load_all`
/// sorts by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Position in the aggregate stream.
    pub sequence_number: u64,

    /// Position in the whole store.
    pub global_position: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    /// Convert a stored event into an envelope for publication.
    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.aggregate_id.clone(),
            self.aggregate_type.clone(),
            self.sequence_number,
            self.occurred_at,
            self.payload.clone(),
        )
    }
}

/// Event store operation error.
///
/// `Concurrency` is the only recoverable signal: the caller reloads the stream,
/// re-validates and decides again. Everything else is infrastructure.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event serialization failed: {0}")]
    Serialization(String),

    #[error("event store unavailable: {0}")]
    Unavailable(String),
}

impl EventStoreError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, EventStoreError::Concurrency(_))
    }
}

/// Append-only event store.
///
/// Events live in streams, one per aggregate instance, keyed by `AggregateId`.
///
/// `append()`:
/// - requires every event in the batch to target the same stream and type
/// - checks `expected_version` against the current stream version
/// - assigns `current_version + 1 ..` and persists the batch atomically
///
/// `load_stream()` returns a stream oldest first, or an empty vector for an
/// unknown id. `load_all()` returns every stream interleaved in global append
/// order and backs projection rebuilds.
pub trait EventStore: Send + Sync {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    fn load_stream(&self, aggregate_id: &AggregateId) -> Result<Vec<StoredEvent>, EventStoreError>;

    fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn load_stream(&self, aggregate_id: &AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(aggregate_id)
    }

    fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_all()
    }
}

impl UncommittedEvent {
    /// Wrap a typed domain event, stamping it with the current time.
    pub fn from_typed<E>(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: tally_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event)
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?;

        Ok(Self {
            event_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: Utc::now(),
            payload,
        })
    }
}

/// Checks shared by every backend: one stream and one aggregate type per batch.
pub(crate) fn validate_batch(events: &[UncommittedEvent]) -> Result<(), EventStoreError> {
    let Some(first) = events.first() else {
        return Ok(());
    };

    for (idx, e) in events.iter().enumerate().skip(1) {
        if e.aggregate_id != first.aggregate_id {
            return Err(EventStoreError::InvalidAppend(format!(
                "batch contains multiple aggregate_ids (index {idx})"
            )));
        }
        if e.aggregate_type != first.aggregate_type {
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "batch contains multiple aggregate_types (index {idx})"
            )));
        }
    }
    Ok(())
}
