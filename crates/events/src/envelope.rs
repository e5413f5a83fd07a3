use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use tally_core::AggregateId;

/// Envelope for an event, containing stream metadata.
///
/// This is the unit that is persisted and published.
///
/// - **Append-only**: `sequence_number` starts at 1 and increases by exactly one
///   per event within an aggregate stream.
/// - `payload` is the domain event (typed, or JSON on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,

    aggregate_id: AggregateId,
    aggregate_type: String,

    /// Position in the aggregate stream.
    sequence_number: u64,

    occurred_at: DateTime<Utc>,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        sequence_number: u64,
        occurred_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            sequence_number,
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    /// Replace the payload, keeping stream metadata.
    pub fn with_payload<T>(&self, payload: T) -> EventEnvelope<T> {
        EventEnvelope {
            event_id: self.event_id,
            aggregate_id: self.aggregate_id.clone(),
            aggregate_type: self.aggregate_type.clone(),
            sequence_number: self.sequence_number,
            occurred_at: self.occurred_at,
            payload,
        }
    }
}

impl EventEnvelope<JsonValue> {
    /// Decode the JSON payload into a closed, tagged event enum.
    ///
    /// Unknown tags fail here instead of producing an open-ended value.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<EventEnvelope<E>, serde_json::Error> {
        let payload = serde_json::from_value(self.payload.clone())?;
        Ok(self.with_payload(payload))
    }
}
