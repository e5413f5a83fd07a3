//! Projection implementations (read model builders).
//!
//! Projections consume published JSON envelopes and maintain read models.
//! All projections are:
//! - **Rebuildable**: cleared and replayed from `EventStore::load_all`
//! - **Idempotent**: per-stream cursors skip redeliveries and rows are upserts
//! - **Ordered per aggregate**: a gap is an error, never silently folded in

pub mod bike_status;
pub mod conferences;
pub mod cursor_store;
pub mod speakers;

use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

use tally_events::{ApplyOutcome, EventEnvelope, ProjectionError, check_sequence};

use crate::event_store::{EventStore, EventStoreError};
use crate::read_model::ReadModelError;

pub use bike_status::{BikeStatus, BikeStatusProjection};
pub use conferences::{ConferenceProjection, ConferenceRow};
pub use cursor_store::{InMemoryCursorStore, ProjectionCursorStore};
#[cfg(feature = "postgres")]
pub use cursor_store::PostgresCursorStore;
pub use speakers::{speaker_row_id, ConferenceSpeaker, SpeakerProjection};

#[derive(Debug, Error)]
pub enum ProjectionApplyError {
    #[error(transparent)]
    Sequence(#[from] ProjectionError),

    #[error("failed to deserialize {aggregate_type} event: {message}")]
    Deserialize { aggregate_type: String, message: String },

    #[error(transparent)]
    Store(#[from] ReadModelError),

    #[error(transparent)]
    EventStore(#[from] EventStoreError),
}

/// A read model fed from JSON envelopes.
pub trait EnvelopeProjection: Send + Sync {
    /// Stable name, used as the cursor namespace.
    fn name(&self) -> &'static str;

    /// Apply one envelope. Must be a no-op for redeliveries.
    fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<ApplyOutcome, ProjectionApplyError>;

    /// Drop all rows and cursors.
    fn reset(&self) -> Result<(), ProjectionApplyError>;
}

/// Cursor bookkeeping shared by every projection.
///
/// Holds a mutex so the check/write/advance sequence is atomic per projection
/// even when a rebuild races the live worker.
pub(crate) struct Tracked<'a> {
    pub name: &'static str,
    pub aggregate_type: &'static str,
    pub cursors: &'a dyn ProjectionCursorStore,
    pub gate: &'a Mutex<()>,
}

impl Tracked<'_> {
    /// Decode, check ordering, run `write`, then advance the cursor.
    ///
    /// The cursor only moves after `write` succeeded, so a failed write is
    /// retried against the same envelope.
    pub fn apply<E, F>(&self, envelope: &EventEnvelope<JsonValue>, write: F) -> Result<ApplyOutcome, ProjectionApplyError>
    where
        E: DeserializeOwned,
        F: FnOnce(&EventEnvelope<E>) -> Result<(), ReadModelError>,
    {
        if envelope.aggregate_type() != self.aggregate_type {
            return Ok(ApplyOutcome::Ignored);
        }

        let _gate = self.gate.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let aggregate_id = envelope.aggregate_id();
        let found = envelope.sequence_number();
        let last = self.cursors.get_cursor(self.name, aggregate_id)?;

        match check_sequence(aggregate_id, last, found)? {
            ApplyOutcome::Applied => {}
            other => {
                debug!(projection = self.name, aggregate_id = %aggregate_id, sequence = found, "skipping redelivered envelope");
                return Ok(other);
            }
        }

        let typed = envelope.decode::<E>().map_err(|e| ProjectionApplyError::Deserialize {
            aggregate_type: self.aggregate_type.to_string(),
            message: e.to_string(),
        })?;
        write(&typed)?;
        self.cursors.update_cursor(self.name, aggregate_id, found)?;
        Ok(ApplyOutcome::Applied)
    }
}

/// Apply an envelope; on a sequence gap, backfill the missing events of that
/// stream from the store first.
pub fn apply_with_catch_up<P, S>(
    projection: &P,
    store: &S,
    envelope: &EventEnvelope<JsonValue>,
) -> Result<ApplyOutcome, ProjectionApplyError>
where
    P: EnvelopeProjection + ?Sized,
    S: EventStore + ?Sized,
{
    match projection.apply_envelope(envelope) {
        Err(ProjectionApplyError::Sequence(ProjectionError::SequenceGap { expected, found, .. })) => {
            info!(
                projection = projection.name(),
                aggregate_id = %envelope.aggregate_id(),
                expected,
                found,
                "sequence gap, catching up from the event store"
            );
            for stored in store.load_stream(envelope.aggregate_id())? {
                if stored.sequence_number > found {
                    break;
                }
                projection.apply_envelope(&stored.to_envelope())?;
            }
            Ok(ApplyOutcome::Applied)
        }
        other => other,
    }
}

/// Rebuild a projection from scratch by replaying the whole store.
pub fn rebuild_from_scratch<P, S>(projection: &P, store: &S) -> Result<usize, ProjectionApplyError>
where
    P: EnvelopeProjection + ?Sized,
    S: EventStore + ?Sized,
{
    projection.reset()?;

    let mut applied = 0;
    for stored in store.load_all()? {
        if projection.apply_envelope(&stored.to_envelope())? == ApplyOutcome::Applied {
            applied += 1;
        }
    }

    info!(projection = projection.name(), applied, "projection rebuilt");
    Ok(applied)
}
