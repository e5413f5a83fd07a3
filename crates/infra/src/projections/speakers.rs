use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use tally_conference::{Conference, ConferenceEvent};
use tally_core::{Aggregate, AggregateId};
use tally_events::{ApplyOutcome, EventEnvelope};

use super::{EnvelopeProjection, InMemoryCursorStore, ProjectionApplyError, ProjectionCursorStore, Tracked};
use crate::query_bus::{QueryBus, QueryResponse};
use crate::read_model::{ReadModelError, ReadModelStore};

pub const ALL_SPEAKERS: &str = "allSpeakers";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConferenceSpeaker {
    pub id: String,
    pub conference_id: AggregateId,
    pub conference_name: String,
    pub speaker_name: String,
}

/// Row key for a speaker: stable across redeliveries and rebuilds.
pub fn speaker_row_id(conference_id: &AggregateId, speaker: &str) -> String {
    format!("{conference_id}::{speaker}")
}

/// Speaker directory across all conferences.
pub struct SpeakerProjection<S>
where
    S: ReadModelStore<String, ConferenceSpeaker>,
{
    store: S,
    cursors: Arc<dyn ProjectionCursorStore>,
    gate: Mutex<()>,
}

impl<S> SpeakerProjection<S>
where
    S: ReadModelStore<String, ConferenceSpeaker>,
{
    pub const NAME: &'static str = "conference.speakers";

    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: Arc::new(InMemoryCursorStore::new()),
            gate: Mutex::new(()),
        }
    }

    pub fn with_cursor_store(mut self, cursors: Arc<dyn ProjectionCursorStore>) -> Self {
        self.cursors = cursors;
        self
    }

    pub fn list(&self) -> Result<Vec<ConferenceSpeaker>, ReadModelError> {
        self.store.list_all()
    }

    fn write(&self, envelope: &EventEnvelope<ConferenceEvent>) -> Result<(), ReadModelError> {
        let ConferenceEvent::SpeakerAnnounced(e) = envelope.payload() else {
            return Ok(());
        };
        let id = speaker_row_id(&e.conference_id, &e.speaker);
        self.store.upsert(
            id.clone(),
            ConferenceSpeaker {
                id,
                conference_id: e.conference_id.clone(),
                conference_name: e.conference_name.clone(),
                speaker_name: e.speaker.clone(),
            },
        )
    }
}

impl<S> SpeakerProjection<S>
where
    S: ReadModelStore<String, ConferenceSpeaker> + 'static,
{
    pub fn register_queries(self: &Arc<Self>, bus: &mut QueryBus) {
        let this = Arc::clone(self);
        bus.register(ALL_SPEAKERS, move |_| QueryResponse::many(&this.list()?));
    }
}

impl<S> EnvelopeProjection for SpeakerProjection<S>
where
    S: ReadModelStore<String, ConferenceSpeaker>,
{
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<ApplyOutcome, ProjectionApplyError> {
        Tracked {
            name: Self::NAME,
            aggregate_type: Conference::AGGREGATE_TYPE,
            cursors: &*self.cursors,
            gate: &self.gate,
        }
        .apply(envelope, |typed| self.write(typed))
    }

    fn reset(&self) -> Result<(), ProjectionApplyError> {
        let _gate = self.gate.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.store.clear()?;
        self.cursors.clear_cursors(Self::NAME)?;
        Ok(())
    }
}
