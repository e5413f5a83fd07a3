use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use tally_conference::{Conference, ConferenceEvent};
use tally_core::{Aggregate, AggregateId};
use tally_events::{ApplyOutcome, EventEnvelope};

use super::{EnvelopeProjection, InMemoryCursorStore, ProjectionApplyError, ProjectionCursorStore, Tracked};
use crate::query_bus::{QueryBus, QueryResponse};
use crate::read_model::{ReadModelError, ReadModelStore};

pub const ALL_CONFERENCES: &str = "allConferences";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConferenceRow {
    pub id: AggregateId,
    pub name: String,
}

/// Conference directory: one row per created conference.
pub struct ConferenceProjection<S>
where
    S: ReadModelStore<AggregateId, ConferenceRow>,
{
    store: S,
    cursors: Arc<dyn ProjectionCursorStore>,
    gate: Mutex<()>,
}

impl<S> ConferenceProjection<S>
where
    S: ReadModelStore<AggregateId, ConferenceRow>,
{
    pub const NAME: &'static str = "conference.directory";

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

    pub fn list(&self) -> Result<Vec<ConferenceRow>, ReadModelError> {
        self.store.list_all()
    }

    fn write(&self, envelope: &EventEnvelope<ConferenceEvent>) -> Result<(), ReadModelError> {
        match envelope.payload() {
            ConferenceEvent::ConferenceCreated(e) => self.store.upsert(
                e.conference_id.clone(),
                ConferenceRow {
                    id: e.conference_id.clone(),
                    name: e.name.clone(),
                },
            ),
            // Speakers have their own read model.
            ConferenceEvent::SpeakerAnnounced(_) => Ok(()),
        }
    }
}

impl<S> ConferenceProjection<S>
where
    S: ReadModelStore<AggregateId, ConferenceRow> + 'static,
{
    pub fn register_queries(self: &Arc<Self>, bus: &mut QueryBus) {
        let this = Arc::clone(self);
        bus.register(ALL_CONFERENCES, move |_| QueryResponse::many(&this.list()?));
    }
}

impl<S> EnvelopeProjection for ConferenceProjection<S>
where
    S: ReadModelStore<AggregateId, ConferenceRow>,
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
