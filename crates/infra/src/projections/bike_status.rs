use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use tally_core::{Aggregate, AggregateId};
use tally_events::{ApplyOutcome, EventEnvelope};
use tally_rental::{Bike, BikeEvent, RentalStatus};

use super::{EnvelopeProjection, InMemoryCursorStore, ProjectionApplyError, ProjectionCursorStore, Tracked};
use crate::query_bus::{QueryBus, QueryError, QueryResponse, QueryUpdateEmitter, string_argument};
use crate::read_model::{ReadModelError, ReadModelStore};

pub const FIND_ALL: &str = "findAll";
pub const FIND_ONE: &str = "findOne";
pub const FIND_AVAILABLE: &str = "findAvailable";

/// Queryable bike read model: one row per bike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BikeStatus {
    pub bike_id: AggregateId,
    pub bike_type: String,
    pub location: String,
    pub renter: Option<String>,
    pub status: RentalStatus,
}

impl BikeStatus {
    pub fn description(&self) -> String {
        let renter = self.renter.as_deref().unwrap_or("unknown");
        match self.status {
            RentalStatus::Rented => {
                format!("Bike {} was rented by {} in {}", self.bike_id, renter, self.location)
            }
            RentalStatus::Available => {
                format!("Bike {} is available for rental in {}.", self.bike_id, self.location)
            }
            RentalStatus::Requested => {
                format!("Bike {} is requested by {} in {}", self.bike_id, renter, self.location)
            }
        }
    }

    fn requested_by(&mut self, renter: &str) {
        self.renter = Some(renter.to_string());
        self.status = RentalStatus::Requested;
    }

    fn rented_by(&mut self, renter: &str) {
        self.renter = Some(renter.to_string());
        self.status = RentalStatus::Rented;
    }

    fn returned_at(&mut self, location: &str) {
        self.location = location.to_string();
        self.renter = None;
        self.status = RentalStatus::Available;
    }
}

/// The row as served to callers: the stored fields plus `description`.
#[derive(Debug, Serialize)]
struct BikeStatusView<'a> {
    #[serde(flatten)]
    status: &'a BikeStatus,
    description: String,
}

impl<'a> From<&'a BikeStatus> for BikeStatusView<'a> {
    fn from(status: &'a BikeStatus) -> Self {
        Self {
            status,
            description: status.description(),
        }
    }
}

/// Bike status projection (`rental.bike` streams).
///
/// Every change is pushed to `findAll` subscribers and to `findOne`
/// subscribers watching that bike.
pub struct BikeStatusProjection<S>
where
    S: ReadModelStore<AggregateId, BikeStatus>,
{
    store: S,
    cursors: Arc<dyn ProjectionCursorStore>,
    emitter: Option<Arc<QueryUpdateEmitter>>,
    gate: Mutex<()>,
}

impl<S> BikeStatusProjection<S>
where
    S: ReadModelStore<AggregateId, BikeStatus>,
{
    pub const NAME: &'static str = "rental.bike_status";

    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: Arc::new(InMemoryCursorStore::new()),
            emitter: None,
            gate: Mutex::new(()),
        }
    }

    pub fn with_cursor_store(mut self, cursors: Arc<dyn ProjectionCursorStore>) -> Self {
        self.cursors = cursors;
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<QueryUpdateEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn get(&self, bike_id: &AggregateId) -> Result<Option<BikeStatus>, ReadModelError> {
        self.store.get(bike_id)
    }

    pub fn list(&self) -> Result<Vec<BikeStatus>, ReadModelError> {
        self.store.list_all()
    }

    /// Available bikes, optionally of one type.
    pub fn available(&self, bike_type: Option<&str>) -> Result<Vec<BikeStatus>, ReadModelError> {
        Ok(self
            .store
            .list_all()?
            .into_iter()
            .filter(|b| b.status == RentalStatus::Available)
            .filter(|b| bike_type.map_or(true, |t| b.bike_type == t))
            .collect())
    }

    fn existing(&self, bike_id: &AggregateId) -> Result<BikeStatus, ReadModelError> {
        self.store
            .get(bike_id)?
            .ok_or_else(|| ReadModelError::Corrupt(format!("no bike status row for {bike_id}")))
    }

    fn write(&self, envelope: &EventEnvelope<BikeEvent>) -> Result<(), ReadModelError> {
        let bike_id = envelope.aggregate_id();

        let updated = match envelope.payload() {
            BikeEvent::BikeRegistered(e) => BikeStatus {
                bike_id: bike_id.clone(),
                bike_type: e.bike_type.clone(),
                location: e.location.clone(),
                renter: None,
                status: RentalStatus::Available,
            },
            BikeEvent::BikeRequested(e) => {
                let mut row = self.existing(bike_id)?;
                row.requested_by(&e.renter);
                row
            }
            BikeEvent::BikeInUse(e) => {
                let mut row = self.existing(bike_id)?;
                row.rented_by(&e.renter);
                row
            }
            BikeEvent::RequestRejected(_) => {
                let mut row = self.existing(bike_id)?;
                let location = row.location.clone();
                row.returned_at(&location);
                row
            }
            BikeEvent::BikeReturned(e) => {
                let mut row = self.existing(bike_id)?;
                row.returned_at(&e.location);
                row
            }
        };

        self.store.upsert(bike_id.clone(), updated.clone())?;

        if let Some(emitter) = &self.emitter {
            let view = BikeStatusView::from(&updated);
            emitter.emit(FIND_ALL, |_| true, &view);
            emitter.emit(FIND_ONE, |arg| arg.as_str() == Some(bike_id.as_str()), &view);
        }
        Ok(())
    }
}

impl<S> BikeStatusProjection<S>
where
    S: ReadModelStore<AggregateId, BikeStatus> + 'static,
{
    /// Register `findAll`, `findOne` (bike id) and `findAvailable` (optional
    /// bike type) on the query bus.
    pub fn register_queries(self: &Arc<Self>, bus: &mut QueryBus) {
        let this = Arc::clone(self);
        bus.register(FIND_ALL, move |_| {
            let rows = this.list()?;
            let views: Vec<_> = rows.iter().map(BikeStatusView::from).collect();
            QueryResponse::many(&views)
        });

        let this = Arc::clone(self);
        bus.register(FIND_ONE, move |arg| {
            let bike_id: AggregateId = string_argument(FIND_ONE, arg)?
                .parse()
                .map_err(|e| QueryError::invalid_argument(FIND_ONE, format!("{e}")))?;
            let row = this.get(&bike_id)?;
            QueryResponse::from_option(row.as_ref().map(BikeStatusView::from).as_ref())
        });

        let this = Arc::clone(self);
        bus.register(FIND_AVAILABLE, move |arg| {
            let bike_type = match arg {
                JsonValue::Null => None,
                other => Some(string_argument(FIND_AVAILABLE, other)?),
            };
            let rows = this.available(bike_type)?;
            let views: Vec<_> = rows.iter().map(BikeStatusView::from).collect();
            QueryResponse::many(&views)
        });
    }
}

impl<S> EnvelopeProjection for BikeStatusProjection<S>
where
    S: ReadModelStore<AggregateId, BikeStatus>,
{
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<ApplyOutcome, ProjectionApplyError> {
        Tracked {
            name: Self::NAME,
            aggregate_type: Bike::AGGREGATE_TYPE,
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
