//! End-to-end pipeline tests:
//! command → event store → bus → projection worker → read model → query bus.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value as JsonValue, json};
use uuid::Uuid;

use tally_conference::{AnnounceSpeaker, Conference, ConferenceCommand, CreateConference};
use tally_core::AggregateId;
use tally_events::{EventBus, EventEnvelope, InMemoryEventBus};
use tally_rental::{ApproveRequest, Bike, BikeCommand, RegisterBike, RequestBike, ReturnBike};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::{EventStore, InMemoryEventStore};
use crate::projections::bike_status::{FIND_ALL, FIND_AVAILABLE, FIND_ONE};
use crate::projections::conferences::ALL_CONFERENCES;
use crate::projections::speakers::ALL_SPEAKERS;
use crate::projections::{
    apply_with_catch_up, rebuild_from_scratch, BikeStatus, BikeStatusProjection, ConferenceProjection,
    ConferenceRow, ConferenceSpeaker, EnvelopeProjection, SpeakerProjection,
};
use crate::query_bus::{QueryBus, QueryResponse, QueryUpdateEmitter};
use crate::read_model::InMemoryReadModelStore;
use crate::workers::{ProjectionWorker, RetryPolicy, WorkerHandle};

type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
type Store = Arc<InMemoryEventStore>;
type Bikes = BikeStatusProjection<Arc<InMemoryReadModelStore<AggregateId, BikeStatus>>>;

struct Harness {
    store: Store,
    bus: Bus,
    dispatcher: CommandDispatcher<Store, Bus>,
    bikes: Arc<Bikes>,
    queries: QueryBus,
    worker: Option<WorkerHandle>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}

fn setup() -> Harness {
    let store: Store = Arc::new(InMemoryEventStore::new());
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let emitter = Arc::new(QueryUpdateEmitter::new());

    let bikes: Arc<Bikes> = Arc::new(BikeStatusProjection::new(Arc::new(InMemoryReadModelStore::new())).with_emitter(Arc::clone(&emitter)));
    let conferences = Arc::new(ConferenceProjection::new(Arc::new(InMemoryReadModelStore::<AggregateId, ConferenceRow>::new())));
    let speakers = Arc::new(SpeakerProjection::new(Arc::new(InMemoryReadModelStore::<String, ConferenceSpeaker>::new())));

    let mut queries = QueryBus::new(emitter);
    bikes.register_queries(&mut queries);
    conferences.register_queries(&mut queries);
    speakers.register_queries(&mut queries);

    let projections: Vec<Arc<dyn EnvelopeProjection>> = vec![bikes.clone() as Arc<dyn EnvelopeProjection>, conferences, speakers];
    let catch_up_store = Arc::clone(&store);
    // Subscribed before any command is dispatched, so nothing is missed.
    let worker = ProjectionWorker::spawn("test-projections", &bus, RetryPolicy::default(), move |env: &EventEnvelope<JsonValue>| {
        for projection in &projections {
            apply_with_catch_up(projection.as_ref(), &*catch_up_store, env)?;
        }
        Ok::<_, crate::projections::ProjectionApplyError>(())
    })
    .unwrap();

    Harness {
        dispatcher: CommandDispatcher::new(Arc::clone(&store), Arc::clone(&bus)),
        store,
        bus,
        bikes,
        queries,
        worker: Some(worker),
    }
}

/// Poll until the worker has caught up with `cond`.
fn wait_for_processing(mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("projection did not catch up in time");
}

fn id(raw: &str) -> AggregateId {
    raw.parse().unwrap()
}

fn register(h: &Harness, bike: &str, location: &str) {
    h.dispatcher
        .dispatch::<Bike>(BikeCommand::RegisterBike(RegisterBike {
            bike_id: id(bike),
            bike_type: "city".into(),
            location: location.into(),
        }))
        .unwrap();
}

fn request(h: &Harness, bike: &str, renter: &str) -> Result<(), DispatchError> {
    h.dispatcher
        .dispatch::<Bike>(BikeCommand::RequestBike(RequestBike {
            bike_id: id(bike),
            renter: renter.into(),
            rental_reference: Uuid::now_v7(),
        }))
        .map(|_| ())
}

fn status_of(h: &Harness, bike: &str) -> Option<String> {
    match h.queries.query(FIND_ONE, &json!(bike)).unwrap() {
        QueryResponse::Single(row) => row["status"].as_str().map(str::to_string),
        _ => None,
    }
}

#[test]
fn bike_rental_flow_updates_the_read_model() {
    let h = setup();
    register(&h, "B1", "Paris");
    wait_for_processing(|| status_of(&h, "B1").as_deref() == Some("AVAILABLE"));

    request(&h, "B1", "alice").unwrap();
    wait_for_processing(|| status_of(&h, "B1").as_deref() == Some("REQUESTED"));

    h.dispatcher
        .dispatch::<Bike>(BikeCommand::ApproveRequest(ApproveRequest {
            bike_id: id("B1"),
            renter: "alice".into(),
        }))
        .unwrap();
    wait_for_processing(|| status_of(&h, "B1").as_deref() == Some("RENTED"));

    let err = request(&h, "B1", "bob").unwrap_err();
    assert!(matches!(err, DispatchError::Rejected(_)));

    let QueryResponse::Single(row) = h.queries.query(FIND_ONE, &json!("B1")).unwrap() else {
        panic!("B1 should be found");
    };
    assert_eq!(row["renter"], json!("alice"));
    assert_eq!(row["description"], json!("Bike B1 was rented by alice in Paris"));
    assert_eq!(h.queries.query(FIND_AVAILABLE, &JsonValue::Null).unwrap(), QueryResponse::Many(vec![]));
    assert_eq!(h.queries.query(FIND_ONE, &json!("B9")).unwrap(), QueryResponse::NotFound);
}

#[test]
fn command_for_unknown_bike_is_not_found() {
    let h = setup();
    assert!(matches!(request(&h, "ghost", "alice"), Err(DispatchError::NotFound)));
    assert!(h.store.load_all().unwrap().is_empty());
}

#[test]
fn subscription_query_receives_later_changes() {
    let h = setup();
    register(&h, "B1", "Paris");
    wait_for_processing(|| status_of(&h, "B1").is_some());

    let (initial, updates) = h.queries.subscribe(FIND_ONE, json!("B1")).unwrap();
    assert!(matches!(initial, QueryResponse::Single(_)));

    request(&h, "B1", "alice").unwrap();
    let update = updates.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(update["status"], json!("REQUESTED"));
    assert_eq!(update["bike_id"], json!("B1"));
}

#[test]
fn conference_and_speakers_are_listed_once() {
    let h = setup();
    h.dispatcher
        .dispatch::<Conference>(ConferenceCommand::CreateConference(CreateConference {
            conference_id: id("c1"),
            name: "QCon".into(),
        }))
        .unwrap();

    let announce = || {
        h.dispatcher.dispatch::<Conference>(ConferenceCommand::AnnounceSpeaker(AnnounceSpeaker {
            conference_id: id("c1"),
            speaker: "Ada".into(),
        }))
    };
    announce().unwrap();
    assert!(matches!(announce(), Err(DispatchError::Rejected(_))));

    let count = |name: &str| match h.queries.query(name, &JsonValue::Null).unwrap() {
        QueryResponse::Many(rows) => rows.len(),
        _ => 0,
    };
    wait_for_processing(|| count(ALL_SPEAKERS) == 1);
    assert_eq!(count(ALL_CONFERENCES), 1);

    let QueryResponse::Many(speakers) = h.queries.query(ALL_SPEAKERS, &JsonValue::Null).unwrap() else {
        panic!("expected a list");
    };
    assert_eq!(speakers[0]["conference_name"], json!("QCon"));
    assert_eq!(speakers[0]["speaker_name"], json!("Ada"));
}

#[test]
fn redelivered_events_leave_read_models_unchanged() {
    let h = setup();
    register(&h, "B1", "Paris");
    request(&h, "B1", "alice").unwrap();
    wait_for_processing(|| status_of(&h, "B1").as_deref() == Some("REQUESTED"));
    let before = h.queries.query(FIND_ALL, &JsonValue::Null).unwrap();

    for stored in h.store.load_all().unwrap() {
        h.bus.publish(stored.to_envelope()).unwrap();
    }
    // A fresh bike acts as a barrier: once it shows up, the redeliveries ahead
    // of it have been handled.
    register(&h, "B2", "Lyon");
    wait_for_processing(|| status_of(&h, "B2").is_some());

    let QueryResponse::Many(after) = h.queries.query(FIND_ALL, &JsonValue::Null).unwrap() else {
        panic!("expected a list");
    };
    let QueryResponse::Many(before) = before else {
        panic!("expected a list");
    };
    assert_eq!(after.len(), 2);
    assert!(after.contains(&before[0]));
}

#[test]
fn rebuild_reproduces_the_live_read_model() {
    let h = setup();
    register(&h, "B1", "Paris");
    register(&h, "B2", "Lyon");
    request(&h, "B2", "bob").unwrap();
    h.dispatcher
        .dispatch::<Bike>(BikeCommand::ApproveRequest(ApproveRequest {
            bike_id: id("B2"),
            renter: "bob".into(),
        }))
        .unwrap();
    h.dispatcher
        .dispatch::<Bike>(BikeCommand::ReturnBike(ReturnBike {
            bike_id: id("B2"),
            location: "Nice".into(),
        }))
        .unwrap();
    wait_for_processing(|| {
        h.bikes
            .get(&id("B2"))
            .unwrap()
            .is_some_and(|b| b.location == "Nice")
    });
    let live = h.bikes.list().unwrap();

    let fresh: Bikes = BikeStatusProjection::new(Arc::new(InMemoryReadModelStore::new()));
    let applied = rebuild_from_scratch(&fresh, &*h.store).unwrap();
    assert_eq!(applied, 5);
    assert_eq!(fresh.list().unwrap(), live);

    // Rebuilding in place is deterministic too.
    rebuild_from_scratch(h.bikes.as_ref(), &*h.store).unwrap();
    assert_eq!(h.bikes.list().unwrap(), live);
}

#[test]
fn gap_is_filled_from_the_event_store() {
    let h = setup();
    register(&h, "B1", "Paris");
    request(&h, "B1", "alice").unwrap();

    // A consumer that only ever saw the second event.
    let late: Bikes = BikeStatusProjection::new(Arc::new(InMemoryReadModelStore::new()));
    let second = h.store.load_stream(&id("B1")).unwrap()[1].to_envelope();
    apply_with_catch_up(&late, &*h.store, &second).unwrap();

    let row = late.get(&id("B1")).unwrap().unwrap();
    assert_eq!(row.renter.as_deref(), Some("alice"));
    assert_eq!(row.location, "Paris");
}
