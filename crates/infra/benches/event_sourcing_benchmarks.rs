use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use tally_core::{Aggregate, AggregateId, ExpectedVersion};
use tally_events::{EventEnvelope, InMemoryEventBus};
use tally_infra::command_dispatcher::CommandDispatcher;
use tally_infra::event_store::{EventStore, InMemoryEventStore, UncommittedEvent};
use tally_infra::projections::{BikeStatus, BikeStatusProjection, rebuild_from_scratch};
use tally_infra::read_model::InMemoryReadModelStore;
use tally_rental::{
    ApproveRequest, Bike, BikeCommand, BikeEvent, BikeInUse, BikeRegistered, BikeRequested, BikeReturned,
    RegisterBike, RequestBike, ReturnBike,
};

type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

fn dispatcher() -> CommandDispatcher<InMemoryEventStore, Bus> {
    CommandDispatcher::new(InMemoryEventStore::new(), Bus::default())
}

fn register(bike_id: &AggregateId) -> BikeCommand {
    BikeCommand::RegisterBike(RegisterBike {
        bike_id: bike_id.clone(),
        bike_type: "city".into(),
        location: "Paris".into(),
    })
}

/// One full rental cycle as events: request, approve, return.
fn rental_cycle(bike_id: &AggregateId) -> Vec<BikeEvent> {
    vec![
        BikeEvent::BikeRequested(BikeRequested {
            bike_id: bike_id.clone(),
            renter: "alice".into(),
            rental_reference: Uuid::now_v7(),
        }),
        BikeEvent::BikeInUse(BikeInUse {
            bike_id: bike_id.clone(),
            renter: "alice".into(),
        }),
        BikeEvent::BikeReturned(BikeReturned {
            bike_id: bike_id.clone(),
            location: "Paris".into(),
        }),
    ]
}

fn uncommitted(bike_id: &AggregateId, events: &[BikeEvent]) -> Vec<UncommittedEvent> {
    events
        .iter()
        .map(|e| UncommittedEvent::from_typed(bike_id.clone(), Bike::AGGREGATE_TYPE, Uuid::now_v7(), e).unwrap())
        .collect()
}

/// A store holding `bikes` streams, each registered and rented `cycles` times.
fn seeded_store(bikes: usize, cycles: usize) -> InMemoryEventStore {
    let store = InMemoryEventStore::new();
    for n in 0..bikes {
        let bike_id: AggregateId = format!("bike-{n}").parse().unwrap();
        let mut events = vec![BikeEvent::BikeRegistered(BikeRegistered {
            bike_id: bike_id.clone(),
            bike_type: "city".into(),
            location: "Paris".into(),
        })];
        for _ in 0..cycles {
            events.extend(rental_cycle(&bike_id));
        }
        store
            .append(uncommitted(&bike_id, &events), ExpectedVersion::Exact(0))
            .unwrap();
    }
    store
}

fn bench_command_execution_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_execution_latency");

    group.bench_function("register_bike_fresh", |b| {
        let dispatcher = dispatcher();
        b.iter(|| {
            let bike_id = AggregateId::new();
            black_box(dispatcher.dispatch::<Bike>(register(&bike_id)).unwrap());
        });
    });

    group.bench_function("rental_cycle_with_history", |b| {
        let dispatcher = dispatcher();
        let bike_id: AggregateId = "bench-bike".parse().unwrap();
        dispatcher.dispatch::<Bike>(register(&bike_id)).unwrap();

        b.iter(|| {
            for command in [
                BikeCommand::RequestBike(RequestBike {
                    bike_id: bike_id.clone(),
                    renter: "alice".into(),
                    rental_reference: Uuid::now_v7(),
                }),
                BikeCommand::ApproveRequest(ApproveRequest {
                    bike_id: bike_id.clone(),
                    renter: "alice".into(),
                }),
                BikeCommand::ReturnBike(ReturnBike {
                    bike_id: bike_id.clone(),
                    location: "Paris".into(),
                }),
            ] {
                black_box(dispatcher.dispatch::<Bike>(command).unwrap());
            }
        });
    });

    group.finish();
}

fn bench_event_append_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_append_throughput");

    for cycles in [1usize, 10, 100] {
        group.throughput(Throughput::Elements((cycles * 3) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(cycles * 3), &cycles, |b, &cycles| {
            let bike_id: AggregateId = "bench-bike".parse().unwrap();
            let events: Vec<BikeEvent> = (0..cycles).flat_map(|_| rental_cycle(&bike_id)).collect();
            b.iter(|| {
                let store = InMemoryEventStore::new();
                black_box(store.append(uncommitted(&bike_id, &events), ExpectedVersion::Any).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_projection_rebuild_speed(c: &mut Criterion) {
    let mut group = c.benchmark_group("projection_rebuild_speed");

    for bikes in [10usize, 100, 1000] {
        let store = seeded_store(bikes, 3);
        let event_count = store.load_all().unwrap().len();
        group.throughput(Throughput::Elements(event_count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(event_count), &store, |b, store| {
            b.iter(|| {
                let projection = BikeStatusProjection::new(InMemoryReadModelStore::<AggregateId, BikeStatus>::new());
                black_box(rebuild_from_scratch(&projection, store).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_command_execution_latency,
    bench_event_append_throughput,
    bench_projection_rebuild_speed
);
criterion_main!(benches);
