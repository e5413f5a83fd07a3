//! Command execution pipeline (application-level orchestration).
//!
//! ```text
//! Command
//!   ↓  acquire the per-aggregate lock
//! 1. Load + replay history (AggregateRepository)
//!   ↓
//! 2. Decide: aggregate.handle(command), no mutation
//!   ↓
//! 3. Append with ExpectedVersion::Exact(loaded version)
//!   ↓  on Concurrency: back to 1 (bounded), never re-append stale events
//! 4. Publish committed envelopes to the bus
//! ```
//!
//! A rejected command returns before step 3, so it leaves nothing behind.
//! This module contains no IO itself; it composes the store and bus traits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

use tally_core::{Aggregate, AggregateId, DomainError, ExpectedVersion};
use tally_events::{Command, EventBus, EventEnvelope, ReplayError};

use crate::event_store::{EventStore, EventStoreError, StoredEvent};
use crate::repository::{AggregateRepository, Loaded, RepositoryError};

pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Malformed input (blank fields, invalid ids).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Business rule violated for the aggregate's current state.
    #[error("command rejected: {0}")]
    Rejected(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Non-creation command for an identifier with no history.
    #[error("aggregate not found")]
    NotFound,

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency failure that outlived the retry budget.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// Historical events could not be decoded into the aggregate's event type.
    #[error("failed to deserialize history: {0}")]
    Deserialize(String),

    /// The stored history has a gap or regression.
    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error(transparent)]
    Store(EventStoreError),

    /// Publication failed after a successful append (events are durable).
    #[error("event publication failed: {0}")]
    Publish(String),

    /// The command did not finish in time; its effect is unknown.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// The blocking task running the command panicked or was cancelled.
    #[error("command worker failed: {0}")]
    Worker(String),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Store(other),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::Rejected(msg) => DispatchError::Rejected(msg),
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
            DomainError::NotFound => DispatchError::NotFound,
            DomainError::AlreadyExists(msg) => DispatchError::AlreadyExists(msg),
            DomainError::Conflict(msg) => DispatchError::Concurrency(msg),
        }
    }
}

impl From<RepositoryError> for DispatchError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Store(e) => e.into(),
            RepositoryError::Replay(e) => DispatchError::Replay(e),
            other @ (RepositoryError::AggregateTypeMismatch { .. } | RepositoryError::Deserialize { .. }) => {
                DispatchError::Deserialize(other.to_string())
            }
        }
    }
}

/// Per-identifier mutual exclusion.
///
/// At most one command per aggregate id is inside load/decide/append at a time;
/// different ids proceed in parallel. Idle slots are pruned on release.
#[derive(Debug, Default)]
pub struct AggregateLocks {
    slots: Mutex<HashMap<AggregateId, Arc<Mutex<()>>>>,
}

impl AggregateLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock<T>(&self, aggregate_id: &AggregateId, f: impl FnOnce() -> T) -> T {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(aggregate_id.clone()).or_default())
        };

        let result = {
            // The guarded value is `()`, so a poisoned slot carries no broken state.
            let _held = slot.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and this call still hold the slot: nobody is waiting.
        if Arc::strong_count(&slot) == 2 {
            slots.remove(aggregate_id);
        }
        result
    }

    /// Number of ids with a live slot (held or awaited).
    pub fn active(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// - `S`: event store
/// - `B`: event bus carrying JSON envelopes to projections
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    repository: AggregateRepository<S>,
    bus: B,
    locks: AggregateLocks,
    max_conflict_retries: u32,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self {
            repository: AggregateRepository::new(store),
            bus,
            locks: AggregateLocks::new(),
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn repository(&self) -> &AggregateRepository<S> {
        &self.repository
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Dispatch a command through the full event-sourcing pipeline.
    ///
    /// Returns the committed events (empty when the aggregate decided nothing).
    pub fn dispatch<A>(&self, command: A::Command) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Id = AggregateId, Error = DomainError>,
        A::Command: Command,
        A::Event: tally_events::Event + Serialize + DeserializeOwned,
    {
        let aggregate_id = command.target_aggregate_id().clone();
        self.locks
            .with_lock(&aggregate_id, || self.dispatch_locked::<A>(&aggregate_id, &command))
    }

    fn dispatch_locked<A>(
        &self,
        aggregate_id: &AggregateId,
        command: &A::Command,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Id = AggregateId, Error = DomainError>,
        A::Command: Command,
        A::Event: tally_events::Event + Serialize + DeserializeOwned,
    {
        let mut attempt = 0u32;
        loop {
            // 1) Load + replay
            let Loaded { aggregate, version } = match self.repository.load::<A>(aggregate_id) {
                Ok(loaded) => loaded,
                // Stream ids are shared across aggregate types: an id held by
                // another type is unknown for `A` and taken for creation.
                Err(RepositoryError::AggregateTypeMismatch { found, .. }) => {
                    debug!(
                        aggregate_id = %aggregate_id,
                        expected = A::AGGREGATE_TYPE,
                        found = %found,
                        "id belongs to another aggregate type"
                    );
                    return Err(if command.is_creation() {
                        DispatchError::AlreadyExists(format!(
                            "id {aggregate_id} is already used by a '{found}' stream"
                        ))
                    } else {
                        DispatchError::NotFound
                    });
                }
                Err(err) => return Err(err.into()),
            };
            if !aggregate.exists() && !command.is_creation() {
                return Err(DispatchError::NotFound);
            }

            // 2) Decide
            let decided = aggregate.handle(command).map_err(|err| {
                debug!(aggregate_id = %aggregate_id, error = %err, "command rejected");
                DispatchError::from(err)
            })?;
            if decided.is_empty() {
                return Ok(vec![]);
            }

            // 3) Append (optimistic)
            let committed = match self
                .repository
                .save::<A>(aggregate_id, ExpectedVersion::Exact(version), &decided)
            {
                Ok(committed) => committed,
                Err(err) if err.is_concurrency() && attempt < self.max_conflict_retries => {
                    attempt += 1;
                    warn!(
                        aggregate_id = %aggregate_id,
                        attempt,
                        error = %err,
                        "append conflict, reloading and re-validating"
                    );
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            info!(
                aggregate_id = %aggregate_id,
                aggregate_type = A::AGGREGATE_TYPE,
                events = committed.len(),
                version = version + committed.len() as u64,
                "command committed"
            );

            // 4) Publish (after append)
            for stored in &committed {
                self.bus
                    .publish(stored.to_envelope())
                    .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
            }

            return Ok(committed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use tally_conference::{Conference, ConferenceCommand, CreateConference};
    use tally_events::InMemoryEventBus;
    use tally_rental::{Bike, BikeCommand, RegisterBike, RequestBike};
    use uuid::Uuid;

    use super::*;
    use crate::event_store::{InMemoryEventStore, UncommittedEvent};

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

    fn bike_id() -> AggregateId {
        "B1".parse().unwrap()
    }

    fn register() -> BikeCommand {
        BikeCommand::RegisterBike(RegisterBike {
            bike_id: bike_id(),
            bike_type: "city".to_string(),
            location: "Paris".to_string(),
        })
    }

    fn request(renter: &str) -> BikeCommand {
        BikeCommand::RequestBike(RequestBike {
            bike_id: bike_id(),
            renter: renter.to_string(),
            rental_reference: Uuid::now_v7(),
        })
    }

    /// Store that lets another writer slip in ahead of the first append.
    struct RacingStore {
        inner: InMemoryEventStore,
        raced: AtomicBool,
        always: bool,
    }

    impl EventStore for RacingStore {
        fn append(
            &self,
            events: Vec<UncommittedEvent>,
            expected_version: ExpectedVersion,
        ) -> Result<Vec<StoredEvent>, EventStoreError> {
            if self.always || !self.raced.swap(true, Ordering::SeqCst) {
                return Err(EventStoreError::Concurrency("simulated race".to_string()));
            }
            self.inner.append(events, expected_version)
        }

        fn load_stream(&self, aggregate_id: &AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
            self.inner.load_stream(aggregate_id)
        }

        fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
            self.inner.load_all()
        }
    }

    #[test]
    fn non_creation_command_for_unknown_id_is_not_found() {
        let dispatcher = CommandDispatcher::new(InMemoryEventStore::new(), Bus::default());
        let err = dispatcher.dispatch::<Bike>(request("alice")).unwrap_err();
        assert!(matches!(err, DispatchError::NotFound));
    }

    #[test]
    fn rejection_appends_and_publishes_nothing() {
        let bus = Bus::default();
        let sub = bus.subscribe();
        let dispatcher = CommandDispatcher::new(InMemoryEventStore::new(), bus);

        dispatcher.dispatch::<Bike>(register()).unwrap();
        dispatcher.dispatch::<Bike>(request("alice")).unwrap();
        let before = dispatcher.repository().store().load_stream(&bike_id()).unwrap();

        let err = dispatcher.dispatch::<Bike>(request("bob")).unwrap_err();
        assert!(matches!(err, DispatchError::Rejected(ref m) if m.contains("already rented")));

        assert_eq!(dispatcher.repository().store().load_stream(&bike_id()).unwrap(), before);
        assert_eq!(sub.drain().len(), 2);
    }

    #[test]
    fn conflict_is_retried_after_reload() {
        let store = RacingStore {
            inner: InMemoryEventStore::new(),
            raced: AtomicBool::new(false),
            always: false,
        };
        let dispatcher = CommandDispatcher::new(store, Bus::default());

        let committed = dispatcher.dispatch::<Bike>(register()).unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].sequence_number, 1);
    }

    #[test]
    fn conflict_surfaces_once_retries_are_exhausted() {
        let store = RacingStore {
            inner: InMemoryEventStore::new(),
            raced: AtomicBool::new(false),
            always: true,
        };
        let dispatcher = CommandDispatcher::new(store, Bus::default()).with_max_conflict_retries(2);

        let err = dispatcher.dispatch::<Bike>(register()).unwrap_err();
        assert!(matches!(err, DispatchError::Concurrency(_)));
    }

    #[test]
    fn locks_are_released_after_dispatch() {
        let dispatcher = CommandDispatcher::new(InMemoryEventStore::new(), Bus::default());
        dispatcher.dispatch::<Bike>(register()).unwrap();
        assert_eq!(dispatcher.locks.active(), 0);
    }

    #[test]
    fn id_held_by_another_aggregate_type_is_unknown_for_commands_and_taken_for_creation() {
        let dispatcher = CommandDispatcher::new(InMemoryEventStore::new(), Bus::default());
        let shared: AggregateId = "c1".parse().unwrap();
        dispatcher
            .dispatch::<Conference>(ConferenceCommand::CreateConference(CreateConference {
                conference_id: shared.clone(),
                name: "RustConf".to_string(),
            }))
            .unwrap();

        let err = dispatcher
            .dispatch::<Bike>(BikeCommand::RequestBike(RequestBike {
                bike_id: shared.clone(),
                renter: "alice".to_string(),
                rental_reference: Uuid::now_v7(),
            }))
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound));

        let err = dispatcher
            .dispatch::<Bike>(BikeCommand::RegisterBike(RegisterBike {
                bike_id: shared.clone(),
                bike_type: "city".to_string(),
                location: "Paris".to_string(),
            }))
            .unwrap_err();
        assert!(matches!(err, DispatchError::AlreadyExists(ref m) if m.contains("c1")));

        assert_eq!(dispatcher.repository().store().load_stream(&shared).unwrap().len(), 1);
        assert_eq!(dispatcher.locks.active(), 0);
    }

    #[test]
    fn concurrent_requests_on_one_bike_commit_exactly_once() {
        const RENTERS: usize = 16;

        let dispatcher = Arc::new(CommandDispatcher::new(InMemoryEventStore::new(), Bus::default()));
        dispatcher.dispatch::<Bike>(register()).unwrap();

        let barrier = Arc::new(Barrier::new(RENTERS));
        let handles: Vec<_> = (0..RENTERS)
            .map(|i| {
                let dispatcher = Arc::clone(&dispatcher);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    dispatcher.dispatch::<Bike>(request(&format!("renter-{i}")))
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(DispatchError::Rejected(_))))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(rejected, RENTERS - 1);
        assert_eq!(dispatcher.repository().store().load_stream(&bike_id()).unwrap().len(), 2);
        assert_eq!(dispatcher.locks.active(), 0);
    }
}
