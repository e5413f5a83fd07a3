//! Explicit aggregate repository: `load(id) -> replay(events) -> state` and
//! `save(id, expected_version, events)`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use tally_core::{Aggregate, AggregateId, ExpectedVersion};
use tally_events::{ReplayError, replay};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

/// A rehydrated aggregate and the stream version it was rebuilt from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loaded<A> {
    pub aggregate: A,
    pub version: u64,
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error("stream {aggregate_id} holds '{found}' events, expected '{expected}'")]
    AggregateTypeMismatch {
        aggregate_id: AggregateId,
        expected: &'static str,
        found: String,
    },

    #[error("failed to deserialize {aggregate_id}#{sequence_number}: {message}")]
    Deserialize {
        aggregate_id: AggregateId,
        sequence_number: u64,
        message: String,
    },

    #[error(transparent)]
    Replay(#[from] ReplayError),
}

#[derive(Debug, Clone)]
pub struct AggregateRepository<S> {
    store: S,
}

impl<S> AggregateRepository<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S> AggregateRepository<S>
where
    S: EventStore,
{
    /// Rebuild `A` from its full history.
    ///
    /// An unknown id yields `A::empty(id)` at version 0; callers decide whether
    /// that is a not-found or a creation.
    pub fn load<A>(&self, aggregate_id: &AggregateId) -> Result<Loaded<A>, RepositoryError>
    where
        A: Aggregate<Id = AggregateId>,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(aggregate_id)?;

        let mut envelopes = Vec::with_capacity(history.len());
        for stored in &history {
            if stored.aggregate_type != A::AGGREGATE_TYPE {
                return Err(RepositoryError::AggregateTypeMismatch {
                    aggregate_id: aggregate_id.clone(),
                    expected: A::AGGREGATE_TYPE,
                    found: stored.aggregate_type.clone(),
                });
            }
            let envelope = stored
                .to_envelope()
                .decode::<A::Event>()
                .map_err(|e| RepositoryError::Deserialize {
                    aggregate_id: aggregate_id.clone(),
                    sequence_number: stored.sequence_number,
                    message: e.to_string(),
                })?;
            envelopes.push(envelope);
        }

        let mut aggregate = A::empty(aggregate_id.clone());
        replay(&mut aggregate, &envelopes)?;
        let version = aggregate.version();

        debug!(aggregate_id = %aggregate_id, aggregate_type = A::AGGREGATE_TYPE, version, "aggregate loaded");
        Ok(Loaded { aggregate, version })
    }

    /// Append freshly decided events, guarded by `expected_version`.
    pub fn save<A>(
        &self,
        aggregate_id: &AggregateId,
        expected_version: ExpectedVersion,
        events: &[A::Event],
    ) -> Result<Vec<StoredEvent>, EventStoreError>
    where
        A: Aggregate<Id = AggregateId>,
        A::Event: tally_events::Event + Serialize,
    {
        let uncommitted = events
            .iter()
            .map(|ev| UncommittedEvent::from_typed(aggregate_id.clone(), A::AGGREGATE_TYPE, Uuid::now_v7(), ev))
            .collect::<Result<Vec<_>, _>>()?;

        self.store.append(uncommitted, expected_version)
    }
}
