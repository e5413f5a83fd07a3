//! Infrastructure wiring: event store, bus, projections, worker and gateway.
//!
//! Query and command handlers run synchronously over stores that may block
//! (Postgres), so both are moved onto tokio's blocking pool from here.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::info;

use tally_conference::Conference;
use tally_core::AggregateId;
use tally_events::{EventEnvelope, InMemoryEventBus, Subscription};
use tally_infra::command_dispatcher::{CommandDispatcher, DispatchError};
use tally_infra::event_store::{EventStore, StoredEvent};
use tally_infra::gateway::CommandGateway;
use tally_infra::projections::{
    apply_with_catch_up, rebuild_from_scratch, BikeStatus, BikeStatusProjection, ConferenceProjection, ConferenceRow,
    ConferenceSpeaker, EnvelopeProjection, ProjectionApplyError, ProjectionCursorStore, SpeakerProjection,
};
use tally_infra::query_bus::{QueryBus, QueryError, QueryResponse, QueryUpdateEmitter};
use tally_infra::read_model::{InMemoryReadModelStore, ReadModelError, ReadModelStore};
use tally_infra::workers::{ProjectionWorker, RetryPolicy, WorkerHandle};
use tally_rental::Bike;

use crate::config::Config;

type Store = Arc<dyn EventStore>;
type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
type ConferenceStore = Arc<dyn ReadModelStore<AggregateId, ConferenceRow>>;
type SpeakerStore = Arc<dyn ReadModelStore<String, ConferenceSpeaker>>;

pub struct AppServices {
    gateway: CommandGateway<Store, Bus>,
    queries: Arc<QueryBus>,
    _worker: WorkerHandle,
}

impl AppServices {
    pub async fn send_bike(&self, command: tally_rental::BikeCommand) -> Result<Vec<StoredEvent>, DispatchError> {
        self.gateway.send::<Bike>(command).await
    }

    pub async fn send_conference(
        &self,
        command: tally_conference::ConferenceCommand,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        self.gateway.send::<Conference>(command).await
    }

    pub async fn query(&self, name: &'static str, argument: JsonValue) -> Result<QueryResponse, QueryError> {
        let queries = Arc::clone(&self.queries);
        tokio::task::spawn_blocking(move || queries.query(name, &argument))
            .await
            .map_err(join_failed)?
    }

    pub async fn subscribe(
        &self,
        name: &'static str,
        argument: JsonValue,
    ) -> Result<(QueryResponse, Subscription<JsonValue>), QueryError> {
        let queries = Arc::clone(&self.queries);
        tokio::task::spawn_blocking(move || queries.subscribe(name, argument))
            .await
            .map_err(join_failed)?
    }
}

fn join_failed(err: tokio::task::JoinError) -> QueryError {
    QueryError::Store(ReadModelError::Unavailable(format!("query task failed: {err}")))
}

struct Backends {
    store: Store,
    conferences: ConferenceStore,
    speakers: SpeakerStore,
    cursors: Arc<dyn ProjectionCursorStore>,
}

#[cfg(not(feature = "postgres"))]
async fn backends(_config: &Config) -> anyhow::Result<Backends> {
    use tally_infra::event_store::InMemoryEventStore;
    use tally_infra::projections::InMemoryCursorStore;

    Ok(Backends {
        store: Arc::new(InMemoryEventStore::new()),
        conferences: Arc::new(InMemoryReadModelStore::<AggregateId, ConferenceRow>::new()),
        speakers: Arc::new(InMemoryReadModelStore::<String, ConferenceSpeaker>::new()),
        cursors: Arc::new(InMemoryCursorStore::new()),
    })
}

#[cfg(feature = "postgres")]
async fn backends(config: &Config) -> anyhow::Result<Backends> {
    use anyhow::Context;
    use tally_infra::event_store::PostgresEventStore;
    use tally_infra::projections::PostgresCursorStore;
    use tally_infra::read_model::{PostgresConferenceStore, PostgresSpeakerStore};

    let pool = sqlx::PgPool::connect(&config.database_url)
        .await
        .context("failed to connect to DATABASE_URL")?;
    let store = PostgresEventStore::new(pool.clone());
    store.migrate().await.context("failed to apply event store schema")?;

    Ok(Backends {
        store: Arc::new(store),
        conferences: Arc::new(PostgresConferenceStore::new(pool.clone())),
        speakers: Arc::new(PostgresSpeakerStore::new(pool.clone())),
        cursors: Arc::new(PostgresCursorStore::new(pool)),
    })
}

pub async fn build_services(config: &Config) -> anyhow::Result<AppServices> {
    let Backends {
        store,
        conferences,
        speakers,
        cursors,
    } = backends(config).await?;
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let emitter = Arc::new(QueryUpdateEmitter::new());

    // Bike rows always live in memory, so their cursors must too.
    let bikes = Arc::new(
        BikeStatusProjection::new(Arc::new(InMemoryReadModelStore::<AggregateId, BikeStatus>::new()))
            .with_emitter(Arc::clone(&emitter)),
    );
    let conferences = Arc::new(ConferenceProjection::new(conferences).with_cursor_store(Arc::clone(&cursors)));
    let speakers = Arc::new(SpeakerProjection::new(speakers).with_cursor_store(cursors));

    let mut queries = QueryBus::new(emitter);
    bikes.register_queries(&mut queries);
    conferences.register_queries(&mut queries);
    speakers.register_queries(&mut queries);

    let projections: Vec<Arc<dyn EnvelopeProjection>> = vec![bikes as Arc<dyn EnvelopeProjection>, conferences, speakers];

    // Read models are disposable: rebuild them from the store before serving.
    let projections = {
        let store = Arc::clone(&store);
        tokio::task::spawn_blocking(move || {
            for projection in &projections {
                let applied = rebuild_from_scratch(projection.as_ref(), &*store)?;
                info!(projection = projection.name(), applied, "read model ready");
            }
            Ok::<_, ProjectionApplyError>(projections)
        })
        .await??
    };

    let worker = {
        let store = Arc::clone(&store);
        ProjectionWorker::spawn("projections", &bus, RetryPolicy::default(), move |env: &EventEnvelope<JsonValue>| {
            for projection in &projections {
                apply_with_catch_up(projection.as_ref(), &*store, env)?;
            }
            Ok::<_, ProjectionApplyError>(())
        })?
    };

    let dispatcher = CommandDispatcher::new(store, bus).with_max_conflict_retries(config.conflict_retries);
    let gateway = CommandGateway::new(Arc::new(dispatcher), config.command_timeout);

    Ok(AppServices {
        gateway,
        queries: Arc::new(queries),
        _worker: worker,
    })
}
