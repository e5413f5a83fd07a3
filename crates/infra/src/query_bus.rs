//! Query side: an explicit registry of named queries plus subscription
//! queries that push read-model updates to long-lived subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak, mpsc};

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, trace};

use tally_events::Subscription;

use crate::read_model::ReadModelError;

/// Result of a query.
///
/// `NotFound` is distinct from an empty `Many`.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResponse {
    Single(JsonValue),
    Many(Vec<JsonValue>),
    NotFound,
}

impl QueryResponse {
    pub fn single<T: Serialize>(value: &T) -> Result<Self, QueryError> {
        Ok(QueryResponse::Single(to_json(value)?))
    }

    pub fn many<'a, T, I>(values: I) -> Result<Self, QueryError>
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        values
            .into_iter()
            .map(to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(QueryResponse::Many)
    }

    pub fn from_option<T: Serialize>(value: Option<&T>) -> Result<Self, QueryError> {
        match value {
            Some(v) => Self::single(v),
            None => Ok(QueryResponse::NotFound),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<JsonValue, QueryError> {
    serde_json::to_value(value).map_err(|e| QueryError::Serialization(e.to_string()))
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no handler registered for query '{0}'")]
    UnknownQuery(String),

    #[error("invalid argument for query '{query}': {message}")]
    InvalidArgument { query: String, message: String },

    #[error("failed to serialize query result: {0}")]
    Serialization(String),

    #[error(transparent)]
    Store(#[from] ReadModelError),
}

impl QueryError {
    pub fn invalid_argument(query: &str, message: impl Into<String>) -> Self {
        QueryError::InvalidArgument {
            query: query.to_string(),
            message: message.into(),
        }
    }
}

/// Parse a JSON string argument (e.g. a bike id).
pub fn string_argument<'a>(query: &str, argument: &'a JsonValue) -> Result<&'a str, QueryError> {
    argument
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| QueryError::invalid_argument(query, "expected a non-empty string"))
}

type Handler = Box<dyn Fn(&JsonValue) -> Result<QueryResponse, QueryError> + Send + Sync>;

struct Subscriber {
    query_name: String,
    argument: JsonValue,
    tx: mpsc::Sender<JsonValue>,
    alive: Weak<()>,
}

impl Subscriber {
    fn is_alive(&self) -> bool {
        self.alive.strong_count() > 0
    }
}

/// Fan-out of read-model updates to subscription queries.
///
/// Projections call `emit` after a successful upsert; subscribers whose
/// registered argument satisfies the predicate receive the update.
#[derive(Default)]
pub struct QueryUpdateEmitter {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl core::fmt::Debug for QueryUpdateEmitter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueryUpdateEmitter")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl QueryUpdateEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, query_name: &str, argument: JsonValue) -> Subscription<JsonValue> {
        let (tx, rx) = mpsc::channel();
        let (subscription, alive) = Subscription::tracked(rx);
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subs.retain(Subscriber::is_alive);
        subs.push(Subscriber {
            query_name: query_name.to_string(),
            argument,
            tx,
            alive,
        });
        subscription
    }

    /// Push `update` to every live subscriber of `query_name` whose argument
    /// matches `predicate`. Returns how many received it.
    ///
    /// Dropped subscriptions of any query are forgotten on the way.
    pub fn emit<T, F>(&self, query_name: &str, predicate: F, update: &T) -> usize
    where
        T: Serialize,
        F: Fn(&JsonValue) -> bool,
    {
        let payload = match serde_json::to_value(update) {
            Ok(v) => v,
            Err(err) => {
                debug!(query = query_name, error = %err, "dropping unserializable query update");
                return 0;
            }
        };

        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut delivered = 0;
        subs.retain(|s| {
            if !s.is_alive() {
                return false;
            }
            if s.query_name != query_name || !predicate(&s.argument) {
                return true;
            }
            match s.tx.send(payload.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });

        trace!(query = query_name, delivered, "query update emitted");
        delivered
    }

    /// Number of subscriptions that have not been dropped.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.is_alive())
            .count()
    }
}

/// Registry `name -> handler`, built at startup.
pub struct QueryBus {
    handlers: HashMap<String, Handler>,
    emitter: Arc<QueryUpdateEmitter>,
}

impl core::fmt::Debug for QueryBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("QueryBus").field("queries", &names).finish()
    }
}

impl QueryBus {
    pub fn new(emitter: Arc<QueryUpdateEmitter>) -> Self {
        Self {
            handlers: HashMap::new(),
            emitter,
        }
    }

    pub fn emitter(&self) -> &Arc<QueryUpdateEmitter> {
        &self.emitter
    }

    /// Register (or replace) the handler for `name`.
    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&JsonValue) -> Result<QueryResponse, QueryError> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Box::new(handler));
    }

    pub fn query(&self, name: &str, argument: &JsonValue) -> Result<QueryResponse, QueryError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| QueryError::UnknownQuery(name.to_string()))?;
        handler(argument)
    }

    /// Subscription query: the current result plus a stream of later updates.
    ///
    /// The update channel is registered before the initial read so no change
    /// falls between the two; a subscriber may therefore see an update that is
    /// already reflected in the initial result.
    pub fn subscribe(
        &self,
        name: &str,
        argument: JsonValue,
    ) -> Result<(QueryResponse, Subscription<JsonValue>), QueryError> {
        if !self.handlers.contains_key(name) {
            return Err(QueryError::UnknownQuery(name.to_string()));
        }
        let updates = self.emitter.register(name, argument.clone());
        let initial = self.query(name, &argument)?;
        Ok((initial, updates))
    }
}
