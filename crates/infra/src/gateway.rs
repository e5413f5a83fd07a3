//! Async command gateway.
//!
//! Runs the synchronous dispatcher on tokio's blocking pool and bounds each
//! command with a timeout. A timeout tells the caller nothing about whether
//! the command took effect; the blocking task keeps running to completion.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::warn;

use tally_core::{Aggregate, AggregateId, DomainError};
use tally_events::{Command, EventBus, EventEnvelope};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::{EventStore, StoredEvent};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct CommandGateway<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
    timeout: Duration,
}

impl<S, B> Clone for CommandGateway<S, B> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            timeout: self.timeout,
        }
    }
}

impl<S, B> CommandGateway<S, B> {
    pub fn new(dispatcher: Arc<CommandDispatcher<S, B>>, timeout: Duration) -> Self {
        Self { dispatcher, timeout }
    }
}

impl<S, B> CommandGateway<S, B>
where
    S: EventStore + 'static,
    B: EventBus<EventEnvelope<JsonValue>> + 'static,
{
    /// Submit a command: `result | rejection | timeout`.
    pub async fn send<A>(&self, command: A::Command) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Id = AggregateId, Error = DomainError> + 'static,
        A::Command: Command,
        A::Event: tally_events::Event + Serialize + DeserializeOwned,
    {
        let aggregate_id = command.target_aggregate_id().clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let task = tokio::task::spawn_blocking(move || dispatcher.dispatch::<A>(command));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(DispatchError::Worker(join_err.to_string())),
            Err(_) => {
                warn!(
                    aggregate_id = %aggregate_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "command timed out"
                );
                Err(DispatchError::Timeout(self.timeout))
            }
        }
    }
}
