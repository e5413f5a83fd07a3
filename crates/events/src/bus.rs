//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus distributes events **after** they have been appended to the event
//! store. It is not a source of truth: a consumer that misses or fails an event
//! can always reload it from the store.
//!
//! Delivery is **at-least-once**. Consumers (projections, workers) must treat a
//! redelivered envelope as a no-op.

use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A subscription to a message stream.
///
/// Each subscription receives its own copy of every message published after it
/// was created, in publication order.
///
/// ```ignore
/// let subscription = bus.subscribe();
/// loop {
///     match subscription.recv_timeout(Duration::from_millis(250)) {
///         Ok(envelope) => projection.apply_envelope(&envelope)?,
///         Err(RecvTimeoutError::Timeout) => continue,
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
    liveness: Option<Arc<()>>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self {
            receiver,
            liveness: None,
        }
    }

    /// A subscription whose producer can tell when it has been dropped.
    ///
    /// The returned handle stops upgrading once the subscription is gone, so a
    /// producer can forget it without first having to send to it.
    pub fn tracked(receiver: Receiver<M>) -> (Self, Weak<()>) {
        let liveness = Arc::new(());
        let handle = Arc::downgrade(&liveness);
        (
            Self {
                receiver,
                liveness: Some(liveness),
            },
            handle,
        )
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything that is currently buffered.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Transport-agnostic pub/sub contract.
///
/// ```text
/// Command → Event Store (append) → Event Bus (publish) → Projections / workers
/// ```
///
/// `publish()` may fail; since events are already persisted at that point the
/// caller may republish, and consumers will see the duplicate as a no-op.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
