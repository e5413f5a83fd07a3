use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use tally_events::{EventBus, Subscription};

/// Backoff applied when a handler fails on a message.
///
/// The failing message is retried (never skipped) with the delay doubling from
/// `initial` up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Subscription-driven consumer running on its own thread.
///
/// The handler must tolerate redelivery. When spawned inside a tokio runtime
/// the worker thread enters that runtime so Postgres-backed read models can
/// bridge into it.
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    pub fn spawn<M, B, H, E>(name: &'static str, bus: &B, retry: RetryPolicy, mut handler: H) -> std::io::Result<WorkerHandle>
    where
        M: Send + 'static,
        B: EventBus<M> + ?Sized,
        H: FnMut(&M) -> Result<(), E> + Send + 'static,
        E: core::fmt::Display,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub: Subscription<M> = bus.subscribe();
        let runtime = tokio::runtime::Handle::try_current().ok();

        let join = thread::Builder::new().name(name.to_string()).spawn(move || {
            let _guard = runtime.as_ref().map(tokio::runtime::Handle::enter);
            worker_loop(name, &sub, &shutdown_rx, retry, &mut handler);
        })?;

        info!(worker = name, "projection worker started");
        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn worker_loop<M, H, E>(
    name: &'static str,
    sub: &Subscription<M>,
    shutdown_rx: &mpsc::Receiver<()>,
    retry: RetryPolicy,
    handler: &mut H,
) where
    H: FnMut(&M) -> Result<(), E>,
    E: core::fmt::Display,
{
    let tick = Duration::from_millis(250);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let msg = match sub.recv_timeout(tick) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let mut delay = retry.initial;
        let mut attempt = 1u32;
        while let Err(err) = handler(&msg) {
            warn!(worker = name, attempt, error = %err, retry_in_ms = delay.as_millis() as u64, "projection handler failed");
            // Sleeping on the shutdown channel keeps the backoff interruptible.
            match shutdown_rx.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => {
                    debug!(worker = name, "shutdown during retry");
                    return;
                }
            }
            delay = retry.next(delay);
            attempt += 1;
        }
    }

    debug!(worker = name, "projection worker stopped");
}
