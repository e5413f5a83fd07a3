//! Background consumers of the event bus.

pub mod projection_worker;

pub use projection_worker::{ProjectionWorker, RetryPolicy, WorkerHandle};
