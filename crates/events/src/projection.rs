use crate::{Event, EventEnvelope};

/// A projection builds a read model from an append-only event stream.
///
/// Projections are pure event consumers: they never reject and never raise
/// domain errors. Delivery is at-least-once, so `apply` must be idempotent
/// (upserts keyed by aggregate id or another deterministic key).
///
/// Read models are disposable and can be rebuilt by replaying the store. Use
/// [`crate::ProjectionRunner`] to get per-aggregate ordering checks and
/// duplicate suppression on top of a plain projection.
pub trait Projection {
    type Ev: Event;

    /// Apply a single event to the read model.
    fn apply(&mut self, envelope: &EventEnvelope<Self::Ev>);
}
