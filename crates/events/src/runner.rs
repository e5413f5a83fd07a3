//! Projection runner utilities (read model builders).
//!
//! Read models are **disposable**; events are the source of truth.
//! The runner keeps one cursor per aggregate stream so that redelivered
//! envelopes are skipped and gaps are surfaced instead of being folded in.
//! Ordering across different aggregates is not assumed.

use std::collections::HashMap;

use thiserror::Error;
use tracing::trace;

use tally_core::AggregateId;

use crate::{EventEnvelope, Projection};

/// What happened to an envelope handed to [`ProjectionRunner::apply`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already seen (sequence <= cursor); the read model was not touched.
    Duplicate,
    /// Not a stream type the consumer cares about.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    #[error("sequence number 0 is not a valid stream position for {aggregate_id}")]
    NonMonotonicSequence {
        aggregate_id: AggregateId,
        last: u64,
        found: u64,
    },

    #[error("sequence gap for {aggregate_id}: expected {expected}, found {found}")]
    SequenceGap {
        aggregate_id: AggregateId,
        expected: u64,
        found: u64,
    },
}

/// Classify `found` against a per-stream cursor.
///
/// Shared by the runner and the persisted-cursor projections in `tally-infra`.
pub fn check_sequence(
    aggregate_id: &AggregateId,
    last: u64,
    found: u64,
) -> Result<ApplyOutcome, ProjectionError> {
    if found == 0 {
        return Err(ProjectionError::NonMonotonicSequence {
            aggregate_id: aggregate_id.clone(),
            last,
            found,
        });
    }
    if found <= last {
        return Ok(ApplyOutcome::Duplicate);
    }
    if found != last + 1 {
        return Err(ProjectionError::SequenceGap {
            aggregate_id: aggregate_id.clone(),
            expected: last + 1,
            found,
        });
    }
    Ok(ApplyOutcome::Applied)
}

/// Runs envelopes through a projection and tracks per-aggregate progress.
#[derive(Debug)]
pub struct ProjectionRunner<P>
where
    P: Projection,
{
    projection: P,
    cursors: HashMap<AggregateId, u64>,
}

impl<P> ProjectionRunner<P>
where
    P: Projection,
{
    pub fn new(projection: P) -> Self {
        Self {
            projection,
            cursors: HashMap::new(),
        }
    }

    pub fn projection(&self) -> &P {
        &self.projection
    }

    /// Last applied sequence number for a stream (0 if nothing applied yet).
    pub fn cursor(&self, aggregate_id: &AggregateId) -> u64 {
        self.cursors.get(aggregate_id).copied().unwrap_or(0)
    }

    /// Apply a single envelope, skipping duplicates and rejecting gaps.
    pub fn apply(&mut self, envelope: &EventEnvelope<P::Ev>) -> Result<ApplyOutcome, ProjectionError> {
        let id = envelope.aggregate_id();
        let found = envelope.sequence_number();
        let last = self.cursor(id);

        let outcome = check_sequence(id, last, found)?;
        match outcome {
            ApplyOutcome::Duplicate => {
                trace!(aggregate_id = %id, sequence = found, "skipping redelivered envelope");
            }
            ApplyOutcome::Applied => {
                self.projection.apply(envelope);
                self.cursors.insert(id.clone(), found);
            }
            ApplyOutcome::Ignored => {}
        }
        Ok(outcome)
    }

    /// Apply many envelopes in order.
    pub fn run<'a>(
        &mut self,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope<P::Ev>>,
    ) -> Result<(), ProjectionError>
    where
        P::Ev: 'a,
    {
        for env in envelopes {
            self.apply(env)?;
        }
        Ok(())
    }

    /// Rebuild a projection from scratch by replaying the full event history.
    pub fn rebuild_from_scratch<'a>(
        factory: impl FnOnce() -> P,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope<P::Ev>>,
    ) -> Result<Self, ProjectionError>
    where
        P::Ev: 'a,
    {
        let mut runner = ProjectionRunner::new(factory());
        runner.run(envelopes)?;
        Ok(runner)
    }
}
