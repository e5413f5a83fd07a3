use thiserror::Error;

use tally_core::{Aggregate, AggregateId};

use crate::EventEnvelope;

/// Execute an aggregate command deterministically (no IO, no async).
///
/// Decides with `handle` and then folds each emitted event with `apply`. A
/// rejection leaves the aggregate untouched.
///
/// For the persisted pipeline use `CommandDispatcher::dispatch()` in `tally-infra`.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("envelope belongs to stream {found}, expected {expected}")]
    WrongStream { expected: AggregateId, found: AggregateId },

    #[error("sequence gap while replaying {aggregate_id}: expected {expected}, found {found}")]
    SequenceGap {
        aggregate_id: AggregateId,
        expected: u64,
        found: u64,
    },
}

/// Fold a stream history into `aggregate`, oldest first.
///
/// Each envelope must carry exactly `version() + 1`. Gaps, regressions and
/// duplicates are rejected rather than silently skipped; aggregate state is a
/// strict fold and must never see events out of order.
pub fn replay<'a, A>(
    aggregate: &mut A,
    envelopes: impl IntoIterator<Item = &'a EventEnvelope<A::Event>>,
) -> Result<(), ReplayError>
where
    A: Aggregate<Id = AggregateId>,
    A::Event: 'a,
{
    for env in envelopes {
        if env.aggregate_id() != aggregate.id() {
            return Err(ReplayError::WrongStream {
                expected: aggregate.id().clone(),
                found: env.aggregate_id().clone(),
            });
        }

        let expected = aggregate.version() + 1;
        if env.sequence_number() != expected {
            return Err(ReplayError::SequenceGap {
                aggregate_id: aggregate.id().clone(),
                expected,
                found: env.sequence_number(),
            });
        }

        aggregate.apply(env.payload());
    }
    Ok(())
}
