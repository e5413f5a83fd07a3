use tally_core::AggregateId;

/// A command targets exactly one aggregate instance.
///
/// Commands represent **intent**. They are transient (never persisted) and are
/// either rejected or turned into events by the aggregate they target.
///
/// Only creation commands may target an identifier that has no history yet;
/// infrastructure answers any other command for an unknown identifier with
/// "not found" before the aggregate is consulted.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_aggregate_id(&self) -> &AggregateId;

    /// Whether this command is allowed to bring a new identifier into existence.
    fn is_creation(&self) -> bool {
        false
    }
}
