//! Disposable read-model storage.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::sync::Arc;

use thiserror::Error;

pub use memory::InMemoryReadModelStore;
#[cfg(feature = "postgres")]
pub use postgres::{PostgresConferenceStore, PostgresSpeakerStore};

/// Read-model storage failure. Always infrastructure: projections retry it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadModelError {
    #[error("read model store unavailable: {0}")]
    Unavailable(String),

    #[error("read model row is corrupt: {0}")]
    Corrupt(String),
}

/// Key/value store for one read model.
///
/// `upsert` replaces the row for `key`, which is what makes redelivery harmless.
/// `get` distinguishes "no row" (`Ok(None)`) from a failure.
pub trait ReadModelStore<K, V>: Send + Sync {
    fn upsert(&self, key: K, value: V) -> Result<(), ReadModelError>;
    fn get(&self, key: &K) -> Result<Option<V>, ReadModelError>;
    fn list_all(&self) -> Result<Vec<V>, ReadModelError>;
    /// Drop every row (rebuild support).
    fn clear(&self) -> Result<(), ReadModelError>;
}

impl<K, V, S> ReadModelStore<K, V> for Arc<S>
where
    S: ReadModelStore<K, V> + ?Sized,
{
    fn upsert(&self, key: K, value: V) -> Result<(), ReadModelError> {
        (**self).upsert(key, value)
    }

    fn get(&self, key: &K) -> Result<Option<V>, ReadModelError> {
        (**self).get(key)
    }

    fn list_all(&self) -> Result<Vec<V>, ReadModelError> {
        (**self).list_all()
    }

    fn clear(&self) -> Result<(), ReadModelError> {
        (**self).clear()
    }
}
