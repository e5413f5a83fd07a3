use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{ReadModelError, ReadModelStore};

/// In-memory store for tests/dev. `list_all` is ordered by key.
#[derive(Debug)]
pub struct InMemoryReadModelStore<K, V> {
    inner: RwLock<BTreeMap<K, V>>,
}

impl<K, V> InMemoryReadModelStore<K, V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<K, V> Default for InMemoryReadModelStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> ReadModelError {
    ReadModelError::Unavailable("lock poisoned".to_string())
}

impl<K, V> ReadModelStore<K, V> for InMemoryReadModelStore<K, V>
where
    K: Clone + Ord + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn upsert(&self, key: K, value: V) -> Result<(), ReadModelError> {
        self.inner.write().map_err(|_| poisoned())?.insert(key, value);
        Ok(())
    }

    fn get(&self, key: &K) -> Result<Option<V>, ReadModelError> {
        Ok(self.inner.read().map_err(|_| poisoned())?.get(key).cloned())
    }

    fn list_all(&self) -> Result<Vec<V>, ReadModelError> {
        Ok(self.inner.read().map_err(|_| poisoned())?.values().cloned().collect())
    }

    fn clear(&self) -> Result<(), ReadModelError> {
        self.inner.write().map_err(|_| poisoned())?.clear();
        Ok(())
    }
}
