// In-memory datastore with per-key CAS semantics.
//
// Suitable for tests and single-host deployments. Index stamping matches the
// distributed backends: a fresh key starts at 1 and every successful write
// bumps it by one.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{key_path, Datastore, KvObject, StoreError};

#[derive(Debug, Clone)]
struct StoredValue {
    index: u64,
    value: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any value is stored under the key (test visibility).
    pub fn contains(&self, key: &[String]) -> bool {
        self.entries.contains_key(&key_path(key))
    }
}

#[async_trait]
impl Datastore for MemoryStore {
    async fn get_object(&self, key: &[String], out: &dyn KvObject) -> Result<(), StoreError> {
        let stored = match self.entries.get(&key_path(key)) {
            Some(entry) => entry.value().clone(),
            None => return Err(StoreError::KeyNotFound),
        };
        out.set_value(&stored.value)?;
        out.set_index(stored.index);
        Ok(())
    }

    async fn put_object_atomic(&self, obj: &dyn KvObject) -> Result<(), StoreError> {
        if obj.skip() {
            return Ok(());
        }
        let value = obj.value()?;

        match self.entries.entry(key_path(&obj.key())) {
            Entry::Vacant(slot) => {
                if obj.exists() {
                    // The caller saw a value that has since been deleted.
                    return Err(StoreError::KeyModified);
                }
                slot.insert(StoredValue { index: 1, value });
                obj.set_index(1);
            }
            Entry::Occupied(mut slot) => {
                if !obj.exists() || slot.get().index != obj.index() {
                    return Err(StoreError::KeyModified);
                }
                let index = slot.get().index + 1;
                slot.insert(StoredValue { index, value });
                obj.set_index(index);
            }
        }
        Ok(())
    }

    async fn delete_object_atomic(&self, obj: &dyn KvObject) -> Result<(), StoreError> {
        match self.entries.entry(key_path(&obj.key())) {
            Entry::Vacant(_) => Err(StoreError::KeyNotFound),
            Entry::Occupied(slot) => {
                if slot.get().index != obj.index() {
                    return Err(StoreError::KeyModified);
                }
                slot.remove();
                Ok(())
            }
        }
    }
}
