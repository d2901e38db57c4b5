//! Datastore interface: a key-value store with optimistic concurrency.
//!
//! Persisted objects carry an index (version) stamped by the store. Atomic
//! writes and deletes compare the caller's index against the stored one and
//! fail with [`StoreError::KeyModified`] when another writer got there first;
//! callers recover by re-reading.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

/// Errors surfaced by datastore operations. `Clone` so CAS outcomes can be
/// stored and replayed by the init guards.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The stored index no longer matches the caller's; re-read and retry.
    #[error("key was modified by another writer")]
    KeyModified,
    /// No value under the key.
    #[error("key not found")]
    KeyNotFound,
    /// The backend itself failed.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Value bytes could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// An object that can live in the datastore.
pub trait KvObject: Send + Sync {
    /// Path components of the object's key.
    fn key(&self) -> Vec<String>;

    /// Serialized value to persist.
    fn value(&self) -> Result<Vec<u8>, StoreError>;

    /// Apply a value read back from the store.
    fn set_value(&self, value: &[u8]) -> Result<(), StoreError>;

    /// Last index observed from the store.
    fn index(&self) -> u64;

    /// Record the index stamped by a successful read or write. Implementations
    /// also mark the object as existing.
    fn set_index(&self, index: u64);

    /// Whether the object has been through the store at least once.
    fn exists(&self) -> bool;

    /// Objects that opt out of persistence.
    fn skip(&self) -> bool {
        false
    }

    /// Scope of the object's key space.
    fn data_scope(&self) -> &'static str {
        "global"
    }
}

/// A key-value store with CAS write semantics.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Read the value under `key` into `out` (set_value + set_index).
    async fn get_object(&self, key: &[String], out: &dyn KvObject) -> Result<(), StoreError>;

    /// Write `obj` if its index still matches the stored one (or the key is
    /// absent for a never-persisted object). Stamps the new index on success.
    async fn put_object_atomic(&self, obj: &dyn KvObject) -> Result<(), StoreError>;

    /// Delete `obj` if its index still matches the stored one.
    async fn delete_object_atomic(&self, obj: &dyn KvObject) -> Result<(), StoreError>;
}

/// Flatten key path components into the canonical slash-joined form.
pub(crate) fn key_path(key: &[String]) -> String {
    key.join("/")
}
