//! Persisted key-value storage
//!
//! Everything the engine keeps across restarts (backend preference lists,
//! backoff entries, name cache, optimistic heads, user settings) goes through
//! the [`KvStore`] trait, keyed by `(namespace, key)`.
//!
//! - [`MemoryStore`]: process-lifetime, used in tests and ephemeral sessions
//! - [`SledStore`]: embedded on-disk store

mod sled_store;

pub use sled_store::SledStore;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Namespaced byte store
pub trait KvStore: Send + Sync {
    /// Read a value
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a value, replacing any previous one
    fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a value (no-op when absent)
    fn delete(&self, namespace: &str, key: &str) -> Result<()>;

    /// List keys of a namespace
    fn keys(&self, namespace: &str) -> Result<Vec<String>>;
}

/// Typed JSON access on top of any [`KvStore`]
pub trait KvStoreExt: KvStore {
    fn get_json<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Result<Option<T>> {
        match self.get(namespace, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize>(&self, namespace: &str, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(namespace, key, &bytes)
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<(String, String), Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values across all namespaces
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .get(&(namespace.to_string(), key.to_string()))
            .map(|v| v.value().clone()))
    }

    fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .insert((namespace.to_string(), key.to_string()), value.to_vec());
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        self.entries.remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| e.key().1.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
