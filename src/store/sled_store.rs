//! Sled-backed store - one tree per namespace

use std::path::Path;

use tracing::debug;

use super::KvStore;
use crate::error::Result;

/// On-disk store backed by sled
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open (or create) a store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "Opened sled store");
        Ok(Self { db })
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl KvStore for SledStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let tree = self.db.open_tree(namespace)?;
        Ok(tree.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        let tree = self.db.open_tree(namespace)?;
        tree.insert(key.as_bytes(), value)?;
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let tree = self.db.open_tree(namespace)?;
        tree.remove(key.as_bytes())?;
        Ok(())
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let tree = self.db.open_tree(namespace)?;
        let mut keys = Vec::new();
        for item in tree.iter() {
            let (k, _) = item?;
            keys.push(String::from_utf8_lossy(&k).into_owned());
        }
        Ok(keys)
    }
}
