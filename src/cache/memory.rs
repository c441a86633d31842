use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::anyhow;

use super::{ArtifactStore, EntryKey, StoredEntry};
use crate::core::Hash32;

#[derive(Default)]
struct Inner {
    entries: HashMap<EntryKey, StoredEntry>,
    artifacts: HashMap<Hash32, Arc<[u8]>>,
}

/// Cache that lives only as long as the process. Clones share storage.
#[derive(Clone, Default)]
pub struct InMemoryCache(Arc<RwLock<Inner>>);

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct serialized values stored.
    pub fn artifact_count(&self) -> usize {
        self.0.read().map(|inner| inner.artifacts.len()).unwrap_or(0)
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory cache lock was poisoned")
}

impl ArtifactStore for InMemoryCache {
    fn read_entry(&self, key: &EntryKey) -> anyhow::Result<Option<StoredEntry>> {
        let inner = self.0.read().map_err(poisoned)?;
        Ok(inner.entries.get(key).cloned())
    }

    fn write_entry(&self, key: &EntryKey, entry: &StoredEntry) -> anyhow::Result<()> {
        let mut inner = self.0.write().map_err(poisoned)?;
        inner.entries.insert(key.clone(), entry.clone());
        Ok(())
    }

    fn read_artifact(&self, hash: Hash32) -> anyhow::Result<Option<Vec<u8>>> {
        let inner = self.0.read().map_err(poisoned)?;
        Ok(inner.artifacts.get(&hash).map(|bytes| bytes.to_vec()))
    }

    fn write_artifact(&self, hash: Hash32, bytes: &[u8]) -> anyhow::Result<()> {
        let mut inner = self.0.write().map_err(poisoned)?;
        inner.artifacts.entry(hash).or_insert_with(|| bytes.into());
        Ok(())
    }
}
