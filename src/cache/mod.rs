//! Persistent storage for entity values and their provenance.
//!
//! The engine talks to storage through a [`CacheGateway`], which hands out one
//! [`CacheAccessor`] per [`Query`]. Any [`ArtifactStore`] is a gateway: values
//! are stored once per content hash, and a small entry records which value a
//! given query last produced and under which provenance.

mod local;
mod memory;

use std::fmt;
use std::hash::Hash;
use std::ops::Index;
use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, Dynamic, Hash32};
use crate::engine::provenance::Provenance;
use crate::key::{KeySpace, TaskKey};
use crate::protocol::Protocol;

pub use local::LocalCache;
pub use memory::InMemoryCache;

/// Everything needed to find, validate, and decode one stored value.
#[derive(Clone)]
pub struct Query {
    pub task_key: TaskKey,
    pub protocol: Arc<dyn Protocol>,
    pub provenance: Provenance,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("task_key", &self.task_key)
            .field("protocol", &self.protocol.name())
            .field("provenance", &self.provenance)
            .finish()
    }
}

/// A value together with the query that produced it.
#[derive(Clone, Debug)]
pub struct EntityResult {
    pub query: Query,
    pub value: Dynamic,
}

impl EntityResult {
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

/// All results of one derivation, in task order.
#[derive(Clone, Debug)]
pub struct ResultGroup {
    pub results: Vec<EntityResult>,
    pub key_space: KeySpace,
}

impl ResultGroup {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EntityResult> {
        self.results.iter()
    }
}

impl Index<usize> for ResultGroup {
    type Output = EntityResult;

    fn index(&self, index: usize) -> &Self::Output {
        &self.results[index]
    }
}

impl<'a> IntoIterator for &'a ResultGroup {
    type Item = &'a EntityResult;
    type IntoIter = std::slice::Iter<'a, EntityResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}

/// Handle on the stored state of a single query.
pub trait CacheAccessor: Send + Sync {
    fn query(&self) -> &Query;

    /// Whether a value matching the query's functional hash is stored.
    fn can_load(&self) -> anyhow::Result<bool>;

    fn load_result(&self) -> anyhow::Result<EntityResult>;

    fn load_result_value_hash(&self) -> anyhow::Result<Hash32>;

    /// Provenance recorded the last time this value was saved or updated.
    fn load_provenance(&self) -> anyhow::Result<Option<Provenance>>;

    /// Record the query's provenance against the already stored value.
    fn update_provenance(&self) -> anyhow::Result<()>;

    fn save_result(&self, result: &EntityResult) -> anyhow::Result<()>;
}

pub trait CacheGateway: Send + Sync {
    fn get_accessor(&self, query: Query) -> Box<dyn CacheAccessor>;
}

/// Address of a stored entry: the entity it belongs to and a digest of the
/// task key and functional hash.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub entity: String,
    pub digest: Hash32,
}

impl EntryKey {
    fn for_query(query: &Query) -> Self {
        let mut hasher = Blake3Hasher::default();
        query.task_key.hash(&mut hasher);
        query.provenance.functional_hash.hash(&mut hasher);

        Self {
            entity: query.task_key.dnode.to_string(),
            digest: Hash32::from(hasher),
        }
    }
}

/// Metadata stored for each entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub task_key: String,
    pub provenance: Provenance,
    pub value_hash: Hash32,
}

/// Raw storage backing a gateway.
pub trait ArtifactStore: Clone + Send + Sync + 'static {
    fn read_entry(&self, key: &EntryKey) -> anyhow::Result<Option<StoredEntry>>;

    fn write_entry(&self, key: &EntryKey, entry: &StoredEntry) -> anyhow::Result<()>;

    fn read_artifact(&self, hash: Hash32) -> anyhow::Result<Option<Vec<u8>>>;

    /// Store bytes under their content hash. Writing the same bytes twice is
    /// a no-op.
    fn write_artifact(&self, hash: Hash32, bytes: &[u8]) -> anyhow::Result<()>;
}

impl<S: ArtifactStore> CacheGateway for S {
    fn get_accessor(&self, query: Query) -> Box<dyn CacheAccessor> {
        Box::new(StoreAccessor {
            key: EntryKey::for_query(&query),
            store: self.clone(),
            query,
        })
    }
}

struct StoreAccessor<S> {
    store: S,
    key: EntryKey,
    query: Query,
}

impl<S: ArtifactStore> StoreAccessor<S> {
    fn entry(&self) -> anyhow::Result<StoredEntry> {
        self.store
            .read_entry(&self.key)?
            .ok_or_else(|| anyhow!("no cached entry for {}", self.query.task_key))
    }
}

impl<S: ArtifactStore> CacheAccessor for StoreAccessor<S> {
    fn query(&self) -> &Query {
        &self.query
    }

    fn can_load(&self) -> anyhow::Result<bool> {
        match self.store.read_entry(&self.key)? {
            Some(entry) => Ok(self.store.read_artifact(entry.value_hash)?.is_some()),
            None => Ok(false),
        }
    }

    fn load_result(&self) -> anyhow::Result<EntityResult> {
        let entry = self.entry()?;
        let bytes = self.store.read_artifact(entry.value_hash)?.ok_or_else(|| {
            anyhow!(
                "artifact {} for {} is missing",
                entry.value_hash,
                self.query.task_key
            )
        })?;

        Ok(EntityResult {
            query: self.query.clone(),
            value: self.query.protocol.decode(&bytes)?,
        })
    }

    fn load_result_value_hash(&self) -> anyhow::Result<Hash32> {
        Ok(self.entry()?.value_hash)
    }

    fn load_provenance(&self) -> anyhow::Result<Option<Provenance>> {
        Ok(self.store.read_entry(&self.key)?.map(|entry| entry.provenance))
    }

    fn update_provenance(&self) -> anyhow::Result<()> {
        let mut entry = self.entry()?;
        entry.provenance = self.query.provenance.clone();
        self.store.write_entry(&self.key, &entry)
    }

    fn save_result(&self, result: &EntityResult) -> anyhow::Result<()> {
        let bytes = self.query.protocol.encode(&result.value)?;
        let value_hash = Hash32::hash(&bytes);

        self.store.write_artifact(value_hash, &bytes)?;
        self.store.write_entry(
            &self.key,
            &StoredEntry {
                task_key: self.query.task_key.to_string(),
                provenance: self.query.provenance.clone(),
                value_hash,
            },
        )
    }
}

/// A shareable handle on some cache gateway. This is the value type of the
/// `core__persistent_cache` bootstrap entity.
#[derive(Clone)]
pub struct PersistentCache(Arc<dyn CacheGateway>);

impl PersistentCache {
    pub fn new(gateway: impl CacheGateway + 'static) -> Self {
        Self(Arc::new(gateway))
    }

    pub fn get_accessor(&self, query: Query) -> Box<dyn CacheAccessor> {
        self.0.get_accessor(query)
    }
}

impl fmt::Debug for PersistentCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PersistentCache")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::provenance::{CodeFingerprint, CodeVersion, Computation};
    use crate::key::CaseKey;
    use crate::protocol::Cbor;

    pub(crate) fn query(entity: &str, code: &str) -> Query {
        let case_key = CaseKey::single("x", "1");
        let provenance = Provenance::from_computation(Computation {
            code_fingerprint: &CodeFingerprint {
                version: CodeVersion::new("1"),
                bytecode_hash: Hash32::hash(code),
            },
            case_key: &case_key,
            dep_digests: &[],
            treat_bytecode_as_functional: false,
            can_functionally_change_per_run: false,
            flow_instance_id: uuid::Uuid::nil(),
        });

        Query {
            task_key: TaskKey::new(entity, case_key),
            protocol: Cbor::<i64>::shared(),
            provenance,
        }
    }

    pub(crate) fn exercise_store(cache: impl CacheGateway) {
        let accessor = cache.get_accessor(query("x", "v1"));
        assert!(!accessor.can_load().unwrap());
        assert!(accessor.load_provenance().unwrap().is_none());

        let result = EntityResult {
            query: accessor.query().clone(),
            value: Arc::new(41i64),
        };
        accessor.save_result(&result).unwrap();

        assert!(accessor.can_load().unwrap());
        let loaded = accessor.load_result().unwrap();
        assert_eq!(loaded.downcast_ref::<i64>(), Some(&41));

        let expected_hash = Hash32::hash(Cbor::<i64>::new().encode(&result.value).unwrap());
        assert_eq!(accessor.load_result_value_hash().unwrap(), expected_hash);

        // Only the bytecode changed, so the functional hash and therefore the
        // entry are shared.
        let edited = cache.get_accessor(query("x", "v2"));
        assert!(edited.can_load().unwrap());
        let stored = edited.load_provenance().unwrap().unwrap();
        assert_eq!(stored, accessor.query().provenance);

        edited.update_provenance().unwrap();
        let stored = accessor.load_provenance().unwrap().unwrap();
        assert_eq!(stored, edited.query().provenance);

        assert!(!cache.get_accessor(query("y", "v1")).can_load().unwrap());
    }

    #[test]
    fn test_missing_entry_is_an_error() {
        let cache = InMemoryCache::new();
        let accessor = cache.get_accessor(query("x", "v1"));

        assert!(accessor.load_result().is_err());
        assert!(accessor.update_provenance().is_err());
    }

    #[test]
    fn test_persistent_cache_forwards() {
        let cache = PersistentCache::new(InMemoryCache::new());
        let accessor = cache.get_accessor(query("x", "v1"));
        assert_eq!(accessor.query().task_key.to_string(), "x(x=1)");
    }
}
