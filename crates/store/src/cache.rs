//! Indexed local cache. One [`Writer`] (owned by the informer's dispatch loop)
//! and any number of cloned [`Store`] readers share the same map.

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rekon_core::{ObjectKey, Resource};
use rustc_hash::FxHashMap;
use tracing::debug;

pub const NAMESPACE_INDEX: &str = "namespace";

/// Maps an object to the index values it should be found under.
pub type IndexFn<K> = Arc<dyn Fn(&K) -> Vec<String> + Send + Sync>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("unknown index: {0}")]
    UnknownIndex(String),
    #[error("index {0} must be registered before the store is populated")]
    IndexAfterPopulate(String),
}

type Postings = FxHashMap<String, BTreeSet<ObjectKey>>;

struct Inner<K> {
    items: FxHashMap<ObjectKey, Arc<K>>,
    indexers: FxHashMap<String, IndexFn<K>>,
    indices: FxHashMap<String, Postings>,
}

impl<K> Inner<K> {
    fn unindex(&mut self, key: &ObjectKey, obj: &K) {
        for (name, f) in self.indexers.iter() {
            let Some(postings) = self.indices.get_mut(name) else { continue };
            for value in f(obj) {
                if let Some(set) = postings.get_mut(&value) {
                    set.remove(key);
                    if set.is_empty() {
                        postings.remove(&value);
                    }
                }
            }
        }
    }

    fn index(&mut self, key: &ObjectKey, obj: &K) {
        for (name, f) in self.indexers.iter() {
            let postings = self.indices.entry(name.clone()).or_default();
            for value in f(obj) {
                postings.entry(value).or_default().insert(key.clone());
            }
        }
    }
}

fn shared<K>() -> Arc<RwLock<Inner<K>>> {
    Arc::new(RwLock::new(Inner {
        items: FxHashMap::default(),
        indexers: FxHashMap::default(),
        indices: FxHashMap::default(),
    }))
}

/// Read-only handle. Cheap to clone; reflects the latest write of the [`Writer`].
pub struct Store<K> {
    inner: Arc<RwLock<Inner<K>>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<K: Resource> Store<K> {
    fn read(&self) -> RwLockReadGuard<'_, Inner<K>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.read().items.get(key).cloned()
    }

    pub fn contains_key(&self, key: &ObjectKey) -> bool {
        self.read().items.contains_key(key)
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.read().items.values().cloned().collect()
    }

    /// Keys in sorted order.
    pub fn list_keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.read().items.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys filed under `value` in index `index`, sorted.
    pub fn index_keys(&self, index: &str, value: &str) -> Result<Vec<ObjectKey>, StoreError> {
        let inner = self.read();
        if !inner.indexers.contains_key(index) {
            return Err(StoreError::UnknownIndex(index.to_string()));
        }
        Ok(inner
            .indices
            .get(index)
            .and_then(|p| p.get(value))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn by_index(&self, index: &str, value: &str) -> Result<Vec<Arc<K>>, StoreError> {
        let keys = self.index_keys(index, value)?;
        let inner = self.read();
        Ok(keys.iter().filter_map(|k| inner.items.get(k).cloned()).collect())
    }

    /// Distinct values currently present in index `index`, sorted.
    pub fn index_values(&self, index: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.read();
        if !inner.indexers.contains_key(index) {
            return Err(StoreError::UnknownIndex(index.to_string()));
        }
        let mut values: Vec<String> =
            inner.indices.get(index).map(|p| p.keys().cloned().collect()).unwrap_or_default();
        values.sort_unstable();
        Ok(values)
    }
}

/// The single write path into the cache.
pub struct Writer<K> {
    inner: Arc<RwLock<Inner<K>>>,
}

impl<K: Resource> Default for Writer<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Resource> Writer<K> {
    pub fn new() -> Self {
        Self { inner: shared() }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<K>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn as_reader(&self) -> Store<K> {
        Store { inner: Arc::clone(&self.inner) }
    }

    /// Register a secondary index. Only allowed while the cache is empty.
    pub fn add_index(&self, name: &str, f: IndexFn<K>) -> Result<(), StoreError> {
        let mut inner = self.write();
        if !inner.items.is_empty() {
            return Err(StoreError::IndexAfterPopulate(name.to_string()));
        }
        inner.indexers.insert(name.to_string(), f);
        inner.indices.insert(name.to_string(), Postings::default());
        Ok(())
    }

    /// Insert or replace; returns the previous snapshot.
    pub fn upsert(&self, obj: Arc<K>) -> Option<Arc<K>> {
        let key = obj.key();
        let mut inner = self.write();
        let old = inner.items.insert(key.clone(), Arc::clone(&obj));
        if let Some(prev) = old.as_deref() {
            inner.unindex(&key, prev);
        }
        inner.index(&key, &obj);
        old
    }

    pub fn add(&self, obj: Arc<K>) -> Option<Arc<K>> {
        self.upsert(obj)
    }

    pub fn update(&self, obj: Arc<K>) -> Option<Arc<K>> {
        self.upsert(obj)
    }

    pub fn delete(&self, key: &ObjectKey) -> Option<Arc<K>> {
        let mut inner = self.write();
        let old = inner.items.remove(key);
        match old.as_deref() {
            Some(prev) => inner.unindex(key, prev),
            None => debug!(key = %key, "delete of unknown key"),
        }
        old
    }
}

/// Index objects by namespace (cluster-scoped objects are not indexed).
pub fn namespace_index<K: Resource>() -> IndexFn<K> {
    Arc::new(|obj: &K| obj.namespace().map(|ns| vec![ns.to_string()]).unwrap_or_default())
}

/// Index objects by the value of one label.
pub fn label_index<K: Resource>(label: &str) -> IndexFn<K> {
    let label = label.to_string();
    Arc::new(move |obj: &K| obj.label(&label).map(|v| vec![v.to_string()]).unwrap_or_default())
}
