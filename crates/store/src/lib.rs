//! Tether store: thread-safe, indexed mirror of the last-known state of
//! every watched object.
//!
//! Writers hold the lock for a single mapping mutation (primary map plus
//! every index entry for that key), so readers never observe a key in an
//! index without its object, and never wait longer than one mutation.

#![forbid(unsafe_code)]

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use metrics::gauge;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tether_core::{ResourceKey, ResourceObject};
use tracing::trace;

/// Index values computed for one object.
pub type IndexValues = SmallVec<[String; 2]>;

/// Computes the index values an object is filed under.
pub type IndexFn = Arc<dyn Fn(&ResourceObject) -> IndexValues + Send + Sync>;

/// Name of the built-in namespace index.
pub const NAMESPACE_INDEX: &str = "namespace";

/// Namespace indexer; cluster-scoped objects are filed under `""`.
pub fn namespace_index_fn() -> IndexFn {
    Arc::new(|obj: &ResourceObject| {
        let mut out = IndexValues::new();
        out.push(obj.namespace.clone().unwrap_or_default());
        out
    })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("index {0:?} is not registered")]
    UnknownIndex(String),
}

/// Snapshot of the keys filed under one index value. Iterate it as often as needed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexKeys(Arc<[ResourceKey]>);

impl IndexKeys {
    pub fn iter(&self) -> std::slice::Iter<'_, ResourceKey> { self.0.iter() }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn contains(&self, key: &str) -> bool { self.0.iter().any(|k| k.as_str() == key) }
}

impl<'a> IntoIterator for &'a IndexKeys {
    type Item = &'a ResourceKey;
    type IntoIter = std::slice::Iter<'a, ResourceKey>;
    fn into_iter(self) -> Self::IntoIter { self.0.iter() }
}

#[derive(Default)]
struct Inner {
    items: FxHashMap<ResourceKey, Arc<ResourceObject>>,
    /// index name -> index value -> keys
    indices: FxHashMap<String, FxHashMap<String, FxHashSet<ResourceKey>>>,
}

impl Inner {
    fn unindex(&mut self, indexers: &[(String, IndexFn)], key: &ResourceKey, old: &ResourceObject) {
        for (name, f) in indexers {
            let Some(index) = self.indices.get_mut(name) else { continue };
            for value in f(old) {
                if let Some(set) = index.get_mut(&value) {
                    set.remove(key);
                    if set.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }

    fn index(&mut self, indexers: &[(String, IndexFn)], key: &ResourceKey, obj: &ResourceObject) {
        for (name, f) in indexers {
            let index = self.indices.entry(name.clone()).or_default();
            for value in f(obj) {
                index.entry(value).or_default().insert(key.clone());
            }
        }
    }
}

/// Indexed in-memory mirror keyed by [`ResourceKey`].
pub struct Store {
    inner: RwLock<Inner>,
    indexers: Vec<(String, IndexFn)>,
}

impl Default for Store {
    fn default() -> Self { Self::new() }
}

impl Store {
    /// Store with no secondary indexes.
    pub fn new() -> Self { Self::with_indexers(Vec::new()) }

    /// Store with the namespace index registered.
    pub fn with_namespace_index() -> Self {
        Self::with_indexers(vec![(NAMESPACE_INDEX.to_string(), namespace_index_fn())])
    }

    pub fn with_indexers(indexers: Vec<(String, IndexFn)>) -> Self {
        Self { inner: RwLock::new(Inner::default()), indexers }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> { self.inner.read().unwrap_or_else(PoisonError::into_inner) }
    fn write(&self) -> RwLockWriteGuard<'_, Inner> { self.inner.write().unwrap_or_else(PoisonError::into_inner) }

    /// Insert or overwrite the object for `key`, returning the previous one.
    pub fn update(&self, key: ResourceKey, obj: impl Into<Arc<ResourceObject>>) -> Option<Arc<ResourceObject>> {
        let obj: Arc<ResourceObject> = obj.into();
        let mut inner = self.write();
        let prev = inner.items.insert(key.clone(), Arc::clone(&obj));
        if let Some(old) = prev.as_deref() {
            inner.unindex(&self.indexers, &key, old);
        }
        inner.index(&self.indexers, &key, &obj);
        gauge!("store_objects", inner.items.len() as f64);
        trace!(key = %key, replaced = prev.is_some(), "store update");
        prev
    }

    /// Remove `key` from the primary map and every index. Missing keys are a no-op.
    pub fn delete(&self, key: &str) -> Option<Arc<ResourceObject>> {
        let mut inner = self.write();
        let (key, old) = inner.items.remove_entry(key)?;
        inner.unindex(&self.indexers, &key, &old);
        gauge!("store_objects", inner.items.len() as f64);
        trace!(key = %key, "store delete");
        Some(old)
    }

    pub fn get(&self, key: &str) -> Option<Arc<ResourceObject>> { self.read().items.get(key).cloned() }

    pub fn contains(&self, key: &str) -> bool { self.read().items.contains_key(key) }

    /// Keys filed under `value` in index `index_name`, as of this call.
    pub fn list_by_index(&self, index_name: &str, value: &str) -> Result<IndexKeys, StoreError> {
        if !self.indexers.iter().any(|(n, _)| n == index_name) {
            return Err(StoreError::UnknownIndex(index_name.to_string()));
        }
        let inner = self.read();
        let mut keys: Vec<ResourceKey> = inner
            .indices
            .get(index_name)
            .and_then(|idx| idx.get(value))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort_unstable();
        Ok(IndexKeys(keys.into()))
    }

    /// Distinct values currently present in an index.
    pub fn index_values(&self, index_name: &str) -> Result<Vec<String>, StoreError> {
        if !self.indexers.iter().any(|(n, _)| n == index_name) {
            return Err(StoreError::UnknownIndex(index_name.to_string()));
        }
        let inner = self.read();
        let mut out: Vec<String> = inner.indices.get(index_name).map(|idx| idx.keys().cloned().collect()).unwrap_or_default();
        out.sort_unstable();
        Ok(out)
    }

    pub fn list(&self) -> Vec<Arc<ResourceObject>> { self.read().items.values().cloned().collect() }

    pub fn keys(&self) -> Vec<ResourceKey> { self.read().items.keys().cloned().collect() }

    pub fn len(&self) -> usize { self.read().items.len() }

    pub fn is_empty(&self) -> bool { self.read().items.is_empty() }
}
