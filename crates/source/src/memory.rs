//! In-process source with the same list/watch contract as a real API
//! server: monotonically increasing versions, watches resumable from a
//! listing's version, and injectable transport failures.
//!
//! Change history is compacted like an API server's: only the most recent
//! entries are kept, and a watch asking to resume from before the retained
//! window fails so the caller relists.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use futures::StreamExt;
use tether_core::{ResourceKey, ResourceObject};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{Change, ChangeStream, EventSource, Listing};

#[derive(Debug, Clone)]
enum Signal {
    Change(Change),
    Disconnect,
}

/// Changes retained for watch resumption unless overridden.
pub const DEFAULT_HISTORY_LIMIT: usize = 4096;

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ResourceKey, ResourceObject>,
    /// Recent changes, tagged with the version each produced.
    history: VecDeque<(u64, Change)>,
    /// Highest version dropped from `history`.
    compacted: u64,
    version: u64,
    failing_lists: usize,
    lists: usize,
    watches: usize,
}

pub struct MemorySource {
    name: String,
    inner: Mutex<Inner>,
    tx: broadcast::Sender<Signal>,
    history_limit: usize,
}

impl Default for MemorySource {
    fn default() -> Self { Self::new("memory") }
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { name: name.into(), inner: Mutex::new(Inner::default()), tx, history_limit: DEFAULT_HISTORY_LIMIT }
    }

    /// Keep at most `limit` changes for resuming watches (minimum 1).
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Create or replace an object. `metadata.resourceVersion` is assigned here.
    pub fn apply(&self, mut raw: serde_json::Value) -> Result<ResourceObject> {
        let mut inner = self.lock();
        let version = inner.version + 1;
        let meta = raw
            .get_mut("metadata")
            .and_then(|m| m.as_object_mut())
            .ok_or_else(|| anyhow!("object missing metadata"))?;
        meta.insert("resourceVersion".into(), serde_json::Value::String(version.to_string()));
        let obj = ResourceObject::from_raw(raw)?;
        inner.version = version;
        let change = match inner.objects.insert(obj.key.clone(), obj.clone()) {
            Some(_) => Change::Modified(obj.clone()),
            None => Change::Added(obj.clone()),
        };
        self.publish(&mut inner, version, change);
        Ok(obj)
    }

    /// Remove an object; returns its final state.
    pub fn delete(&self, key: &str) -> Option<ResourceObject> {
        let mut inner = self.lock();
        let mut obj = inner.objects.remove(key)?;
        inner.version += 1;
        let version = inner.version;
        obj.resource_version = Some(version.to_string());
        self.publish(&mut inner, version, Change::Deleted(obj.clone()));
        Some(obj)
    }

    fn publish(&self, inner: &mut Inner, version: u64, change: Change) {
        debug!(source = %self.name, key = %change.key(), version, "memory change");
        inner.history.push_back((version, change.clone()));
        while inner.history.len() > self.history_limit {
            if let Some((dropped, _)) = inner.history.pop_front() {
                inner.compacted = dropped;
            }
        }
        // no subscribers is fine
        let _ = self.tx.send(Signal::Change(change));
    }

    /// Break every open watch, as a dropped connection would.
    pub fn disconnect(&self) {
        let _ = self.tx.send(Signal::Disconnect);
    }

    /// Make the next `n` list calls fail.
    pub fn fail_next_lists(&self, n: usize) { self.lock().failing_lists = n; }

    pub fn list_calls(&self) -> usize { self.lock().lists }

    pub fn watch_calls(&self) -> usize { self.lock().watches }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[async_trait::async_trait]
impl EventSource for MemorySource {
    fn describe(&self) -> String { self.name.clone() }

    async fn list_all(&self) -> Result<Listing> {
        let mut inner = self.lock();
        inner.lists += 1;
        if inner.failing_lists > 0 {
            inner.failing_lists -= 1;
            return Err(anyhow!("{}: list failed (injected)", self.name));
        }
        Ok(Listing {
            objects: inner.objects.values().cloned().collect(),
            resource_version: Some(inner.version.to_string()),
        })
    }

    async fn watch(&self, resource_version: Option<&str>) -> Result<ChangeStream> {
        let from: Option<u64> = match resource_version {
            Some(rv) => Some(rv.parse().map_err(|_| anyhow!("{}: bad resource version {:?}", self.name, rv))?),
            None => None,
        };
        // subscribe under the lock so nothing falls between backlog and live feed
        let mut inner = self.lock();
        inner.watches += 1;
        // no version: only changes from now on
        let from = from.unwrap_or(inner.version);
        if from < inner.compacted {
            return Err(anyhow!("{}: resource version {} is too old (compacted through {})", self.name, from, inner.compacted));
        }
        let rx = self.tx.subscribe();
        let backlog: Vec<Result<Change>> =
            inner.history.iter().filter(|(v, _)| *v > from).map(|(_, c)| Ok(c.clone())).collect();
        drop(inner);

        let live = futures::stream::unfold(Some(rx), |rx| async move {
            let mut rx = rx?;
            match rx.recv().await {
                Ok(Signal::Change(c)) => Some((Ok(c), Some(rx))),
                Ok(Signal::Disconnect) => Some((Err(anyhow!("watch connection reset")), None)),
                Err(broadcast::error::RecvError::Lagged(n)) => Some((Err(anyhow!("watch lagged by {} events", n)), None)),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Ok(futures::stream::iter(backlog).chain(live).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn raw(name: &str, ns: &str) -> serde_json::Value {
        serde_json::json!({ "metadata": { "name": name, "namespace": ns } })
    }

    #[tokio::test]
    async fn list_then_watch_resumes_after_listing() {
        let src = MemorySource::default();
        src.apply(raw("a", "ns")).unwrap();
        let listing = src.list_all().await.unwrap();
        assert_eq!(listing.objects.len(), 1);
        assert_eq!(listing.resource_version.as_deref(), Some("1"));

        // happens between list and watch; must still be seen
        src.apply(raw("b", "ns")).unwrap();
        let mut stream = src.watch(listing.resource_version.as_deref()).await.unwrap();
        src.apply(raw("a", "ns")).unwrap();
        src.delete("ns/b").unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            match stream.next().await.unwrap().unwrap() {
                Change::Added(o) => seen.push(format!("+{}", o.key)),
                Change::Modified(o) => seen.push(format!("~{}", o.key)),
                Change::Deleted(o) => seen.push(format!("-{}", o.key)),
            }
        }
        assert_eq!(seen, vec!["+ns/b", "~ns/a", "-ns/b"]);
    }

    #[tokio::test]
    async fn disconnect_ends_watch_with_error() {
        let src = MemorySource::default();
        let mut stream = src.watch(None).await.unwrap();
        src.disconnect();
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn injected_list_failures() {
        let src = MemorySource::default();
        src.fail_next_lists(2);
        assert!(src.list_all().await.is_err());
        assert!(src.list_all().await.is_err());
        assert!(src.list_all().await.is_ok());
        assert_eq!(src.list_calls(), 3);
    }

    #[tokio::test]
    async fn resuming_before_retained_history_fails() {
        let src = MemorySource::default().with_history_limit(2);
        for _ in 0..4 {
            src.apply(raw("a", "ns")).unwrap();
        }
        // versions 1 and 2 were compacted away
        assert!(src.watch(Some("1")).await.is_err());
        let mut stream = src.watch(Some("2")).await.unwrap();
        let mut versions = Vec::new();
        for _ in 0..2 {
            let change = stream.next().await.unwrap().unwrap();
            versions.push(change.object().resource_version.clone().unwrap());
        }
        assert_eq!(versions, vec!["3", "4"]);
        // a fresh listing always resumes cleanly
        let listing = src.list_all().await.unwrap();
        assert!(src.watch(listing.resource_version.as_deref()).await.is_ok());
    }

    #[test]
    fn versions_increase() {
        let src = MemorySource::default();
        let a = src.apply(raw("a", "ns")).unwrap();
        let a2 = src.apply(raw("a", "ns")).unwrap();
        assert!(a.is_stale_against(&a2));
        let gone = src.delete("ns/a").unwrap();
        assert!(a2.is_stale_against(&gone));
        assert!(src.delete("ns/a").is_none());
        assert!(src.is_empty());
    }
}
