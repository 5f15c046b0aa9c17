//! Informer: drives an [`EventSource`] through list → watch → relist, mirrors
//! every change into the [`Store`] and then notifies handlers.
//!
//! Per key, the store is written before any handler hears about the change,
//! so a worker that dequeues the key always reads at least that state.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use rustc_hash::FxHashSet;
use tether_core::{Delta, DeltaKind, ResourceKey, ResourceObject};
use tether_queue::WorkQueue;
use tether_source::EventSource;
use tether_store::Store;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ControllerConfig;
use crate::sync_gate::SyncGate;

/// Consumer of store changes.
pub trait EventHandler: Send + Sync {
    fn on_add(&self, obj: &ResourceObject);
    fn on_update(&self, old: &ResourceObject, new: &ResourceObject);
    /// `obj` is the last state known for the deleted object.
    fn on_delete(&self, obj: &ResourceObject);
}

/// Enqueues the key of every changed object.
pub struct EnqueueHandler {
    queue: Arc<WorkQueue<ResourceKey>>,
}

impl EnqueueHandler {
    pub fn new(queue: Arc<WorkQueue<ResourceKey>>) -> Self { Self { queue } }
}

impl EventHandler for EnqueueHandler {
    fn on_add(&self, obj: &ResourceObject) { self.queue.add(obj.key.clone()); }
    fn on_update(&self, _old: &ResourceObject, new: &ResourceObject) { self.queue.add(new.key.clone()); }
    fn on_delete(&self, obj: &ResourceObject) { self.queue.add(obj.key.clone()); }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InformerConfig {
    pub resync_period: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self { resync_period: Duration::from_secs(30), backoff_base: Duration::from_millis(200), backoff_max: Duration::from_secs(30) }
    }
}

impl From<&ControllerConfig> for InformerConfig {
    fn from(c: &ControllerConfig) -> Self {
        Self { resync_period: c.resync_period, ..Default::default() }.with_backoff_max(c.watch_backoff_max)
    }
}

impl InformerConfig {
    fn with_backoff_max(mut self, max: Duration) -> Self {
        self.backoff_max = max.max(self.backoff_base);
        self
    }
}

pub struct Informer {
    source: Arc<dyn EventSource>,
    store: Arc<Store>,
    handlers: Vec<Arc<dyn EventHandler>>,
    gate: SyncGate,
    cfg: InformerConfig,
}

async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

impl Informer {
    pub fn new(source: Arc<dyn EventSource>, store: Arc<Store>, cfg: InformerConfig) -> Self {
        Self { source, store, handlers: Vec::new(), gate: SyncGate::new(), cfg }
    }

    /// Register a handler. Handlers added after `run` starts are not supported.
    pub fn add_handler(&mut self, handler: Arc<dyn EventHandler>) { self.handlers.push(handler); }

    pub fn store(&self) -> &Arc<Store> { &self.store }

    pub fn sync_gate(&self) -> SyncGate { self.gate.clone() }

    pub fn has_synced(&self) -> bool { self.gate.has_synced() }

    /// Apply one change: store first, handlers second. Stale versions are dropped.
    pub fn apply(&self, delta: Delta) {
        counter!("informer_events_total", 1);
        let key = delta.object.key.clone();
        match delta.kind {
            DeltaKind::Added | DeltaKind::Updated => {
                if let Some(cur) = self.store.get(key.as_str()) {
                    if delta.object.is_stale_against(&cur) {
                        debug!(key = %key, rv = ?delta.object.resource_version, current = ?cur.resource_version, "stale event dropped");
                        return;
                    }
                }
                self.upsert(key, delta.object);
            }
            DeltaKind::Deleted => {
                let removed = self.store.delete(key.as_str());
                trace!(key = %key, known = removed.is_some(), "delete");
                for h in &self.handlers {
                    h.on_delete(&delta.object);
                }
            }
        }
    }

    fn upsert(&self, key: ResourceKey, obj: ResourceObject) {
        let obj = Arc::new(obj);
        match self.store.update(key, Arc::clone(&obj)) {
            Some(old) => {
                for h in &self.handlers {
                    h.on_update(&old, &obj);
                }
            }
            None => {
                for h in &self.handlers {
                    h.on_add(&obj);
                }
            }
        }
    }

    /// Make the store match a fresh listing. Objects missing from it were
    /// deleted while we were not watching.
    pub fn replace(&self, objects: Vec<ResourceObject>) {
        let listed: FxHashSet<ResourceKey> = objects.iter().map(|o| o.key.clone()).collect();
        let count = objects.len();
        for obj in objects {
            self.upsert(obj.key.clone(), obj);
        }
        let mut tombstones = 0usize;
        for key in self.store.keys() {
            if listed.contains(&key) {
                continue;
            }
            if let Some(old) = self.store.delete(key.as_str()) {
                tombstones += 1;
                for h in &self.handlers {
                    h.on_delete(&old);
                }
            }
        }
        debug!(source = %self.source.describe(), count, tombstones, "store replaced from listing");
    }

    /// Re-deliver every cached object as an update.
    pub fn resync(&self) {
        let objects = self.store.list();
        trace!(count = objects.len(), "resync");
        for obj in &objects {
            for h in &self.handlers {
                h.on_update(obj, obj);
            }
        }
    }

    /// List, watch, and relist on every broken watch until `cancel` fires.
    /// Transport errors are logged and retried with backoff, never returned.
    /// Resync runs alongside on its own timer, whatever the connection state.
    pub async fn run(&self, cancel: CancellationToken) {
        let source = self.source.describe();
        info!(source = %source, resync_secs = self.cfg.resync_period.as_secs(), "informer starting");
        tokio::join!(self.resync_loop(&cancel), self.list_and_watch(&source, &cancel));
        info!(source = %source, "informer stopped");
    }

    async fn resync_loop(&self, cancel: &CancellationToken) {
        let period = self.cfg.resync_period;
        if period.is_zero() {
            return;
        }
        let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticks.tick() => self.resync(),
            }
        }
    }

    /// Sleep for the current backoff, then double it. False if cancelled meanwhile.
    async fn back_off(&self, backoff: &mut Duration, cancel: &CancellationToken) -> bool {
        let slept = sleep_or_cancel(*backoff, cancel).await;
        *backoff = (*backoff * 2).min(self.cfg.backoff_max);
        slept
    }

    async fn list_and_watch(&self, source: &str, cancel: &CancellationToken) {
        let mut backoff = self.cfg.backoff_base;

        'relist: while !cancel.is_cancelled() {
            let listed = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.source.list_all() => res,
            };
            let listing = match listed {
                Ok(l) => l,
                Err(e) => {
                    warn!(source = %source, error = %e, retry_ms = backoff.as_millis() as u64, "list failed; retrying");
                    if !self.back_off(&mut backoff, cancel).await {
                        break;
                    }
                    continue;
                }
            };
            counter!("informer_relists_total", 1);
            let mut resume = listing.resource_version;
            self.replace(listing.objects);
            backoff = self.cfg.backoff_base;
            if self.gate.mark_synced() {
                info!(source = %source, objects = self.store.len(), "initial sync complete");
            }

            // one pass per watch connection; a clean close resumes from the
            // last version seen, anything else relists
            loop {
                let watched = tokio::select! {
                    _ = cancel.cancelled() => break 'relist,
                    res = self.source.watch(resume.as_deref()) => res,
                };
                let mut stream = match watched {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(source = %source, error = %e, retry_ms = backoff.as_millis() as u64, "watch failed to start; relisting");
                        if !self.back_off(&mut backoff, cancel).await {
                            break 'relist;
                        }
                        continue 'relist;
                    }
                };

                let mut delivered = false;
                'events: loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break 'relist,
                        next = stream.next() => match next {
                            Some(Ok(change)) => {
                                delivered = true;
                                backoff = self.cfg.backoff_base;
                                if let Some(rv) = &change.object().resource_version {
                                    resume = Some(rv.clone());
                                }
                                self.apply(change.into_delta());
                            }
                            Some(Err(e)) => {
                                warn!(source = %source, error = %e, retry_ms = backoff.as_millis() as u64, "watch broken; relisting");
                                if !self.back_off(&mut backoff, cancel).await {
                                    break 'relist;
                                }
                                continue 'relist;
                            }
                            None => break 'events,
                        },
                    }
                }

                debug!(source = %source, resume_from = ?resume, delivered, "watch closed; resuming");
                // a connection that closes without news should not spin
                if !delivered && !self.back_off(&mut backoff, cancel).await {
                    break 'relist;
                }
            }
        }
    }
}
