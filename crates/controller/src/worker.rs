//! Reconcile workers: dequeue a key, reconcile it against the store, then
//! forget it or requeue it with backoff.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use metrics::{counter, histogram};
use tether_core::{ResourceKey, ResourceObject};
use tether_queue::WorkQueue;
use tether_store::Store;
use tracing::{debug, error, warn};

/// Failure reported by a reconciler; the key is retried with backoff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ReconcileError {
    message: String,
}

impl ReconcileError {
    pub fn new(message: impl Into<String>) -> Self { Self { message: message.into() } }
    pub fn message(&self) -> &str { &self.message }
}

impl From<anyhow::Error> for ReconcileError {
    fn from(e: anyhow::Error) -> Self { Self::new(format!("{:#}", e)) }
}

/// Business logic driven by the control loop. Must be idempotent: the same
/// key may be reconciled any number of times. `object` is `None` when the
/// resource no longer exists.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, key: &ResourceKey, object: Option<Arc<ResourceObject>>) -> Result<(), ReconcileError>;
}

/// Adapts an async closure into a [`Reconciler`].
pub struct FnReconciler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> Reconciler for FnReconciler<F>
where
    F: Fn(ResourceKey, Option<Arc<ResourceObject>>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ReconcileError>> + Send,
{
    async fn reconcile(&self, key: &ResourceKey, object: Option<Arc<ResourceObject>>) -> Result<(), ReconcileError> {
        (self.0)(key.clone(), object).await
    }
}

/// Calls `done` when dropped, so every `get` is released on every exit path.
struct DoneGuard<'a> {
    queue: &'a WorkQueue<ResourceKey>,
    key: &'a ResourceKey,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) { self.queue.done(self.key); }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("reconcile panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("reconcile panicked: {}", s)
    } else {
        "reconcile panicked".to_string()
    }
}

pub struct Worker {
    pub id: usize,
    pub queue: Arc<WorkQueue<ResourceKey>>,
    pub store: Arc<Store>,
    pub reconciler: Arc<dyn Reconciler>,
    pub max_retries: u32,
}

impl Worker {
    /// Process keys until the queue shuts down.
    pub async fn run(self) {
        debug!(worker = self.id, "worker started");
        while self.process_next().await {}
        debug!(worker = self.id, "worker stopped");
    }

    /// Handle one key. Returns false once the queue is shutting down.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else { return false };
        let _done = DoneGuard { queue: &self.queue, key: &key };

        let object = self.store.get(key.as_str());
        let exists = object.is_some();
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.reconciler.reconcile(&key, object)).catch_unwind().await;
        histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };
        match failure {
            None => {
                counter!("reconcile_total", 1, "result" => "success");
                debug!(worker = self.id, key = %key, exists, took_ms = %started.elapsed().as_millis(), "reconciled");
                self.queue.forget(&key);
            }
            Some(reason) => self.handle_failure(&key, &reason),
        }
        true
    }

    fn handle_failure(&self, key: &ResourceKey, reason: &str) {
        let attempts = self.queue.num_requeues(key);
        if attempts < self.max_retries {
            counter!("reconcile_total", 1, "result" => "retry");
            warn!(worker = self.id, key = %key, attempt = attempts + 1, error = %reason, "reconcile failed; requeueing");
            self.queue.add_rate_limited(key.clone());
        } else {
            counter!("reconcile_total", 1, "result" => "dropped");
            error!(worker = self.id, key = %key, attempts, error = %reason, "reconcile failed too many times; dropping key");
            self.queue.forget(key);
        }
    }
}
