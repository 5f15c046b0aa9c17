//! Tether controller: wires an [`EventSource`] through an [`Informer`] into a
//! [`Store`] and a rate-limited [`WorkQueue`], and runs N reconcile workers
//! once the initial listing has landed.

#![forbid(unsafe_code)]

pub mod config;
pub mod informer;
pub mod sync_gate;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use tether_core::ResourceKey;
use tether_queue::{controller_rate_limiter, WorkQueue};
use tether_source::EventSource;
use tether_store::Store;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use config::{ConfigError, ControllerConfig};
pub use informer::{EnqueueHandler, EventHandler, Informer, InformerConfig};
pub use sync_gate::{wait_for_cache_sync, SyncGate};
pub use worker::{FnReconciler, ReconcileError, Reconciler, Worker};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cache did not sync within {0:?}")]
    SyncTimeout(Duration),
}

pub struct Controller {
    config: ControllerConfig,
    store: Arc<Store>,
    queue: Arc<WorkQueue<ResourceKey>>,
    informer: Arc<Informer>,
    reconciler: Arc<dyn Reconciler>,
}

impl Controller {
    pub fn new(source: Arc<dyn EventSource>, reconciler: Arc<dyn Reconciler>, config: ControllerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = Arc::new(Store::with_namespace_index());
        let limiter = controller_rate_limiter(config.backoff_base, config.backoff_max, config.max_items_per_sec, config.burst);
        let queue = Arc::new(WorkQueue::new(config.name.clone(), limiter));
        let mut informer = Informer::new(source, Arc::clone(&store), InformerConfig::from(&config));
        informer.add_handler(Arc::new(EnqueueHandler::new(Arc::clone(&queue))));
        Ok(Self { config, store, queue, informer: Arc::new(informer), reconciler })
    }

    pub fn config(&self) -> &ControllerConfig { &self.config }

    pub fn store(&self) -> &Arc<Store> { &self.store }

    pub fn queue(&self) -> &Arc<WorkQueue<ResourceKey>> { &self.queue }

    pub fn sync_gate(&self) -> SyncGate { self.informer.sync_gate() }

    /// True once the first full listing has been applied to the store.
    pub fn has_synced(&self) -> bool { self.informer.has_synced() }

    /// Run until `cancel` fires. Workers start only after the initial sync;
    /// on return the queue is shut down and every task has exited.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ControllerError> {
        let name = self.config.name.clone();
        info!(controller = %name, workers = self.config.workers, "controller starting");

        let informer_cancel = cancel.child_token();
        let informer = Arc::clone(&self.informer);
        let informer_task = {
            let token = informer_cancel.clone();
            tokio::spawn(async move { informer.run(token).await })
        };

        let gate = self.informer.sync_gate();
        let synced = match self.config.sync_timeout {
            Some(limit) => match tokio::time::timeout(limit, gate.wait_for_sync(&cancel)).await {
                Ok(synced) => synced,
                Err(_) => {
                    warn!(controller = %name, timeout_secs = limit.as_secs(), "cache sync timed out");
                    informer_cancel.cancel();
                    self.queue.shut_down();
                    let _ = informer_task.await;
                    return Err(ControllerError::SyncTimeout(limit));
                }
            },
            None => gate.wait_for_sync(&cancel).await,
        };

        let mut workers = JoinSet::new();
        if synced {
            info!(controller = %name, objects = self.store.len(), "cache synced; starting workers");
            for id in 0..self.config.workers {
                let worker = Worker {
                    id,
                    queue: Arc::clone(&self.queue),
                    store: Arc::clone(&self.store),
                    reconciler: Arc::clone(&self.reconciler),
                    max_retries: self.config.max_retries,
                };
                workers.spawn(worker.run());
            }
            cancel.cancelled().await;
        }

        info!(controller = %name, "controller shutting down");
        informer_cancel.cancel();
        self.queue.shut_down();
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                warn!(controller = %name, error = %e, "worker task failed");
            }
        }
        if let Err(e) = informer_task.await {
            warn!(controller = %name, error = %e, "informer task failed");
        }
        info!(controller = %name, "controller stopped");
        Ok(())
    }
}
