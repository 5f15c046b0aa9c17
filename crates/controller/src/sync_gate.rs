//! "Has the initial listing landed in the store" barrier.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Monotonic false→true flag. The informer is the single writer; any number
/// of readers may poll or wait on it.
#[derive(Clone, Debug)]
pub struct SyncGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for SyncGate {
    fn default() -> Self { Self::new() }
}

impl SyncGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn has_synced(&self) -> bool { *self.tx.borrow() }

    /// Flip to synced. Returns true only for the call that flipped it.
    pub fn mark_synced(&self) -> bool {
        self.tx.send_if_modified(|synced| {
            if *synced {
                false
            } else {
                *synced = true;
                true
            }
        })
    }

    /// Wait until synced (true) or until `cancel` fires (false).
    pub async fn wait_for_sync(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            res = rx.wait_for(|synced| *synced) => res.is_ok(),
        }
    }
}

/// Wait for every gate; false as soon as `cancel` fires.
pub async fn wait_for_cache_sync(cancel: &CancellationToken, gates: &[SyncGate]) -> bool {
    for gate in gates {
        if !gate.wait_for_sync(cancel).await {
            return false;
        }
    }
    true
}
