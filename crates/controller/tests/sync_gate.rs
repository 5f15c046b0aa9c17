use std::time::Duration;

use tether_controller::{wait_for_cache_sync, SyncGate};
use tokio_util::sync::CancellationToken;

#[test]
fn flips_once() {
    let gate = SyncGate::new();
    assert!(!gate.has_synced());
    assert!(gate.mark_synced());
    assert!(!gate.mark_synced());
    assert!(gate.clone().has_synced());
}

#[tokio::test]
async fn waiters_wake_when_marked() {
    let gate = SyncGate::new();
    let cancel = CancellationToken::new();
    let waiter = tokio::spawn({
        let gate = gate.clone();
        let cancel = cancel.clone();
        async move { gate.wait_for_sync(&cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());
    gate.mark_synced();
    assert!(waiter.await.unwrap());
}

#[tokio::test]
async fn cancellation_returns_false() {
    let a = SyncGate::new();
    let b = SyncGate::new();
    a.mark_synced();
    let cancel = CancellationToken::new();
    let waiter = tokio::spawn({
        let gates = vec![a.clone(), b.clone()];
        let cancel = cancel.clone();
        async move { wait_for_cache_sync(&cancel, &gates).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    assert!(!waiter.await.unwrap());
    assert!(!b.has_synced());
}

#[tokio::test]
async fn already_synced_returns_immediately() {
    let gate = SyncGate::new();
    gate.mark_synced();
    let cancel = CancellationToken::new();
    assert!(wait_for_cache_sync(&cancel, &[gate]).await);
}
