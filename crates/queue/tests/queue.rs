#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tether_queue::{ItemExponentialFailureRateLimiter, RateLimiter, WorkQueue};

fn queue(base_ms: u64, max_ms: u64) -> Arc<WorkQueue<String>> {
    let rl: Arc<dyn RateLimiter<String>> = Arc::new(ItemExponentialFailureRateLimiter::new(
        Duration::from_millis(base_ms),
        Duration::from_millis(max_ms),
    ));
    Arc::new(WorkQueue::new("test", rl))
}

async fn get_within(q: &WorkQueue<String>, ms: u64) -> Option<Option<String>> {
    tokio::time::timeout(Duration::from_millis(ms), q.get()).await.ok()
}

#[tokio::test]
async fn duplicate_adds_coalesce() {
    let q = queue(5, 100);
    q.add("ns/a".into());
    q.add("ns/a".into());
    assert_eq!(q.len(), 1);

    assert_eq!(q.get().await.as_deref(), Some("ns/a"));
    q.done(&"ns/a".to_string());
    assert!(get_within(&q, 50).await.is_none(), "coalesced key must be delivered once");
}

#[tokio::test]
async fn done_without_readd_returns_key_to_absent() {
    let q = queue(5, 100);
    q.add("ns/a".into());
    let k = q.get().await.unwrap();
    assert_eq!(k, "ns/a");
    q.done(&k);
    assert!(q.is_empty());
    assert!(get_within(&q, 50).await.is_none());
}

#[tokio::test]
async fn readd_during_processing_requeues_after_done() {
    let q = queue(5, 100);
    q.add("ns/a".into());
    let k = q.get().await.unwrap();

    q.add(k.clone());
    // held by a worker: not handed out again yet
    assert!(q.is_empty());
    assert!(get_within(&q, 30).await.is_none());

    q.done(&k);
    assert_eq!(get_within(&q, 200).await.flatten().as_deref(), Some("ns/a"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_two_workers_hold_the_same_key() {
    let q = queue(1, 10);
    let in_flight: Arc<Vec<AtomicUsize>> = Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());
    let violations = Arc::new(AtomicUsize::new(0));
    let processed = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for _ in 0..6 {
        let q = Arc::clone(&q);
        let in_flight = Arc::clone(&in_flight);
        let violations = Arc::clone(&violations);
        let processed = Arc::clone(&processed);
        workers.push(tokio::spawn(async move {
            while let Some(k) = q.get().await {
                let idx: usize = k.parse().unwrap();
                if in_flight[idx].fetch_add(1, Ordering::SeqCst) != 0 {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
                in_flight[idx].fetch_sub(1, Ordering::SeqCst);
                processed.fetch_add(1, Ordering::SeqCst);
                q.done(&k);
            }
        }));
    }

    for round in 0..200 {
        q.add((round % 4).to_string());
        if round % 10 == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    q.shut_down();
    for w in workers { w.await.unwrap(); }

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert!(processed.load(Ordering::SeqCst) >= 4);
}

#[tokio::test]
async fn rate_limited_add_is_delayed() {
    let q = queue(60, 1000);
    let t0 = Instant::now();
    q.add_rate_limited("ns/a".into());
    assert!(q.is_empty());
    assert_eq!(q.num_requeues(&"ns/a".to_string()), 1);

    let k = get_within(&q, 1000).await.flatten().unwrap();
    assert_eq!(k, "ns/a");
    assert!(t0.elapsed() >= Duration::from_millis(55), "delivered too early: {:?}", t0.elapsed());
    q.done(&k);
}

#[tokio::test]
async fn backoff_grows_and_forget_resets() {
    let q = queue(20, 1000);
    let key = "ns/a".to_string();

    let mut delays = Vec::new();
    for _ in 0..3 {
        let t0 = Instant::now();
        q.add_rate_limited(key.clone());
        let k = get_within(&q, 2000).await.flatten().unwrap();
        delays.push(t0.elapsed());
        q.done(&k);
    }
    // 20ms, 40ms, 80ms nominal
    assert!(delays[1] >= Duration::from_millis(38), "{delays:?}");
    assert!(delays[2] >= Duration::from_millis(78), "{delays:?}");
    assert_eq!(q.num_requeues(&key), 3);

    q.forget(&key);
    assert_eq!(q.num_requeues(&key), 0);
    let t0 = Instant::now();
    q.add_rate_limited(key.clone());
    let k = get_within(&q, 2000).await.flatten().unwrap();
    let fresh = t0.elapsed();
    q.done(&k);
    assert!(fresh >= Duration::from_millis(18), "{fresh:?}");
    assert!(fresh < Duration::from_millis(75), "expected base delay after forget, got {fresh:?}");
}

#[tokio::test]
async fn earlier_deadline_wins_for_waiting_key() {
    let q = queue(5, 100);
    q.add_after("ns/a".into(), Duration::from_secs(30));
    q.add_after("ns/a".into(), Duration::from_millis(20));
    assert_eq!(get_within(&q, 500).await.flatten().as_deref(), Some("ns/a"));
    q.done(&"ns/a".to_string());
    // the stale 30s entry never resurfaces as a second delivery
    assert!(get_within(&q, 50).await.is_none());
}

#[tokio::test]
async fn immediate_add_coalesces_with_pending_delayed_one() {
    let q = queue(5, 100);
    q.add_after("ns/a".into(), Duration::from_millis(20));
    q.add("ns/a".into());
    let k = q.get().await.unwrap();
    // the delayed copy lands while processing and is parked until done
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(get_within(&q, 10).await.is_none());
    q.done(&k);
    assert_eq!(get_within(&q, 200).await.flatten().as_deref(), Some("ns/a"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_wakes_every_blocked_get() {
    let q = queue(5, 100);
    let mut getters = Vec::new();
    for _ in 0..5 {
        let q = Arc::clone(&q);
        getters.push(tokio::spawn(async move { q.get().await }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    q.shut_down();
    q.shut_down();

    let results = tokio::time::timeout(Duration::from_secs(1), futures::future::join_all(getters))
        .await
        .expect("blocked getters must return promptly");
    for r in results {
        assert_eq!(r.unwrap(), None);
    }

    q.add("ns/a".into());
    q.add_rate_limited("ns/b".into());
    assert!(q.is_shutting_down());
    assert_eq!(q.get().await, None);
    assert!(q.is_empty());
}
