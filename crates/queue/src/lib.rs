//! Tether work queue: deduplicating, rate-limited queue of keys awaiting
//! reconciliation.
//!
//! Per key the queue tracks three sets:
//! - `dirty`: the key needs processing (at most one pending entry per key)
//! - `processing`: a worker holds the key; a re-add is parked in `dirty`
//!   and requeued on `done`
//! - `waiting`: delayed adds, promoted to the ready queue by `get` once due
//!
//! No two workers ever hold the same key at once.

#![forbid(unsafe_code)]

pub mod rate_limit;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tether_core::ResourceKey;
use tokio::sync::Notify;
use tracing::{debug, trace};

pub use rate_limit::{
    controller_rate_limiter, default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter,
};

struct Waiting<K> {
    at: Instant,
    seq: u64,
    key: K,
}

// Min-heap on (at, seq).
impl<K> Ord for Waiting<K> {
    fn cmp(&self, other: &Self) -> Ordering { other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq)) }
}
impl<K> PartialOrd for Waiting<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl<K> PartialEq for Waiting<K> {
    fn eq(&self, other: &Self) -> bool { self.at == other.at && self.seq == other.seq }
}
impl<K> Eq for Waiting<K> {}

struct State<K> {
    queue: VecDeque<K>,
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    waiting: BinaryHeap<Waiting<K>>,
    /// Live ready time per waiting key; heap entries that disagree are stale.
    ready_at: FxHashMap<K, Instant>,
    seq: u64,
    shutting_down: bool,
}

impl<K: Eq + Hash + Clone> State<K> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            waiting: BinaryHeap::new(),
            ready_at: FxHashMap::default(),
            seq: 0,
            shutting_down: false,
        }
    }

    /// Mark dirty; returns true when the key became ready for `get`.
    fn insert(&mut self, key: K) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    fn promote(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while self.waiting.peek().map_or(false, |w| w.at <= now) {
            let Some(w) = self.waiting.pop() else { break };
            if self.ready_at.get(&w.key) == Some(&w.at) {
                self.ready_at.remove(&w.key);
                if self.insert(w.key) {
                    promoted += 1;
                }
            }
        }
        promoted
    }
}

/// Rate-limited work queue. Share it behind an `Arc`.
pub struct WorkQueue<K = ResourceKey> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: Arc<dyn RateLimiter<K>>,
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + std::fmt::Debug,
{
    pub fn new(name: impl Into<String>, limiter: Arc<dyn RateLimiter<K>>) -> Self {
        Self { name: name.into(), state: Mutex::new(State::new()), notify: Notify::new(), limiter }
    }

    pub fn name(&self) -> &str { &self.name }

    fn lock(&self) -> MutexGuard<'_, State<K>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    fn report_depth(&self, st: &State<K>) {
        gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.name.clone());
    }

    /// Mark `key` as needing processing. Coalesces with a pending entry;
    /// while the key is being processed the add is remembered for `done`.
    pub fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutting_down {
            trace!(queue = %self.name, ?key, "add after shutdown dropped");
            return;
        }
        counter!("workqueue_adds_total", 1, "name" => self.name.clone());
        if st.insert(key) {
            self.report_depth(&st);
            drop(st);
            self.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed. A key already waiting keeps the earlier deadline.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        let at = Instant::now() + delay;
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        if st.ready_at.get(&key).map_or(false, |cur| *cur <= at) {
            return;
        }
        st.seq = st.seq.wrapping_add(1);
        let seq = st.seq;
        st.ready_at.insert(key.clone(), at);
        st.waiting.push(Waiting { at, seq, key });
        drop(st);
        // a sleeping `get` may need an earlier deadline
        self.notify.notify_one();
    }

    /// Re-add after the delay the rate limiter assigns to `key`.
    pub fn add_rate_limited(&self, key: K) {
        if self.is_shutting_down() {
            return;
        }
        let delay = self.limiter.when(&key);
        counter!("workqueue_retries_total", 1, "name" => self.name.clone());
        debug!(queue = %self.name, ?key, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        self.add_after(key, delay);
    }

    /// Clear the backoff history of `key`.
    pub fn forget(&self, key: &K) { self.limiter.forget(key); }

    pub fn num_requeues(&self, key: &K) -> u32 { self.limiter.num_requeues(key) }

    /// Wait for the next ready key and mark it processing. `None` once the
    /// queue is shutting down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_ready = {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                st.promote(Instant::now());
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    self.report_depth(&st);
                    let more = !st.queue.is_empty();
                    drop(st);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                st.waiting.peek().map(|w| w.at)
            };

            match next_ready {
                Some(at) => {
                    let _ = tokio::time::timeout_at(tokio::time::Instant::from_std(at), notified).await;
                }
                None => notified.await,
            }
        }
    }

    /// Release `key` after processing. Must follow every successful `get`.
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        let held = st.processing.remove(key);
        debug_assert!(held, "done() for a key that is not processing");
        if st.shutting_down || !st.dirty.contains(key) {
            return;
        }
        st.queue.push_back(key.clone());
        self.report_depth(&st);
        drop(st);
        self.notify.notify_one();
    }

    /// Stop handing out keys and wake every blocked `get`. Idempotent.
    pub fn shut_down(&self) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        st.shutting_down = true;
        debug!(queue = %self.name, pending = st.queue.len(), waiting = st.ready_at.len(), "queue shutting down");
        drop(st);
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Keys ready to be handed out (excludes processing and delayed keys).
    pub fn len(&self) -> usize { self.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
