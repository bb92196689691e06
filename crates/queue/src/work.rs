use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::limiter::RateLimiter;

/// Anything usable as a work item identity.
pub trait QueueKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static> QueueKey for T {}

struct State<K> {
    queue: VecDeque<K>,
    /// Keys that need processing: queued, or re-added while processing.
    dirty: FxHashSet<K>,
    /// Keys handed out by `get` and not yet `done`, with their start time.
    processing: FxHashMap<K, Instant>,
    shutting_down: bool,
}

struct Shared<K> {
    state: Mutex<State<K>>,
    notify: Notify,
}

impl<K: QueueKey> Shared<K> {
    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        counter!("workqueue_adds_total", 1u64);
        if !st.dirty.insert(key.clone()) {
            trace!(key = ?key, "already pending");
            return;
        }
        if st.processing.contains_key(&key) {
            trace!(key = ?key, "in flight; will requeue on done");
            return;
        }
        st.queue.push_back(key);
        gauge!("workqueue_depth", st.queue.len() as f64);
        drop(st);
        self.notify.notify_one();
    }
}

struct Waiting<K> {
    ready_at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Waiting<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<K> Eq for Waiting<K> {}

impl<K> PartialOrd for Waiting<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Waiting<K> {
    // reversed: BinaryHeap is a max-heap, we want the earliest deadline on top
    fn cmp(&self, other: &Self) -> Ordering {
        other.ready_at.cmp(&self.ready_at).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Holds delayed adds until they are due, then feeds them into the queue.
async fn waiting_loop<K: QueueKey>(
    shared: Arc<Shared<K>>,
    mut rx: mpsc::UnboundedReceiver<(K, Instant)>,
    stop: CancellationToken,
) {
    let mut heap: BinaryHeap<Waiting<K>> = BinaryHeap::new();
    // earliest pending deadline per key; stale heap entries are skipped
    let mut earliest: FxHashMap<K, Instant> = FxHashMap::default();
    let mut seq = 0u64;
    loop {
        let now = Instant::now();
        while heap.peek().is_some_and(|w| w.ready_at <= now) {
            let Some(w) = heap.pop() else { break };
            if earliest.get(&w.key) == Some(&w.ready_at) {
                earliest.remove(&w.key);
                shared.add(w.key);
            }
        }
        let next = heap.peek().map_or_else(|| now + Duration::from_secs(3600), |w| w.ready_at);

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep_until(next) => {}
            msg = rx.recv() => {
                let Some((key, ready_at)) = msg else { break };
                if ready_at <= Instant::now() {
                    shared.add(key);
                    continue;
                }
                match earliest.get(&key) {
                    Some(t) if *t <= ready_at => {}
                    _ => {
                        earliest.insert(key.clone(), ready_at);
                        seq += 1;
                        heap.push(Waiting { ready_at, seq, key });
                    }
                }
            }
        }
    }
    debug!(waiting = earliest.len(), "work queue waiting loop stopped");
}

/// Deduplicating, single-flight work queue with delayed and rate-limited adds.
///
/// A key handed out by [`get`](Self::get) is never handed out again until
/// [`done`](Self::done) is called for it; adds in between are remembered and
/// re-queue the key on `done`.
pub struct WorkQueue<K: QueueKey> {
    shared: Arc<Shared<K>>,
    limiter: Arc<dyn RateLimiter<K>>,
    delayed_tx: mpsc::UnboundedSender<(K, Instant)>,
    stop: CancellationToken,
}

impl<K: QueueKey> WorkQueue<K> {
    /// Must be called from within a Tokio runtime: spawns the waiting loop for delayed adds.
    pub fn new(limiter: Arc<dyn RateLimiter<K>>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashMap::default(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        });
        let (delayed_tx, delayed_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        tokio::spawn(waiting_loop(Arc::clone(&shared), delayed_rx, stop.clone()));
        Self { shared, limiter, delayed_tx, stop }
    }

    pub fn add(&self, key: K) {
        self.shared.add(key);
    }

    /// Add `key` once `delay` has elapsed. Repeated delayed adds keep the earliest deadline.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let _ = self.delayed_tx.send((key, Instant::now() + delay));
    }

    /// Re-add after the limiter's backoff for `key`.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.limiter.next_backoff(&key);
        counter!("workqueue_retries_total", 1u64);
        debug!(key = ?key, delay_ms = delay.as_millis() as u64, "rate-limited requeue");
        self.add_after(key, delay);
    }

    /// Clear the backoff history of `key`.
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Wait for the next key. `None` once the queue is shutting down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.shared.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone(), Instant::now());
                    gauge!("workqueue_depth", st.queue.len() as f64);
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` finished. If it was re-added meanwhile it goes back on the queue.
    pub fn done(&self, key: &K) {
        let mut st = self.shared.lock();
        if let Some(started) = st.processing.remove(key) {
            histogram!("workqueue_work_ms", started.elapsed().as_secs_f64() * 1000.0);
        }
        if st.shutting_down || !st.dirty.contains(key) {
            return;
        }
        st.queue.push_back(key.clone());
        gauge!("workqueue_depth", st.queue.len() as f64);
        drop(st);
        self.shared.notify.notify_one();
    }

    /// Keys waiting to be handed out (excludes in-flight and delayed keys).
    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unblock every `get` with `None`, stop the waiting loop and ignore further adds.
    pub fn shut_down(&self) {
        {
            let mut st = self.shared.lock();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
            debug!(queued = st.queue.len(), in_flight = st.processing.len(), "work queue shutting down");
        }
        self.stop.cancel();
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.lock().shutting_down
    }
}

impl<K: QueueKey> Drop for WorkQueue<K> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
