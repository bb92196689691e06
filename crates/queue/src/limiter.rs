//! Backoff strategies for [`WorkQueue::add_rate_limited`](crate::WorkQueue::add_rate_limited).

use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

/// Decides how long a key waits before it is handed out again.
pub trait RateLimiter<K>: Send + Sync {
    /// Record a failure for `key` and return the delay before its next attempt.
    fn next_backoff(&self, key: &K) -> Duration;

    /// Drop the failure history of `key`.
    fn forget(&self, key: &K);

    /// Failures recorded for `key` since the last `forget`.
    fn num_requeues(&self, key: &K) -> u32;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `base * 2^failures`, capped at `cap`.
pub struct ExponentialBackoff<K> {
    base: Duration,
    cap: Duration,
    failures: Mutex<FxHashMap<K, u32>>,
}

impl<K: Eq + Hash> ExponentialBackoff<K> {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap: cap.max(base), failures: Mutex::new(FxHashMap::default()) }
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        1u32.checked_shl(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

impl<K: Eq + Hash + Clone + Send> Default for ExponentialBackoff<K> {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ExponentialBackoff<K> {
    fn next_backoff(&self, key: &K) -> Duration {
        let mut failures = lock(&self.failures);
        let n = failures.entry(key.clone()).or_insert(0);
        let delay = self.delay_for(*n);
        *n = n.saturating_add(1);
        delay
    }

    fn forget(&self, key: &K) {
        lock(&self.failures).remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

/// Same delay for every retry.
pub struct FixedDelay<K> {
    delay: Duration,
    failures: Mutex<FxHashMap<K, u32>>,
}

impl<K: Eq + Hash> FixedDelay<K> {
    pub fn new(delay: Duration) -> Self {
        Self { delay, failures: Mutex::new(FxHashMap::default()) }
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for FixedDelay<K> {
    fn next_backoff(&self, key: &K) -> Duration {
        let mut failures = lock(&self.failures);
        let n = failures.entry(key.clone()).or_insert(0);
        *n = n.saturating_add(1);
        self.delay
    }

    fn forget(&self, key: &K) {
        lock(&self.failures).remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Longest wait a bucket hands out, also what a non-positive `qps` degrades to.
const MAX_BUCKET_DELAY: Duration = Duration::from_secs(1000);

/// Overall retry rate limit shared by all keys: `qps` refill, `burst` capacity.
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }),
        }
    }
}

impl<K> RateLimiter<K> for TokenBucket {
    fn next_backoff(&self, _key: &K) -> Duration {
        let mut b = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(b.last).as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.qps).min(self.burst) - 1.0;
        b.last = now;
        if b.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-b.tokens / self.qps).map_or(MAX_BUCKET_DELAY, |d| d.min(MAX_BUCKET_DELAY))
        }
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 {
        0
    }
}

/// Worst case of several limiters.
pub struct MaxOf<K> {
    limiters: Vec<Arc<dyn RateLimiter<K>>>,
}

impl<K> MaxOf<K> {
    pub fn new(limiters: Vec<Arc<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOf<K> {
    fn next_backoff(&self, key: &K) -> Duration {
        self.limiters.iter().map(|l| l.next_backoff(key)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &K) {
        for l in &self.limiters {
            l.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0)
    }
}

/// Per-key exponential backoff (5ms .. 1000s) bounded by an overall 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter<K>() -> MaxOf<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOf::<K>::new(vec![
        Arc::new(ExponentialBackoff::<K>::default()),
        Arc::new(TokenBucket::new(10.0, 100)),
    ])
}
