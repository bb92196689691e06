//! Reconcile loop: informer events become keys on a work queue, workers
//! reconcile each key against the current cache state.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, histogram};
use rekon_core::{ListerWatcher, ObjectKey, Resource};
use rekon_queue::{ExponentialBackoff, MaxOf, RateLimiter, TokenBucket, WorkQueue};
use rekon_store::Store;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::informer::{EventHandler, HandlerError, Informer};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
    #[error("reconcile panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Drives an object towards its desired state. Called with `None` once the
/// object is gone from the cache. Must be idempotent: the same key may be
/// reconciled any number of times.
#[async_trait]
pub trait Reconciler<K>: Send + Sync + 'static {
    async fn reconcile(&self, key: &ObjectKey, obj: Option<Arc<K>>) -> Result<(), ReconcileError>;
}

struct EnqueueHandler {
    queue: Arc<WorkQueue<ObjectKey>>,
}

impl<K: Resource> EventHandler<K> for EnqueueHandler {
    fn on_add(&self, obj: &Arc<K>) -> Result<(), HandlerError> {
        self.queue.add(obj.key());
        Ok(())
    }

    fn on_update(&self, _old: &Arc<K>, new: &Arc<K>) -> Result<(), HandlerError> {
        self.queue.add(new.key());
        Ok(())
    }

    fn on_delete(&self, obj: &Arc<K>) -> Result<(), HandlerError> {
        self.queue.add(obj.key());
        Ok(())
    }
}

/// Default retry limiter for `config`: per-key exponential backoff bounded by an overall bucket.
pub fn rate_limiter_for(config: &ControllerConfig) -> Arc<dyn RateLimiter<ObjectKey>> {
    Arc::new(MaxOf::<ObjectKey>::new(vec![
        Arc::new(ExponentialBackoff::<ObjectKey>::new(config.backoff_base, config.backoff_max)),
        Arc::new(TokenBucket::new(10.0, 100)),
    ]))
}

pub struct Controller<L: ListerWatcher, R> {
    informer: Informer<L>,
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<ObjectKey>>,
    config: ControllerConfig,
}

impl<L, R> Controller<L, R>
where
    L: ListerWatcher,
    R: Reconciler<L::Object>,
{
    /// Must be called from within a Tokio runtime.
    pub fn new(informer: Informer<L>, reconciler: R, config: ControllerConfig) -> Self {
        let limiter = rate_limiter_for(&config);
        Self::with_rate_limiter(informer, reconciler, config, limiter)
    }

    pub fn with_rate_limiter(
        mut informer: Informer<L>,
        reconciler: R,
        config: ControllerConfig,
        limiter: Arc<dyn RateLimiter<ObjectKey>>,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new(limiter));
        informer.set_handler(Arc::new(EnqueueHandler { queue: Arc::clone(&queue) }));
        Self { informer, reconciler: Arc::new(reconciler), queue, config }
    }

    pub fn store(&self) -> Store<L::Object> {
        self.informer.store()
    }

    pub fn queue(&self) -> Arc<WorkQueue<ObjectKey>> {
        Arc::clone(&self.queue)
    }

    /// Run until `cancel` fires: start the informer, wait for the cache to sync,
    /// then reconcile with `config.workers` concurrent workers. Queued keys are dropped on shutdown.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ControllerError> {
        let workers = self.config.workers.max(1);
        let informer = Arc::new(self.informer);
        let informer_cancel = cancel.child_token();
        let informer_task = {
            let informer = Arc::clone(&informer);
            let c = informer_cancel.clone();
            tokio::spawn(async move { informer.run(c).await })
        };

        let mut set = JoinSet::new();
        let synced = tokio::select! {
            _ = cancel.cancelled() => false,
            ok = informer.wait_for_sync() => ok,
        };
        if synced {
            info!(workers, cached = informer.store().len(), "cache synced; starting workers");
            for id in 0..workers {
                set.spawn(worker(
                    id,
                    Arc::clone(&self.queue),
                    informer.store(),
                    Arc::clone(&self.reconciler),
                    self.config.max_retries,
                    cancel.clone(),
                ));
            }
        }
        cancel.cancelled().await;

        info!(queued = self.queue.len(), "controller shutting down");
        self.queue.shut_down();
        informer_cancel.cancel();
        let mut result = Ok(());
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker task failed");
                result = Err(e.into());
            }
        }
        if let Err(e) = informer_task.await {
            error!(error = %e, "informer task failed");
            result = Err(e.into());
        }
        info!("controller stopped");
        result
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn worker<K, R>(
    id: usize,
    queue: Arc<WorkQueue<ObjectKey>>,
    store: Store<K>,
    reconciler: Arc<R>,
    max_retries: Option<u32>,
    cancel: CancellationToken,
) where
    K: Resource,
    R: Reconciler<K>,
{
    debug!(worker = id, "worker started");
    while let Some(key) = queue.get().await {
        let obj = store.get(&key);
        let started = Instant::now();
        let attempt = AssertUnwindSafe(reconciler.reconcile(&key, obj)).catch_unwind();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                queue.done(&key);
                break;
            }
            r = attempt => r,
        };
        let result = outcome.unwrap_or_else(|panic| Err(ReconcileError::Panicked(panic_message(panic.as_ref()))));
        let took_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!("reconcile_ms", took_ms);

        match result {
            Ok(()) => {
                counter!("reconcile_total", 1u64, "result" => "ok");
                debug!(worker = id, key = %key, took_ms, "reconciled");
                queue.forget(&key);
            }
            Err(err) => {
                counter!("reconcile_total", 1u64, "result" => "error");
                let attempts = queue.num_requeues(&key);
                match max_retries {
                    Some(max) if attempts >= max => {
                        error!(worker = id, key = %key, attempts, error = %err, "giving up on key");
                        queue.forget(&key);
                    }
                    _ => {
                        warn!(worker = id, key = %key, attempts, error = %err, "reconcile failed; requeueing");
                        queue.add_rate_limited(key.clone());
                    }
                }
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "worker stopped");
}
