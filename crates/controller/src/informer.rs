//! Informer: reflector + delta queue + the single cache writer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rekon_core::{identity_changed, Delta, DeltaKind, ListerWatcher, ObjectKey, Resource};
use rekon_store::{DeltaQueue, IndexFn, PopError, Store, StoreError, Writer};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::InformerConfig;
use crate::reflector::Reflector;

#[derive(Debug, thiserror::Error)]
#[error("event handler: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Notified after the cache has applied each change. An error makes the whole
/// delta batch of that key eligible for a bounded retry.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &Arc<K>) -> Result<(), HandlerError>;
    fn on_update(&self, old: &Arc<K>, new: &Arc<K>) -> Result<(), HandlerError>;
    fn on_delete(&self, obj: &Arc<K>) -> Result<(), HandlerError>;
}

pub struct Informer<L: ListerWatcher> {
    source: Arc<L>,
    writer: Writer<L::Object>,
    queue: Arc<DeltaQueue<L::Object>>,
    handler: Option<Arc<dyn EventHandler<L::Object>>>,
    config: InformerConfig,
    last_rv: Arc<ArcSwap<String>>,
    running: AtomicBool,
}

impl<L: ListerWatcher> Informer<L> {
    pub fn new(source: L, config: InformerConfig) -> Self {
        let writer = Writer::new();
        let queue = Arc::new(DeltaQueue::new(writer.as_reader(), config.max_requeues));
        Self {
            source: Arc::new(source),
            writer,
            queue,
            handler: None,
            config,
            last_rv: Arc::new(ArcSwap::from_pointee(String::new())),
            running: AtomicBool::new(false),
        }
    }

    /// Register a secondary index on the cache. Must happen before `run`.
    pub fn with_index(self, name: &str, f: IndexFn<L::Object>) -> Result<Self, StoreError> {
        self.writer.add_index(name, f)?;
        Ok(self)
    }

    /// Install the event handler, replacing any previous one.
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler<L::Object>>) -> Self {
        self.set_handler(handler);
        self
    }

    pub fn set_handler(&mut self, handler: Arc<dyn EventHandler<L::Object>>) {
        self.handler = Some(handler);
    }

    pub fn store(&self) -> Store<L::Object> {
        self.writer.as_reader()
    }

    /// Flips to `true` once the initial listing has been applied to the cache.
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.queue.subscribe_synced()
    }

    pub fn has_synced(&self) -> bool {
        self.queue.has_synced()
    }

    /// Resolves once synced. `false` if the informer went away first.
    pub async fn wait_for_sync(&self) -> bool {
        let mut rx = self.queue.subscribe_synced();
        let synced = rx.wait_for(|s| *s).await.is_ok();
        synced
    }

    /// Resource version of the last list or watch event seen. Empty before the first list.
    pub fn last_sync_resource_version(&self) -> String {
        self.last_rv.load().as_ref().clone()
    }

    /// Drive the reflector and the dispatch loop until `cancel` fires, then
    /// close the delta queue. Runs at most once per informer.
    pub async fn run(&self, cancel: CancellationToken) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("informer already running");
            return;
        }
        let reflector = Reflector {
            source: Arc::clone(&self.source),
            queue: Arc::clone(&self.queue),
            last_rv: Arc::clone(&self.last_rv),
            config: self.config.clone(),
        };
        let reflector_cancel = cancel.child_token();
        let task = tokio::spawn(reflector.run(reflector_cancel.clone()));
        info!("informer started");

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.dispatch() => {}
        }

        self.queue.close();
        reflector_cancel.cancel();
        if let Err(e) = task.await {
            error!(error = %e, "reflector task failed");
        }
        info!(cached = self.writer.as_reader().len(), "informer stopped");
    }

    async fn dispatch(&self) {
        loop {
            match self.queue.pop(|key, deltas| self.apply(key, deltas)).await {
                Ok(_) => {}
                Err(PopError::Closed) => break,
                Err(PopError::Process { key, requeued, source }) => {
                    debug!(key = %key, requeued, error = %source, "delta batch not handled");
                }
            }
        }
    }

    /// Apply one key's batch to the cache in order, notifying the handler after each write.
    fn apply(&self, key: &ObjectKey, deltas: &[Delta<L::Object>]) -> Result<(), HandlerError> {
        for delta in deltas {
            if delta.key != *key || delta.object.key() != *key {
                warn!(key = %key, delta_key = %delta.key, "delta does not match its key; skipped");
                continue;
            }
            match delta.kind {
                DeltaKind::Added | DeltaKind::Updated | DeltaKind::Sync => {
                    let old = self.writer.upsert(Arc::clone(&delta.object));
                    let Some(handler) = &self.handler else { continue };
                    match old {
                        Some(old) if identity_changed(old.as_ref(), delta.object.as_ref()) => {
                            handler.on_delete(&old)?;
                            handler.on_add(&delta.object)?;
                        }
                        Some(old) => handler.on_update(&old, &delta.object)?,
                        None => handler.on_add(&delta.object)?,
                    }
                }
                DeltaKind::Deleted => {
                    let old = self.writer.delete(key);
                    if let Some(handler) = &self.handler {
                        handler.on_delete(old.as_ref().unwrap_or(&delta.object))?;
                    }
                }
            }
        }
        Ok(())
    }
}
