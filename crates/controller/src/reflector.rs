//! List + watch loop feeding the delta queue.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt;
use metrics::counter;
use rekon_core::{Delta, DeltaKind, ListerWatcher, Resource, SourceError, WatchEvent};
use rekon_queue::ExponentialBackoff;
use rekon_store::DeltaQueue;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::InformerConfig;

enum CycleEnd {
    Cancelled,
    StreamEnded,
    Expired(String),
    Failed(SourceError),
}

pub(crate) struct Reflector<L: ListerWatcher> {
    pub(crate) source: Arc<L>,
    pub(crate) queue: Arc<DeltaQueue<L::Object>>,
    pub(crate) last_rv: Arc<ArcSwap<String>>,
    pub(crate) config: InformerConfig,
}

async fn tick(resync: &mut Option<Interval>) {
    match resync {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl<L: ListerWatcher> Reflector<L> {
    pub(crate) async fn run(self, cancel: CancellationToken) {
        let backoff = ExponentialBackoff::<()>::new(self.config.watch_backoff_base, self.config.watch_backoff_max);
        let mut failures = 0u32;
        let mut cycles = 0u64;
        loop {
            if cycles > 0 {
                counter!("reflector_relists_total", 1u64);
            }
            cycles += 1;
            let pause = match self.list_and_watch(&cancel, &mut failures).await {
                CycleEnd::Cancelled => break,
                CycleEnd::StreamEnded => {
                    debug!("watch stream ended; relisting");
                    self.config.watch_backoff_base
                }
                CycleEnd::Expired(msg) => {
                    info!(reason = %msg, "resource version expired; relisting");
                    Duration::ZERO
                }
                CycleEnd::Failed(err) => {
                    let delay = backoff.delay_for(failures);
                    failures = failures.saturating_add(1);
                    warn!(error = %err, failures, retry_in_ms = delay.as_millis() as u64, "list/watch failed");
                    delay
                }
            };
            if !pause.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
        debug!("reflector stopped");
    }

    async fn list_and_watch(&self, cancel: &CancellationToken, failures: &mut u32) -> CycleEnd {
        let started = Instant::now();
        let listed = tokio::select! {
            _ = cancel.cancelled() => return CycleEnd::Cancelled,
            r = self.source.list() => r,
        };
        let list = match listed {
            Ok(list) => list,
            Err(e) => return CycleEnd::Failed(e),
        };
        let mut rv = list.resource_version;
        info!(items = list.items.len(), rv = %rv, took_ms = started.elapsed().as_millis() as u64, "listed");
        self.queue.replace(list.items);
        self.last_rv.store(Arc::new(rv.clone()));

        let opened = tokio::select! {
            _ = cancel.cancelled() => return CycleEnd::Cancelled,
            r = self.source.watch(&rv) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(SourceError::Expired(msg)) => return CycleEnd::Expired(msg),
            Err(e) => return CycleEnd::Failed(e),
        };
        debug!(rv = %rv, "watch opened");

        let mut resync = self.config.resync_period.filter(|p| !p.is_zero()).map(|p| {
            let mut i = tokio::time::interval_at(Instant::now() + p, p);
            i.set_missed_tick_behavior(MissedTickBehavior::Delay);
            i
        });

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return CycleEnd::Cancelled,
                _ = tick(&mut resync) => {
                    self.queue.resync();
                    continue;
                }
                ev = stream.next() => ev,
            };
            let Some(event) = event else { return CycleEnd::StreamEnded };
            if !matches!(event, WatchEvent::Error(_)) {
                // the watch is delivering again
                *failures = 0;
            }
            counter!("reflector_watch_events_total", 1u64);
            let (kind, obj) = match event {
                WatchEvent::Added(o) => (DeltaKind::Added, o),
                WatchEvent::Modified(o) => (DeltaKind::Updated, o),
                WatchEvent::Deleted(o) => (DeltaKind::Deleted, o),
                WatchEvent::Bookmark(v) => {
                    rv = v;
                    self.last_rv.store(Arc::new(rv.clone()));
                    continue;
                }
                WatchEvent::Error(SourceError::Expired(msg)) => return CycleEnd::Expired(msg),
                WatchEvent::Error(e) => return CycleEnd::Failed(e),
            };
            if let Some(v) = obj.resource_version() {
                rv = v.to_string();
                self.last_rv.store(Arc::new(rv.clone()));
            }
            self.queue.push(Delta::new(kind, Arc::new(obj)));
        }
    }
}
