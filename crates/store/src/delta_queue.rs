//! Per-key delta queue between the reflector and the informer's dispatch loop.
//!
//! Each key owns at most one slot; new deltas for a pending key are folded into
//! that slot so the queue never holds more than one position per distinct key.
//! Slots are handed out in FIFO order of first-pending time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use metrics::{counter, gauge};
use rekon_core::{identity_changed, Delta, DeltaKind, ObjectKey, Resource};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::cache::Store;

pub type Deltas<K> = SmallVec<[Delta<K>; 2]>;

#[derive(Debug, thiserror::Error)]
pub enum PopError<E>
where
    E: std::error::Error + 'static,
{
    #[error("delta queue closed")]
    Closed,
    #[error("processing {key} failed (requeued: {requeued})")]
    Process {
        key: ObjectKey,
        requeued: bool,
        #[source]
        source: E,
    },
}

struct Slot<K> {
    deltas: Deltas<K>,
    attempts: u32,
}

struct QueueState<K> {
    slots: FxHashMap<ObjectKey, Slot<K>>,
    order: VecDeque<ObjectKey>,
    closed: bool,
    populated: bool,
    /// Keys from the first listing not yet fully processed.
    initial: FxHashSet<ObjectKey>,
    /// Batches popped but still being processed, with the state they converge to.
    in_flight: FxHashMap<ObjectKey, Option<Arc<K>>>,
}

impl<K: Resource> QueueState<K> {
    fn enqueue(&mut self, delta: Delta<K>, known: &Store<K>) {
        let key = delta.key.clone();
        let Some(slot) = self.slots.get_mut(&key) else {
            let mut deltas = Deltas::new();
            deltas.push(delta);
            self.slots.insert(key.clone(), Slot { deltas, attempts: 0 });
            self.order.push_back(key);
            return;
        };
        let starts_with_add = slot.deltas.first().map(|d| d.kind) == Some(DeltaKind::Added);
        let observed = known.contains_key(&key) || self.in_flight.contains_key(&key);
        if delta.kind == DeltaKind::Deleted && starts_with_add && !observed {
            // never observed by the consumer: nothing to deliver
            self.slots.remove(&key);
            self.order.retain(|k| k != &key);
            self.initial.remove(&key);
            debug!(key = %key, "add+delete collapsed");
            return;
        }
        match slot.deltas.last_mut() {
            Some(last) if last.kind == DeltaKind::Deleted => *last = delta,
            _ => slot.deltas.push(delta),
        }
    }

    /// Latest state as the consumer will see it once pending deltas drain.
    /// Outer `None`: nothing pending for the key.
    fn pending_tail(&self, key: &ObjectKey) -> Option<Option<Arc<K>>> {
        let last = self.slots.get(key)?.deltas.last()?;
        Some(match last.kind {
            DeltaKind::Deleted => None,
            _ => Some(Arc::clone(&last.object)),
        })
    }

    fn latest(&self, key: &ObjectKey, known: &Store<K>) -> Option<Arc<K>> {
        if let Some(tail) = self.pending_tail(key) {
            return tail;
        }
        if let Some(tail) = self.in_flight.get(key) {
            return tail.clone();
        }
        known.get(key)
    }

    fn take_next(&mut self) -> Option<(ObjectKey, Slot<K>)> {
        while let Some(key) = self.order.pop_front() {
            if let Some(slot) = self.slots.remove(&key) {
                let tail = slot.deltas.last().and_then(|d| match d.kind {
                    DeltaKind::Deleted => None,
                    _ => Some(Arc::clone(&d.object)),
                });
                self.in_flight.insert(key.clone(), tail);
                return Some((key, slot));
            }
        }
        None
    }

    fn requeue(&mut self, key: ObjectKey, mut slot: Slot<K>) {
        match self.slots.get_mut(&key) {
            Some(newer) => {
                // keep per-key order: failed batch goes in front of what arrived meanwhile
                slot.deltas.extend(newer.deltas.drain(..));
                newer.deltas = slot.deltas;
                newer.attempts = slot.attempts;
            }
            None => {
                self.slots.insert(key.clone(), slot);
                self.order.push_back(key);
            }
        }
    }

    fn synced(&self) -> bool {
        self.populated && self.initial.is_empty()
    }
}

pub struct DeltaQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    known: Store<K>,
    max_requeues: u32,
    synced_tx: watch::Sender<bool>,
}

impl<K: Resource> DeltaQueue<K> {
    /// `known` is the cache the consumer maintains; it drives resync and relist diffs.
    pub fn new(known: Store<K>, max_requeues: u32) -> Self {
        let (synced_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(QueueState {
                slots: FxHashMap::default(),
                order: VecDeque::new(),
                closed: false,
                populated: false,
                initial: FxHashSet::default(),
                in_flight: FxHashMap::default(),
            }),
            notify: Notify::new(),
            known,
            max_requeues,
            synced_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of keys with pending deltas.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// True once the first listing has been fully popped and processed.
    pub fn has_synced(&self) -> bool {
        self.lock().synced()
    }

    pub fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.synced_tx.subscribe()
    }

    pub fn push(&self, delta: Delta<K>) {
        let synced = {
            let mut st = self.lock();
            if st.closed {
                debug!(key = %delta.key, "push after close ignored");
                return;
            }
            st.enqueue(delta, &self.known);
            gauge!("delta_queue_depth", st.slots.len() as f64);
            st.synced()
        };
        self.publish_synced(synced);
        self.notify.notify_one();
    }

    /// Diff a full listing against the latest known state and enqueue only the
    /// deltas needed to converge the cache on it.
    pub fn replace(&self, list: Vec<K>) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        let (mut added, mut updated, mut deleted) = (0usize, 0usize, 0usize);
        let mut listed = FxHashSet::default();
        for obj in list {
            let obj = Arc::new(obj);
            let key = obj.key();
            match st.latest(&key, &self.known) {
                None => {
                    st.enqueue(Delta::new(DeltaKind::Added, Arc::clone(&obj)), &self.known);
                    added += 1;
                }
                Some(prev) if identity_changed(prev.as_ref(), obj.as_ref()) => {
                    st.enqueue(Delta::new(DeltaKind::Deleted, prev), &self.known);
                    st.enqueue(Delta::new(DeltaKind::Added, Arc::clone(&obj)), &self.known);
                    added += 1;
                }
                Some(prev) => {
                    let same = matches!(
                        (prev.resource_version(), obj.resource_version()),
                        (Some(a), Some(b)) if a == b
                    );
                    if !same {
                        st.enqueue(Delta::new(DeltaKind::Updated, Arc::clone(&obj)), &self.known);
                        updated += 1;
                    }
                }
            }
            listed.insert(key);
        }

        let mut candidates: FxHashSet<ObjectKey> = self.known.list_keys().into_iter().collect();
        candidates.extend(st.slots.keys().cloned());
        candidates.extend(st.in_flight.keys().cloned());
        let mut vanished: Vec<Arc<K>> = candidates
            .iter()
            .filter(|k| !listed.contains(*k))
            .filter_map(|k| st.latest(k, &self.known))
            .collect();
        vanished.sort_by(|a, b| a.key().cmp(&b.key()));
        for obj in vanished {
            st.enqueue(Delta::new(DeltaKind::Deleted, obj), &self.known);
            deleted += 1;
        }

        if !st.populated {
            st.populated = true;
            st.initial = st.slots.keys().cloned().collect();
        }
        gauge!("delta_queue_depth", st.slots.len() as f64);
        info!(listed = listed.len(), added, updated, deleted, "relist diff queued");
        let synced = st.synced();
        drop(st);
        self.publish_synced(synced);
        self.notify.notify_one();
    }

    /// Enqueue a `Sync` delta for every cached key that is neither pending nor
    /// being processed; the cache lags behind both.
    pub fn resync(&self) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        let mut n = 0usize;
        for obj in self.known.list() {
            let key = obj.key();
            if st.slots.contains_key(&key) || st.in_flight.contains_key(&key) {
                continue;
            }
            st.enqueue(Delta::new(DeltaKind::Sync, obj), &self.known);
            n += 1;
        }
        gauge!("delta_queue_depth", st.slots.len() as f64);
        drop(st);
        debug!(synced = n, "resync queued");
        if n > 0 {
            self.notify.notify_one();
        }
    }

    /// Wait for the next pending key and hand its full delta list to `process`.
    ///
    /// On error the batch is requeued while its attempt count is below
    /// `max_requeues`, and dropped otherwise.
    pub async fn pop<F, E>(&self, process: F) -> Result<ObjectKey, PopError<E>>
    where
        F: FnOnce(&ObjectKey, &[Delta<K>]) -> Result<(), E>,
        E: std::error::Error + 'static,
    {
        let (key, slot) = loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.closed {
                    return Err(PopError::Closed);
                }
                if let Some(next) = st.take_next() {
                    gauge!("delta_queue_depth", st.slots.len() as f64);
                    break next;
                }
            }
            notified.await;
        };

        let result = process(&key, &slot.deltas);

        let mut st = self.lock();
        st.in_flight.remove(&key);
        let out = match result {
            Ok(()) => {
                st.initial.remove(&key);
                Ok(key)
            }
            Err(source) => {
                let requeued = !st.closed && slot.attempts < self.max_requeues;
                if requeued {
                    let attempts = slot.attempts + 1;
                    debug!(key = %key, attempts, "requeueing failed delta batch");
                    st.requeue(key.clone(), Slot { deltas: slot.deltas, attempts });
                } else {
                    warn!(key = %key, attempts = slot.attempts, error = %source, "dropping delta batch after failed processing");
                    counter!("delta_queue_dropped_total", 1u64);
                    st.initial.remove(&key);
                }
                Err(PopError::Process { key, requeued, source })
            }
        };
        let synced = st.synced();
        drop(st);
        self.publish_synced(synced);
        if matches!(out, Err(PopError::Process { requeued: true, .. })) {
            self.notify.notify_one();
        }
        out
    }

    fn publish_synced(&self, synced: bool) {
        if synced && !*self.synced_tx.borrow() {
            self.synced_tx.send_replace(true);
        }
    }

    /// Wake every pending `pop`; they and all later calls return [`PopError::Closed`].
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        debug!("delta queue closed");
    }
}
