#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use rekon_core::{Delta, DeltaKind, DynObject, ObjectKey};
use rekon_store::{DeltaQueue, PopError, Writer};

fn obj(name: &str, rv: &str, uid: u8) -> Arc<DynObject> {
    let raw = serde_json::json!({
        "metadata": {
            "name": name,
            "namespace": "ns",
            "uid": format!("00000000-0000-0000-0000-{:012}", uid),
            "resourceVersion": rv,
        }
    });
    Arc::new(DynObject::from_value(raw).unwrap())
}

fn delta(kind: DeltaKind, o: &Arc<DynObject>) -> Delta<DynObject> {
    Delta::new(kind, Arc::clone(o))
}

type Popped = (ObjectKey, Vec<(DeltaKind, String)>);

/// Pop one slot without failing, recording what was delivered.
async fn pop_one(q: &DeltaQueue<DynObject>) -> Popped {
    let mut seen = Vec::new();
    let key = q
        .pop(|_, deltas| {
            seen = deltas
                .iter()
                .map(|d| (d.kind, d.object.resource_version.clone().unwrap_or_default()))
                .collect();
            Ok::<(), std::io::Error>(())
        })
        .await
        .unwrap();
    (key, seen)
}

fn kinds(p: &Popped) -> Vec<DeltaKind> {
    p.1.iter().map(|(k, _)| *k).collect()
}

#[tokio::test]
async fn add_then_delete_collapses_to_nothing() {
    let w = Writer::new();
    let q = DeltaQueue::new(w.as_reader(), 1);
    let a = obj("a", "1", 1);
    q.push(delta(DeltaKind::Added, &a));
    q.push(delta(DeltaKind::Updated, &obj("a", "2", 1)));
    q.push(delta(DeltaKind::Deleted, &a));
    assert!(q.is_empty());
}

#[tokio::test]
async fn deltas_fold_into_one_slot_in_fifo_order() {
    let w = Writer::new();
    let q = DeltaQueue::new(w.as_reader(), 1);
    q.push(delta(DeltaKind::Added, &obj("a", "1", 1)));
    q.push(delta(DeltaKind::Added, &obj("b", "1", 2)));
    q.push(delta(DeltaKind::Updated, &obj("a", "2", 1)));
    q.push(delta(DeltaKind::Updated, &obj("a", "3", 1)));
    assert_eq!(q.len(), 2);

    let first = pop_one(&q).await;
    assert_eq!(first.0.as_str(), "ns/a");
    assert_eq!(
        first.1,
        vec![
            (DeltaKind::Added, "1".to_string()),
            (DeltaKind::Updated, "2".to_string()),
            (DeltaKind::Updated, "3".to_string()),
        ]
    );
    let second = pop_one(&q).await;
    assert_eq!(second.0.as_str(), "ns/b");
    assert!(q.is_empty());
}

#[tokio::test]
async fn delta_after_delete_replaces_it() {
    let w = Writer::new();
    let a = obj("a", "1", 1);
    w.upsert(Arc::clone(&a));
    let q = DeltaQueue::new(w.as_reader(), 1);

    q.push(delta(DeltaKind::Updated, &obj("a", "2", 1)));
    q.push(delta(DeltaKind::Deleted, &a));
    q.push(delta(DeltaKind::Added, &obj("a", "7", 9)));
    let p = pop_one(&q).await;
    assert_eq!(kinds(&p), vec![DeltaKind::Updated, DeltaKind::Added]);
    assert_eq!(p.1[1].1, "7");
}

#[tokio::test]
async fn add_delete_of_a_cached_key_is_delivered() {
    let w = Writer::new();
    let a = obj("a", "1", 1);
    w.upsert(Arc::clone(&a));
    let q = DeltaQueue::new(w.as_reader(), 1);

    // the consumer already holds `a`; the delete must reach it
    q.push(delta(DeltaKind::Added, &obj("a", "2", 1)));
    q.push(delta(DeltaKind::Deleted, &a));
    let p = pop_one(&q).await;
    assert_eq!(kinds(&p), vec![DeltaKind::Added, DeltaKind::Deleted]);
}

#[tokio::test]
async fn failed_batch_is_requeued_once_then_dropped() {
    let w = Writer::new();
    let q = DeltaQueue::new(w.as_reader(), 1);
    q.push(delta(DeltaKind::Added, &obj("a", "1", 1)));

    let fail = |_: &ObjectKey, _: &[Delta<DynObject>]| Err::<(), _>(std::io::Error::other("boom"));
    match q.pop(fail).await {
        Err(PopError::Process { requeued, .. }) => assert!(requeued),
        other => panic!("unexpected {:?}", other.map(|k| k.to_string())),
    }
    assert_eq!(q.len(), 1);
    match q.pop(fail).await {
        Err(PopError::Process { requeued, .. }) => assert!(!requeued),
        other => panic!("unexpected {:?}", other.map(|k| k.to_string())),
    }
    assert!(q.is_empty());
}

#[tokio::test]
async fn requeue_keeps_per_key_order() {
    let w = Writer::new();
    let q = DeltaQueue::new(w.as_reader(), 3);
    q.push(delta(DeltaKind::Added, &obj("a", "1", 1)));
    q.push(delta(DeltaKind::Added, &obj("b", "1", 2)));

    let res = q
        .pop(|_, _| {
            // a newer change lands while the first batch is being processed
            q.push(delta(DeltaKind::Updated, &obj("a", "2", 1)));
            Err(std::io::Error::other("handler failed"))
        })
        .await;
    assert!(matches!(res, Err(PopError::Process { requeued: true, .. })));

    // `a` kept its slot from the newer push, which sits behind `b`
    let b = pop_one(&q).await;
    assert_eq!(b.0.as_str(), "ns/b");
    let a = pop_one(&q).await;
    assert_eq!(a.0.as_str(), "ns/a");
    assert_eq!(
        a.1,
        vec![(DeltaKind::Added, "1".to_string()), (DeltaKind::Updated, "2".to_string())]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_unblocks_pending_pop() {
    let w: Writer<DynObject> = Writer::new();
    let q = Arc::new(DeltaQueue::new(w.as_reader(), 1));
    let waiter = tokio::spawn({
        let q = Arc::clone(&q);
        async move { q.pop(|_, _| Ok::<(), std::io::Error>(())).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    q.close();
    let res = tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
    assert!(matches!(res, Err(PopError::Closed)));
    // pushes after close are ignored
    q.push(delta(DeltaKind::Added, &obj("a", "1", 1)));
    assert!(q.is_empty());
}

#[tokio::test]
async fn resync_skips_keys_with_pending_deltas() {
    let w = Writer::new();
    w.upsert(obj("a", "1", 1));
    w.upsert(obj("b", "1", 2));
    let q = DeltaQueue::new(w.as_reader(), 1);
    q.push(delta(DeltaKind::Updated, &obj("b", "2", 2)));
    q.resync();
    assert_eq!(q.len(), 2);

    let b = pop_one(&q).await;
    assert_eq!(b.0.as_str(), "ns/b");
    assert_eq!(kinds(&b), vec![DeltaKind::Updated]);
    let a = pop_one(&q).await;
    assert_eq!(kinds(&a), vec![DeltaKind::Sync]);
}

#[tokio::test]
async fn replace_enqueues_only_what_changed() {
    let w = Writer::new();
    w.upsert(obj("same", "1", 1));
    w.upsert(obj("bumped", "1", 2));
    w.upsert(obj("recreated", "1", 3));
    w.upsert(obj("gone", "1", 4));
    let q = DeltaQueue::new(w.as_reader(), 1);

    let listing = vec![
        obj("same", "1", 1),
        obj("bumped", "2", 2),
        obj("recreated", "1", 30),
        obj("fresh", "1", 5),
    ];
    q.replace(listing.into_iter().map(|o| (*o).clone()).collect());

    let mut got = Vec::new();
    while !q.is_empty() {
        let p = pop_one(&q).await;
        got.push((p.0.to_string(), kinds(&p)));
    }
    got.sort();
    assert_eq!(
        got,
        vec![
            ("ns/bumped".to_string(), vec![DeltaKind::Updated]),
            ("ns/fresh".to_string(), vec![DeltaKind::Added]),
            ("ns/gone".to_string(), vec![DeltaKind::Deleted]),
            ("ns/recreated".to_string(), vec![DeltaKind::Added]),
        ]
    );
}

#[tokio::test]
async fn synced_after_initial_listing_is_processed() {
    let w = Writer::new();
    let q = DeltaQueue::new(w.as_reader(), 1);
    let rx = q.subscribe_synced();
    assert!(!q.has_synced());
    q.replace(vec![(*obj("a", "1", 1)).clone(), (*obj("b", "1", 2)).clone()]);
    assert!(!q.has_synced());
    pop_one(&q).await;
    assert!(!q.has_synced());
    pop_one(&q).await;
    assert!(q.has_synced());
    assert!(*rx.borrow());
}

#[tokio::test]
async fn empty_listing_syncs_immediately() {
    let w: Writer<DynObject> = Writer::new();
    let q = DeltaQueue::new(w.as_reader(), 1);
    q.replace(Vec::new());
    assert!(q.has_synced());
}

/// Apply a batch to the cache the way the dispatch loop does.
fn apply(w: &Writer<DynObject>, deltas: &[Delta<DynObject>]) {
    for d in deltas {
        match d.kind {
            DeltaKind::Deleted => {
                w.delete(&d.key);
            }
            _ => {
                w.upsert(Arc::clone(&d.object));
            }
        }
    }
}

fn cached_rv(w: &Writer<DynObject>, name: &str) -> Option<String> {
    w.as_reader().get(&ObjectKey::from(format!("ns/{}", name))).and_then(|o| o.resource_version.clone())
}

#[tokio::test]
async fn resync_while_batch_in_flight_does_not_roll_back() {
    let w = Writer::new();
    w.upsert(obj("a", "1", 1));
    let q = DeltaQueue::new(w.as_reader(), 1);
    q.push(delta(DeltaKind::Updated, &obj("a", "2", 1)));

    q.pop(|_, deltas| {
        // cache still holds rv 1 here
        q.resync();
        apply(&w, deltas);
        Ok::<(), std::io::Error>(())
    })
    .await
    .unwrap();
    assert!(q.is_empty());
    assert_eq!(cached_rv(&w, "a").as_deref(), Some("2"));

    // once the batch is applied, resync covers the key again with the new state
    q.resync();
    let a = pop_one(&q).await;
    assert_eq!(a.1, vec![(DeltaKind::Sync, "2".to_string())]);
}

#[tokio::test]
async fn delete_pushed_while_batch_in_flight_lands_after_it() {
    let w = Writer::new();
    let q = DeltaQueue::new(w.as_reader(), 1);
    let a = obj("a", "1", 1);
    q.push(delta(DeltaKind::Added, &a));

    q.pop(|_, deltas| {
        q.push(delta(DeltaKind::Deleted, &a));
        apply(&w, deltas);
        Ok::<(), std::io::Error>(())
    })
    .await
    .unwrap();
    assert_eq!(cached_rv(&w, "a").as_deref(), Some("1"));

    let next = pop_one(&q).await;
    assert_eq!(kinds(&next), vec![DeltaKind::Deleted]);
    w.delete(&next.0);
    assert!(w.as_reader().is_empty());
    assert!(q.is_empty());
}

#[tokio::test]
async fn relist_while_batch_in_flight_diffs_against_it() {
    let w = Writer::new();
    let q = DeltaQueue::new(w.as_reader(), 1);
    q.push(delta(DeltaKind::Added, &obj("a", "1", 1)));
    q.push(delta(DeltaKind::Added, &obj("b", "1", 2)));

    q.pop(|key, deltas| {
        assert_eq!(key.as_str(), "ns/a");
        // a unchanged, b vanished upstream
        q.replace(vec![(*obj("a", "1", 1)).clone()]);
        apply(&w, deltas);
        Ok::<(), std::io::Error>(())
    })
    .await
    .unwrap();

    // b's pending Added collapses with the Deleted; nothing is queued for a
    assert!(q.is_empty());
    assert_eq!(cached_rv(&w, "a").as_deref(), Some("1"));
    assert_eq!(cached_rv(&w, "b"), None);
}
