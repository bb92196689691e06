#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use rekon_controller::{EventHandler, HandlerError};
use rekon_core::{ListerWatcher, ObjectList, Resource, SourceError, Uid, WatchEvent, WatchStream};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Obj {
    pub name: String,
    pub uid: u8,
    pub rv: String,
    pub value: u32,
}

impl Resource for Obj {
    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        Some("default")
    }

    fn uid(&self) -> Option<Uid> {
        Some([self.uid; 16])
    }

    fn resource_version(&self) -> Option<&str> {
        Some(&self.rv)
    }
}

pub fn obj(name: &str, rv: u32, value: u32) -> Obj {
    Obj { name: name.to_string(), uid: 1, rv: rv.to_string(), value }
}

pub fn recreated(name: &str, uid: u8, rv: u32) -> Obj {
    Obj { name: name.to_string(), uid, rv: rv.to_string(), value: 0 }
}

pub fn key(name: &str) -> rekon_core::ObjectKey {
    rekon_core::ObjectKey::new(Some("default"), name)
}

pub fn list(rv: u32, items: Vec<Obj>) -> Result<ObjectList<Obj>, SourceError> {
    Ok(ObjectList { items, resource_version: rv.to_string() })
}

/// Events replayed by one `watch` call, optionally held back until `gate` is
/// notified; the stream then ends or stays open.
pub struct WatchScript {
    pub events: Vec<WatchEvent<Obj>>,
    pub then_end: bool,
    pub gate: Option<Arc<Notify>>,
}

pub fn watch_open(events: Vec<WatchEvent<Obj>>) -> Result<WatchScript, SourceError> {
    Ok(WatchScript { events, then_end: false, gate: None })
}

pub fn watch_ending(events: Vec<WatchEvent<Obj>>) -> Result<WatchScript, SourceError> {
    Ok(WatchScript { events, then_end: true, gate: None })
}

pub fn watch_gated(events: Vec<WatchEvent<Obj>>, gate: &Arc<Notify>) -> Result<WatchScript, SourceError> {
    Ok(WatchScript { events, then_end: false, gate: Some(Arc::clone(gate)) })
}

/// In-memory upstream answering `list`/`watch` from scripts, in call order.
/// An exhausted list script fails with a transport error; an exhausted watch
/// script yields a stream that never produces anything.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    lists: Arc<Mutex<VecDeque<Result<ObjectList<Obj>, SourceError>>>>,
    watches: Arc<Mutex<VecDeque<Result<WatchScript, SourceError>>>>,
    pub list_calls: Arc<Mutex<usize>>,
    pub watch_rvs: Arc<Mutex<Vec<String>>>,
}

impl ScriptedSource {
    pub fn new(
        lists: Vec<Result<ObjectList<Obj>, SourceError>>,
        watches: Vec<Result<WatchScript, SourceError>>,
    ) -> Self {
        Self {
            lists: Arc::new(Mutex::new(lists.into())),
            watches: Arc::new(Mutex::new(watches.into())),
            ..Default::default()
        }
    }

    pub fn list_calls(&self) -> usize {
        *self.list_calls.lock().unwrap()
    }

    pub fn watch_rvs(&self) -> Vec<String> {
        self.watch_rvs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ListerWatcher for ScriptedSource {
    type Object = Obj;

    async fn list(&self) -> Result<ObjectList<Obj>, SourceError> {
        *self.list_calls.lock().unwrap() += 1;
        let next = self.lists.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(SourceError::Transport("list script exhausted".into())))
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<Obj>, SourceError> {
        self.watch_rvs.lock().unwrap().push(resource_version.to_string());
        let next = self.watches.lock().unwrap().pop_front();
        match next {
            Some(Ok(script)) => {
                let WatchScript { events, then_end, gate } = script;
                let events = stream::once(async move {
                    if let Some(gate) = gate {
                        gate.notified().await;
                    }
                    stream::iter(events)
                })
                .flatten();
                if then_end {
                    Ok(events.boxed())
                } else {
                    Ok(events.chain(stream::pending()).boxed())
                }
            }
            Some(Err(e)) => Err(e),
            None => Ok(stream::pending().boxed()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Add(String, u32),
    Update(String, u32),
    Delete(String, u8),
}

/// Records every callback; `on_add` and `on_update` fail for names in `failing`.
#[derive(Default)]
pub struct Recorder {
    pub seen: Mutex<Vec<Seen>>,
    pub failing: Vec<String>,
}

impl Recorder {
    pub fn failing_on(names: &[&str]) -> Self {
        Self { failing: names.iter().map(|n| n.to_string()).collect(), ..Default::default() }
    }

    fn check(&self, obj: &Obj) -> Result<(), HandlerError> {
        if self.failing.contains(&obj.name) {
            return Err(HandlerError::new(format!("refusing {}", obj.name)));
        }
        Ok(())
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

impl EventHandler<Obj> for Recorder {
    fn on_add(&self, obj: &Arc<Obj>) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(Seen::Add(obj.name.clone(), obj.value));
        self.check(obj)
    }

    fn on_update(&self, _old: &Arc<Obj>, new: &Arc<Obj>) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(Seen::Update(new.name.clone(), new.value));
        self.check(new)
    }

    fn on_delete(&self, obj: &Arc<Obj>) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(Seen::Delete(obj.name.clone(), obj.uid));
        Ok(())
    }
}

/// Poll `cond` until it holds; panics after `limit` of (possibly paused) tokio time.
pub async fn eventually<F: Fn() -> bool>(limit: Duration, cond: F) {
    let waited = tokio::time::timeout(limit, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not met within {:?}", limit);
}
