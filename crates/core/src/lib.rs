//! rekon core types: object keys, deltas and the upstream list/watch contract.

#![forbid(unsafe_code)]

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

mod object;
mod source;

pub use object::{DynObject, ObjectError};
pub use source::{ListerWatcher, ObjectList, SourceError, WatchEvent, WatchStream};

pub type Uid = [u8; 16];

/// Stable identity of a resource: `namespace/name`, or `name` when cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{}/{}", ns, name)),
            _ => Self(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split back into `(namespace, name)`.
    pub fn parts(&self) -> (Option<&str>, &str) {
        match self.0.split_once('/') {
            Some((ns, name)) => (Some(ns), name),
            None => (None, self.0.as_str()),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ObjectKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ObjectKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ObjectKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity and version accessors the pipeline needs from an observed object.
pub trait Resource: fmt::Debug + Send + Sync + 'static {
    fn name(&self) -> &str;
    fn namespace(&self) -> Option<&str>;

    /// Server-assigned identity; differs when an object is re-created under the same key.
    fn uid(&self) -> Option<Uid> {
        None
    }

    fn resource_version(&self) -> Option<&str> {
        None
    }

    fn label(&self, _key: &str) -> Option<&str> {
        None
    }

    fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace(), self.name())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    /// Periodic re-delivery of unchanged state.
    Sync,
}

/// A typed change record carrying an immutable snapshot of the object.
#[derive(Debug)]
pub struct Delta<K> {
    pub kind: DeltaKind,
    pub key: ObjectKey,
    pub object: Arc<K>,
}

impl<K: Resource> Delta<K> {
    pub fn new(kind: DeltaKind, object: Arc<K>) -> Self {
        let key = object.key();
        Self { kind, key, object }
    }
}

impl<K> Clone for Delta<K> {
    fn clone(&self) -> Self {
        Self { kind: self.kind, key: self.key.clone(), object: Arc::clone(&self.object) }
    }
}

/// True when both sides carry a uid and the uids differ.
pub fn identity_changed<K: Resource>(old: &K, new: &K) -> bool {
    matches!((old.uid(), new.uid()), (Some(a), Some(b)) if a != b)
}

pub mod prelude {
    pub use super::{
        identity_changed, Delta, DeltaKind, DynObject, ListerWatcher, ObjectKey, ObjectList,
        Resource, SourceError, Uid, WatchEvent, WatchStream,
    };
}
