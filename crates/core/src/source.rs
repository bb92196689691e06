//! Upstream list/watch contract. Transports implement [`ListerWatcher`]; the
//! reflector only ever talks to this trait.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::Resource;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The requested resource version is gone; the caller must re-list.
    #[error("resource version expired: {0}")]
    Expired(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
}

/// Full listing plus the resource version it was taken at.
#[derive(Debug, Clone)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

#[derive(Debug)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker; carries only a resource version.
    Bookmark(String),
    Error(SourceError),
}

pub type WatchStream<K> = BoxStream<'static, WatchEvent<K>>;

/// Watching from a resource version must deliver every change since that version,
/// or fail with [`SourceError::Expired`].
#[async_trait]
pub trait ListerWatcher: Send + Sync + 'static {
    type Object: Resource;

    async fn list(&self) -> Result<ObjectList<Self::Object>, SourceError>;

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<Self::Object>, SourceError>;
}
