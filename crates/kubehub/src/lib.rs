//! rekon kubehub: discovery and a `ListerWatcher` over the Kubernetes API.

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchParams},
    core::{DynamicObject, ErrorResponse, GroupVersionKind, WatchEvent as KubeEvent},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::histogram;
use rekon_core::{DynObject, ListerWatcher, ObjectList, SourceError, WatchEvent, WatchStream};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Server-side watch timeout; the API server caps it below five minutes.
const WATCH_TIMEOUT_SECS: u32 = 290;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Served resources (incl. CRDs), sorted by group, version, kind.
pub async fn discover() -> Result<Vec<DiscoveredResource>> {
    let client = Client::try_default().await.context("building kube client")?;
    let discovery = Discovery::new(client).run().await.context("running discovery")?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await.context("running discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn to_dyn(obj: &DynamicObject) -> Result<DynObject, SourceError> {
    let raw = serde_json::to_value(obj).map_err(|e| SourceError::Decode(e.to_string()))?;
    DynObject::from_value(raw).map_err(|e| SourceError::Decode(e.to_string()))
}

fn api_error(resp: &ErrorResponse) -> SourceError {
    if resp.code == 410 {
        SourceError::Expired(resp.message.clone())
    } else {
        SourceError::Transport(format!("{} ({}): {}", resp.reason, resp.code, resp.message))
    }
}

fn map_kube_err(err: kube::Error) -> SourceError {
    match err {
        kube::Error::Api(resp) => api_error(&resp),
        other => SourceError::Transport(other.to_string()),
    }
}

fn convert_event(ev: KubeEvent<DynamicObject>) -> WatchEvent<DynObject> {
    let converted = match ev {
        KubeEvent::Added(o) => to_dyn(&o).map(WatchEvent::Added),
        KubeEvent::Modified(o) => to_dyn(&o).map(WatchEvent::Modified),
        KubeEvent::Deleted(o) => to_dyn(&o).map(WatchEvent::Deleted),
        KubeEvent::Bookmark(b) => Ok(WatchEvent::Bookmark(b.metadata.resource_version)),
        KubeEvent::Error(resp) => Ok(WatchEvent::Error(api_error(&resp))),
    };
    converted.unwrap_or_else(WatchEvent::Error)
}

/// List/watch source for one resource type, optionally limited to a namespace.
#[derive(Clone)]
pub struct KubeSource {
    api: Api<DynamicObject>,
    gvk_key: String,
}

impl KubeSource {
    /// Resolve `gvk_key` (`v1/Kind` or `group/v1/Kind`) through discovery and bind an API handle.
    pub async fn connect(gvk_key: &str, namespace: Option<&str>) -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        };
        info!(gvk = %gvk_key, ns = ?namespace, namespaced, "kube source ready");
        Ok(Self { api, gvk_key: gvk_key.to_string() })
    }

    pub fn from_api(api: Api<DynamicObject>, gvk_key: &str) -> Self {
        Self { api, gvk_key: gvk_key.to_string() }
    }

    pub fn gvk_key(&self) -> &str {
        &self.gvk_key
    }
}

#[async_trait]
impl ListerWatcher for KubeSource {
    type Object = DynObject;

    async fn list(&self) -> Result<ObjectList<DynObject>, SourceError> {
        let started = Instant::now();
        let list = self.api.list(&ListParams::default()).await.map_err(map_kube_err)?;
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let mut items = Vec::with_capacity(list.items.len());
        for o in &list.items {
            match to_dyn(o) {
                Ok(obj) => items.push(obj),
                Err(e) => warn!(gvk = %self.gvk_key, error = %e, "skipping undecodable object"),
            }
        }
        let took_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!("kube_list_ms", took_ms);
        debug!(gvk = %self.gvk_key, items = items.len(), rv = %resource_version, took_ms, "list");
        Ok(ObjectList { items, resource_version })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<DynObject>, SourceError> {
        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = self.api.watch(&params, resource_version).await.map_err(map_kube_err)?;
        debug!(gvk = %self.gvk_key, rv = %resource_version, "watch");
        Ok(stream
            .map(|item| match item {
                Ok(ev) => convert_event(ev),
                Err(e) => WatchEvent::Error(map_kube_err(e)),
            })
            .boxed())
    }
}

/// One-shot listing.
pub async fn list_once(gvk_key: &str, namespace: Option<&str>) -> Result<Vec<DynObject>> {
    let source = KubeSource::connect(gvk_key, namespace).await?;
    let list = source.list().await.with_context(|| format!("listing {}", gvk_key))?;
    Ok(list.items)
}
