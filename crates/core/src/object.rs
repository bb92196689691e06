use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{Resource, Uid};

#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("object missing metadata.name")]
    MissingName,
    #[error("invalid metadata.uid {0:?}: {1}")]
    InvalidUid(String, uuid::Error),
}

/// Schemaless object with its identity metadata lifted out of the raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynObject {
    pub uid: Option<Uid>,
    pub namespace: Option<String>,
    pub name: String,
    pub resource_version: Option<String>,
    /// Seconds since epoch; 0 when absent or unparsable.
    pub creation_ts: i64,
    pub labels: SmallVec<[(String, String); 8]>,
    /// Raw object (possibly stripped of oversized fields under feature flags)
    pub raw: serde_json::Value,
}

impl DynObject {
    pub fn from_value(mut raw: serde_json::Value) -> Result<Self, ObjectError> {
        #[cfg(feature = "strip-managed-fields")]
        strip_managed_fields(&mut raw);

        let meta = raw.get("metadata");
        let str_field = |field: &str| {
            meta.and_then(|m| m.get(field)).and_then(|v| v.as_str()).map(|s| s.to_string())
        };
        let name = str_field("name").filter(|n| !n.is_empty()).ok_or(ObjectError::MissingName)?;
        let namespace = str_field("namespace").filter(|ns| !ns.is_empty());
        let resource_version = str_field("resourceVersion");
        let uid = match str_field("uid") {
            Some(s) => Some(to_uid(&s)?),
            None => None,
        };
        let creation_ts = str_field("creationTimestamp")
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);
        let labels = meta
            .and_then(|m| m.get("labels"))
            .and_then(|v| v.as_object())
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self { uid, namespace, name, resource_version, creation_ts, labels, raw })
    }

    /// `kind` from the raw object, if present.
    pub fn kind(&self) -> Option<&str> {
        self.raw.get("kind").and_then(|v| v.as_str())
    }
}

impl Resource for DynObject {
    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    fn uid(&self) -> Option<Uid> {
        self.uid
    }

    fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

#[cfg(feature = "strip-managed-fields")]
fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(obj) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        obj.remove("managedFields");
    }
}

fn to_uid(uid_str: &str) -> Result<Uid, ObjectError> {
    let u = uuid::Uuid::parse_str(uid_str)
        .map_err(|e| ObjectError::InvalidUid(uid_str.to_string(), e))?;
    Ok(*u.as_bytes())
}
