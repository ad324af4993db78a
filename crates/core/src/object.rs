//! Object identities and raw-metadata helpers.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Json;

/// `apiVersion` + `kind` pair identifying a type of object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeKey {
    pub api_version: String,
    pub kind: String,
}

impl TypeKey {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into() }
    }

    /// `(group, version)` split of `apiVersion`; the core group is empty.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", self.api_version.as_str()),
        }
    }

    pub fn of(obj: &Json) -> Option<Self> {
        let api_version = obj.get("apiVersion")?.as_str()?.to_string();
        let kind = obj.get("kind")?.as_str()?.to_string();
        Some(Self { api_version, kind })
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.api_version, self.kind) }
}

/// Identity of a single object: (kind, namespace, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(ty: &TypeKey, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            api_version: ty.api_version.clone(),
            kind: ty.kind.clone(),
            namespace: namespace.map(|s| s.to_string()),
            name: name.into(),
        }
    }

    pub fn type_key(&self) -> TypeKey { TypeKey::new(self.api_version.clone(), self.kind.clone()) }

    /// Key of a raw object; `None` when apiVersion/kind/name are missing.
    pub fn of(obj: &Json) -> Option<Self> {
        let ty = TypeKey::of(obj)?;
        let name = meta::str_field(obj, "name")?;
        Some(Self::new(&ty, meta::str_field(obj, "namespace"), name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Labels and annotations stamped onto every object Kiln creates.
pub mod labels {
    pub const OWNER_KIND: &str = "kiln.dev/owner-kind";
    pub const OWNER_NAME: &str = "kiln.dev/owner-name";
    pub const OWNER_UID: &str = "kiln.dev/owner-uid";
    pub const BLUEPRINT_NAME: &str = "kiln.dev/blueprint-name";
    pub const RESOURCE_NAME: &str = "kiln.dev/resource-name";
    pub const TEMPLATE_KIND: &str = "kiln.dev/template-kind";
    pub const TEMPLATE_NAME: &str = "kiln.dev/template-name";
    pub const TEMPLATE_LIFECYCLE: &str = "kiln.dev/template-lifecycle";

    pub const CONTENT_HASH: &str = "kiln.dev/content-hash";
    /// Per (owner, resource) sequence number of append-only revisions.
    pub const REVISION: &str = "kiln.dev/revision";
}

/// Accessors over raw `metadata`.
pub mod meta {
    use super::*;

    pub fn str_field<'a>(obj: &'a Json, field: &str) -> Option<&'a str> {
        obj.get("metadata")?.get(field)?.as_str()
    }

    pub fn string_map(obj: &Json, field: &str) -> BTreeMap<String, String> {
        obj.get("metadata")
            .and_then(|m| m.get(field))
            .and_then(|v| v.as_object())
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
            .unwrap_or_default()
    }

    pub fn labels(obj: &Json) -> BTreeMap<String, String> { string_map(obj, "labels") }
    pub fn annotations(obj: &Json) -> BTreeMap<String, String> { string_map(obj, "annotations") }

    pub fn label<'a>(obj: &'a Json, key: &str) -> Option<&'a str> {
        obj.get("metadata")?.get("labels")?.get(key)?.as_str()
    }

    pub fn annotation<'a>(obj: &'a Json, key: &str) -> Option<&'a str> {
        obj.get("metadata")?.get("annotations")?.get(key)?.as_str()
    }

    /// Creation timestamp parsed with sub-second precision when present.
    pub fn creation_ts(obj: &Json) -> Option<chrono::DateTime<chrono::Utc>> {
        str_field(obj, "creationTimestamp")
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
    }

    /// Revision number stamped at create time; `None` for objects that predate it.
    pub fn revision(obj: &Json) -> Option<u64> {
        annotation(obj, super::labels::REVISION).and_then(|s| s.parse().ok())
    }

    pub fn generation(obj: &Json) -> i64 {
        obj.get("metadata").and_then(|m| m.get("generation")).and_then(|v| v.as_i64()).unwrap_or(0)
    }

    /// True when `obj` carries an owner reference to `owner_uid`.
    pub fn is_owned_by(obj: &Json, owner_uid: &str) -> bool {
        obj.get("metadata")
            .and_then(|m| m.get("ownerReferences"))
            .and_then(|r| r.as_array())
            .map(|refs| refs.iter().any(|r| r.get("uid").and_then(|u| u.as_str()) == Some(owner_uid)))
            .unwrap_or(false)
    }

    /// Status conditions as `(type, status, reason, message)` views.
    pub fn conditions(obj: &Json) -> Vec<(&str, &str, &str, &str)> {
        obj.get("status")
            .and_then(|s| s.get("conditions"))
            .and_then(|c| c.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|c| {
                        let t = c.get("type")?.as_str()?;
                        let s = c.get("status").and_then(|v| v.as_str()).unwrap_or("");
                        let r = c.get("reason").and_then(|v| v.as_str()).unwrap_or("");
                        let m = c.get("message").and_then(|v| v.as_str()).unwrap_or("");
                        Some((t, s, r, m))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
