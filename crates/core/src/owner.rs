//! Owner objects (the selectable input of a reconcile) and their status shape.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::object::{meta, ObjectKey};
use crate::Json;

/// Maximum length of an output preview, in bytes.
pub const PREVIEW_LIMIT: usize = 1024;

/// Owner object with the fields the engine reads eagerly; `raw` keeps the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct Owner {
    pub key: ObjectKey,
    pub uid: String,
    pub generation: i64,
    pub labels: BTreeMap<String, String>,
    pub raw: Json,
    pub status: OwnerStatus,
}

impl Owner {
    /// Build from a raw document; `None` when it lacks apiVersion/kind/name.
    pub fn from_object(raw: Json) -> Option<Self> {
        let key = ObjectKey::of(&raw)?;
        let uid = meta::str_field(&raw, "uid").unwrap_or_default().to_string();
        let generation = meta::generation(&raw);
        let labels = meta::labels(&raw);
        let status = raw
            .get("status")
            .and_then(|s| serde_json::from_value::<OwnerStatus>(s.clone()).ok())
            .unwrap_or_default();
        Some(Self { key, uid, generation, labels, raw, status })
    }

    pub fn namespace(&self) -> Option<&str> { self.key.namespace.as_deref() }

    /// `spec.params` of the owner as a name to value map.
    pub fn params(&self) -> BTreeMap<String, Json> {
        self.raw
            .get("spec")
            .and_then(|s| s.get("params"))
            .and_then(|p| p.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|p| Some((p.get("name")?.as_str()?.to_string(), p.get("value").cloned().unwrap_or(Json::Null))))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Named value extracted from a stamped object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub name: String,
    pub value: Json,
}

impl Output {
    pub const DEFAULT_NAME: &'static str = "config";

    pub fn new(name: impl Into<String>, value: Json) -> Self { Self { name: name.into(), value } }

    /// String form of the value, cut at a char boundary within [`PREVIEW_LIMIT`].
    pub fn preview(&self) -> String {
        let s = match &self.value {
            Json::String(s) => s.clone(),
            other => other.to_string(),
        };
        truncate(s, PREVIEW_LIMIT)
    }

    pub fn status(&self) -> OutputStatus { OutputStatus { name: self.name.clone(), preview: self.preview() } }
}

fn truncate(mut s: String, limit: usize) -> String {
    if s.len() <= limit {
        return s;
    }
    let mut cut = limit;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
    s
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputStatus {
    pub name: String,
    pub preview: String,
}

/// `{kind, name}` reference to a template as reported in status.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateIdent {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlueprintRef {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<TemplateIdent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stamped_ref: Option<ObjectKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputStatus>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blueprint_ref: Option<BlueprintRef>,
}

impl OwnerStatus {
    pub fn resource(&self, name: &str) -> Option<&ResourceStatus> { self.resources.iter().find(|r| r.name == name) }
}
