//! Identity decoration of a rendered object: namespace, labels, owner
//! reference and content hash.

use kiln_core::object::labels;
use kiln_core::{Json, Lifecycle, ObjectKey};
use serde_json::Map;

/// 64-bit FNV-1a over the canonical (key-sorted) JSON text.
pub fn content_hash(obj: &Json) -> String {
    let text = obj.to_string();
    let mut h: u64 = 0xcbf29ce484222325;
    for b in text.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    format!("{:016x}", h)
}

/// Identity a stamped object carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp<'a> {
    pub owner: &'a ObjectKey,
    pub owner_uid: &'a str,
    pub blueprint: &'a str,
    pub resource: &'a str,
    pub template_kind: &'a str,
    pub template_name: &'a str,
    pub lifecycle: Lifecycle,
}

impl Stamp<'_> {
    /// Labels that locate every object stamped for (owner, resource).
    pub fn selector_labels(&self) -> std::collections::BTreeMap<String, String> {
        [
            (labels::OWNER_KIND, self.owner.kind.as_str()),
            (labels::OWNER_NAME, self.owner.name.as_str()),
            (labels::OWNER_UID, self.owner_uid),
            (labels::RESOURCE_NAME, self.resource),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn all_labels(&self) -> Vec<(&'static str, &str)> {
        vec![
            (labels::OWNER_KIND, self.owner.kind.as_str()),
            (labels::OWNER_NAME, self.owner.name.as_str()),
            (labels::OWNER_UID, self.owner_uid),
            (labels::BLUEPRINT_NAME, self.blueprint),
            (labels::RESOURCE_NAME, self.resource),
            (labels::TEMPLATE_KIND, self.template_kind),
            (labels::TEMPLATE_NAME, self.template_name),
            (labels::TEMPLATE_LIFECYCLE, self.lifecycle.as_str()),
        ]
    }

    /// Decorate `obj` in place and return its content hash. The hash covers the
    /// rendered object plus identity, so it changes whenever the stamp would.
    pub fn apply(&self, obj: &mut Json) -> String {
        if !obj.is_object() {
            *obj = Json::Object(Map::new());
        }
        let Some(root) = obj.as_object_mut() else { return String::new() };
        let meta = root.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
        if !meta.is_object() {
            *meta = Json::Object(Map::new());
        }
        let Some(meta) = meta.as_object_mut() else { return String::new() };

        if let Some(ns) = self.owner.namespace.as_deref() {
            meta.entry("namespace").or_insert_with(|| Json::String(ns.to_string()));
        }
        if self.lifecycle.is_append_only() {
            // revisions always get server-generated names
            let base = meta
                .remove("name")
                .and_then(|n| n.as_str().map(|s| format!("{}-", s)))
                .or_else(|| meta.get("generateName").and_then(|g| g.as_str()).map(|s| s.to_string()))
                .unwrap_or_else(|| format!("{}-{}-", self.owner.name, self.resource));
            meta.insert("generateName".into(), Json::String(base));
        } else if !meta.contains_key("name") && !meta.contains_key("generateName") {
            meta.insert("generateName".into(), Json::String(format!("{}-{}-", self.owner.name, self.resource)));
        }

        let lbls = meta.entry("labels").or_insert_with(|| Json::Object(Map::new()));
        if let Some(l) = lbls.as_object_mut() {
            for (k, v) in self.all_labels() {
                l.insert(k.to_string(), Json::String(v.to_string()));
            }
        }
        meta.insert(
            "ownerReferences".into(),
            serde_json::json!([{
                "apiVersion": self.owner.api_version,
                "kind": self.owner.kind,
                "name": self.owner.name,
                "uid": self.owner_uid,
                "controller": true,
                "blockOwnerDeletion": true,
            }]),
        );
        let emptied = match meta.get_mut("annotations").and_then(|a| a.as_object_mut()) {
            Some(a) => a.remove(labels::CONTENT_HASH).is_some() && a.is_empty(),
            None => false,
        };
        if emptied {
            meta.remove("annotations");
        }

        let hash = content_hash(obj);
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            let ann = meta.entry("annotations").or_insert_with(|| Json::Object(Map::new()));
            if let Some(a) = ann.as_object_mut() {
                a.insert(labels::CONTENT_HASH.into(), Json::String(hash.clone()));
            }
        }
        hash
    }
}
