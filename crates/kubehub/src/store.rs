use std::collections::BTreeMap;

use async_trait::async_trait;
use kiln_core::object::meta;
use kiln_core::{Json, ObjectKey, ObjectStore, StoreError, TypeKey};
use kube::{
    api::{DeleteParams, ListParams, PostParams},
    core::DynamicObject,
};
use tracing::debug;

use crate::{map_error, strip_managed_fields, Resources};

/// [`ObjectStore`] over the API server using dynamic objects.
#[derive(Clone)]
pub struct KubeStore {
    resources: Resources,
}

impl KubeStore {
    pub fn new(resources: Resources) -> Self { Self { resources } }

    pub fn resources(&self) -> &Resources { &self.resources }
}

fn to_dynamic(obj: &Json) -> Result<DynamicObject, StoreError> {
    serde_json::from_value(obj.clone()).map_err(|e| StoreError::Rejected(format!("not a kubernetes object: {}", e)))
}

fn to_json(obj: &DynamicObject) -> Result<Json, StoreError> {
    let mut raw = serde_json::to_value(obj).map_err(|e| StoreError::Unavailable(format!("serializing object: {}", e)))?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

fn type_of(obj: &Json) -> Result<TypeKey, StoreError> {
    TypeKey::of(obj).ok_or_else(|| StoreError::Rejected("object must carry apiVersion and kind".into()))
}

fn name_of(obj: &Json) -> Result<&str, StoreError> {
    meta::str_field(obj, "name").ok_or_else(|| StoreError::Rejected("object must carry metadata.name".into()))
}

impl KubeStore {
    async fn served(&self, ty: &TypeKey) -> Result<crate::Resolved, StoreError> {
        self.resources.resolve(ty).await?.ok_or_else(|| StoreError::Rejected(format!("{} is not served by the cluster", ty)))
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Json>, StoreError> {
        let Some(r) = self.resources.resolve(&key.type_key()).await? else { return Ok(None) };
        let api = self.resources.api(&r, key.namespace.as_deref());
        match api.get_opt(&key.name).await.map_err(map_error)? {
            Some(o) => Ok(Some(to_json(&o)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, ty: &TypeKey, namespace: Option<&str>, labels: &BTreeMap<String, String>) -> Result<Vec<Json>, StoreError> {
        // an unserved kind simply has no objects
        let Some(r) = self.resources.resolve(ty).await? else { return Ok(Vec::new()) };
        let api = self.resources.api(&r, namespace);
        let lp = ListParams::default().labels(&label_selector(labels));
        let list = api.list(&lp).await.map_err(map_error)?;
        debug!(ty = %ty, ns = ?namespace, count = list.items.len(), "kubestore: list");
        list.items.iter().map(to_json).collect()
    }

    async fn create(&self, obj: Json) -> Result<Json, StoreError> {
        let r = self.served(&type_of(&obj)?).await?;
        let api = self.resources.api(&r, meta::str_field(&obj, "namespace"));
        let created = api.create(&PostParams::default(), &to_dynamic(&obj)?).await.map_err(map_error)?;
        metrics::counter!("kiln_kube_writes_total", 1u64);
        to_json(&created)
    }

    async fn update(&self, obj: Json) -> Result<Json, StoreError> {
        let r = self.served(&type_of(&obj)?).await?;
        let api = self.resources.api(&r, meta::str_field(&obj, "namespace"));
        let replaced = api.replace(name_of(&obj)?, &PostParams::default(), &to_dynamic(&obj)?).await.map_err(map_error)?;
        metrics::counter!("kiln_kube_writes_total", 1u64);
        to_json(&replaced)
    }

    async fn update_status(&self, obj: Json) -> Result<Json, StoreError> {
        let r = self.served(&type_of(&obj)?).await?;
        let api = self.resources.api(&r, meta::str_field(&obj, "namespace"));
        let body = serde_json::to_vec(&obj).map_err(|e| StoreError::Rejected(e.to_string()))?;
        let replaced = api.replace_status(name_of(&obj)?, &PostParams::default(), body).await.map_err(map_error)?;
        to_json(&replaced)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let r = self.served(&key.type_key()).await?;
        let api = self.resources.api(&r, key.namespace.as_deref());
        api.delete(&key.name, &DeleteParams::background()).await.map_err(map_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_string_is_comma_joined_and_sorted() {
        let labels: BTreeMap<String, String> =
            [("kiln.dev/resource-name", "image"), ("kiln.dev/owner-name", "app")].into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        assert_eq!(label_selector(&labels), "kiln.dev/owner-name=app,kiln.dev/resource-name=image");
        assert_eq!(label_selector(&BTreeMap::new()), "");
    }
}
