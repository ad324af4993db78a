use std::collections::BTreeMap;

use async_trait::async_trait;
use kiln_core::{Blueprint, ObjectKey, ObjectStore, Repository, StoreError, Template, TypeKey};
use tracing::warn;

use crate::KubeStore;

/// Blueprints and templates read from cluster-scoped custom resources.
pub struct KubeRepository {
    store: KubeStore,
    blueprint: TypeKey,
    template_group_version: String,
}

impl KubeRepository {
    pub fn new(store: KubeStore, blueprint: TypeKey, template_group_version: impl Into<String>) -> Self {
        Self { store, blueprint, template_group_version: template_group_version.into() }
    }
}

#[async_trait]
impl Repository for KubeRepository {
    async fn blueprints(&self) -> Result<Vec<Blueprint>, StoreError> {
        let raw = self.store.list(&self.blueprint, None, &BTreeMap::new()).await?;
        let mut out = Vec::with_capacity(raw.len());
        for doc in raw.iter() {
            match Blueprint::from_manifest(doc) {
                Ok(bp) => out.push(bp),
                Err(e) => warn!(kind = %self.blueprint.kind, error = %e, "repository: skipping malformed blueprint"),
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn template(&self, kind: &str, name: &str) -> Result<Option<Template>, StoreError> {
        let key = ObjectKey::new(&TypeKey::new(self.template_group_version.clone(), kind), None, name);
        let Some(doc) = self.store.get(&key).await? else { return Ok(None) };
        Template::from_manifest(&doc).map(Some).map_err(|e| StoreError::Rejected(format!("{}: {}", key, e)))
    }
}
