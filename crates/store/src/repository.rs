use std::sync::RwLock;

use async_trait::async_trait;
use kiln_core::{Blueprint, Json, Repository, StoreError, Template};
use rustc_hash::FxHashMap;
use tracing::warn;

/// Blueprints and templates held in memory.
#[derive(Default)]
pub struct MemoryRepository {
    blueprints: RwLock<Vec<Blueprint>>,
    templates: RwLock<FxHashMap<(String, String), Template>>,
}

impl MemoryRepository {
    pub fn new() -> Self { Self::default() }

    /// Sort manifests into blueprints (kind `blueprint_kind`) and templates
    /// (any other kind carrying `spec.template`). Other documents are ignored.
    pub fn from_documents(docs: &[Json], blueprint_kind: &str) -> Self {
        let repo = Self::new();
        for doc in docs {
            let kind = doc.get("kind").and_then(|k| k.as_str()).unwrap_or_default();
            if kind == blueprint_kind {
                match Blueprint::from_manifest(doc) {
                    Ok(bp) => repo.put_blueprint(bp),
                    Err(e) => warn!(kind, error = %e, "repository: skipping blueprint"),
                }
            } else if doc.get("spec").and_then(|s| s.get("template")).is_some() {
                match Template::from_manifest(doc) {
                    Ok(t) => repo.put_template(t),
                    Err(e) => warn!(kind, error = %e, "repository: skipping template"),
                }
            }
        }
        repo
    }

    /// Insert or replace by name.
    pub fn put_blueprint(&self, bp: Blueprint) {
        if let Ok(mut all) = self.blueprints.write() {
            all.retain(|b| b.name != bp.name);
            all.push(bp);
            all.sort_by(|a, b| a.name.cmp(&b.name));
        }
    }

    pub fn put_template(&self, t: Template) {
        if let Ok(mut all) = self.templates.write() {
            all.insert((t.kind.clone(), t.name.clone()), t);
        }
    }

    pub fn remove_template(&self, kind: &str, name: &str) {
        if let Ok(mut all) = self.templates.write() {
            all.remove(&(kind.to_string(), name.to_string()));
        }
    }

    pub fn template_count(&self) -> usize { self.templates.read().map(|t| t.len()).unwrap_or(0) }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn blueprints(&self) -> Result<Vec<Blueprint>, StoreError> {
        self.blueprints.read().map(|b| b.clone()).map_err(|_| StoreError::Unavailable("repository lock poisoned".into()))
    }

    async fn template(&self, kind: &str, name: &str) -> Result<Option<Template>, StoreError> {
        let all = self.templates.read().map_err(|_| StoreError::Unavailable("repository lock poisoned".into()))?;
        Ok(all.get(&(kind.to_string(), name.to_string())).cloned())
    }
}
