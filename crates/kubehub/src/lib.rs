//! Kiln kubehub: kube-rs backed implementations of the object store, the
//! blueprint/template repository and the event sink, plus watchers that turn
//! cluster changes into reconcile triggers.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Result};
use kiln_core::{StoreError, TypeKey};
use kube::{
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Api, Client,
};
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::debug;

mod events;
mod repository;
mod store;
mod watch;

pub use events::KubeEvents;
pub use repository::KubeRepository;
pub use store::KubeStore;
pub use watch::{owner_trigger, resync_trigger, spawn_watch, stamped_trigger};

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// `group/v1/Kind` key to the `{apiVersion, kind}` pair used by the engine.
pub fn type_key(key: &str) -> Result<TypeKey> {
    let gvk = parse_gvk_key(key)?;
    let api_version = if gvk.group.is_empty() { gvk.version } else { format!("{}/{}", gvk.group, gvk.version) };
    Ok(TypeKey::new(api_version, gvk.kind))
}

fn gvk_of(ty: &TypeKey) -> GroupVersionKind {
    let (group, version) = ty.group_version();
    GroupVersionKind { group: group.to_string(), version: version.to_string(), kind: ty.kind.clone() }
}

/// Served resource plus scope.
#[derive(Clone)]
pub(crate) struct Resolved {
    pub ar: ApiResource,
    pub namespaced: bool,
}

/// Discovery results by type. Unserved types are cached as `None` until
/// [`Resources::forget`] is called.
#[derive(Clone)]
pub struct Resources {
    client: Client,
    cache: Arc<RwLock<FxHashMap<TypeKey, Option<Resolved>>>>,
}

impl Resources {
    pub fn new(client: Client) -> Self { Self { client, cache: Arc::new(RwLock::new(FxHashMap::default())) } }

    pub fn client(&self) -> &Client { &self.client }

    pub(crate) async fn resolve(&self, ty: &TypeKey) -> Result<Option<Resolved>, StoreError> {
        if let Some(hit) = self.cache.read().await.get(ty) {
            return Ok(hit.clone());
        }
        let found = find_api_resource(self.client.clone(), &gvk_of(ty)).await.map_err(map_error)?;
        debug!(ty = %ty, served = found.is_some(), "kubehub: discovered");
        self.cache.write().await.insert(ty.clone(), found.clone());
        Ok(found)
    }

    /// Drop cached discovery (e.g. after a CRD is installed).
    pub async fn forget(&self, ty: &TypeKey) { self.cache.write().await.remove(ty); }

    /// Api handle scoped to `namespace` when the kind is namespaced. A
    /// namespaced kind without a namespace yields an all-namespaces handle.
    pub(crate) fn api(&self, r: &Resolved, namespace: Option<&str>) -> Api<DynamicObject> {
        match (r.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &r.ar),
            _ => Api::all_with(self.client.clone(), &r.ar),
        }
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<Option<Resolved>, kube::Error> {
    let discovery = Discovery::new(client).filter(&[gvk.group.as_str()]).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok(Some(Resolved { ar, namespaced }));
            }
        }
        // non-preferred versions are served too
        for version in group.versions() {
            if version != gvk.version {
                continue;
            }
            for (ar, caps) in group.versioned_resources(version) {
                if ar.kind == gvk.kind {
                    return Ok(Some(Resolved { ar, namespaced: matches!(caps.scope, Scope::Namespaced) }));
                }
            }
        }
    }
    Ok(None)
}

/// Map API server responses onto store errors.
pub fn map_error(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) => match ae.code {
            409 if ae.reason == "AlreadyExists" => StoreError::AlreadyExists(ae.message),
            409 => StoreError::Conflict(ae.message),
            404 => StoreError::NotFound(ae.message),
            429 | 500..=599 => StoreError::Unavailable(ae.message),
            _ => StoreError::Rejected(ae.message),
        },
        other => StoreError::Unavailable(other.to_string()),
    }
}

pub(crate) fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}
