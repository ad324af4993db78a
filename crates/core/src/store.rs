//! Collaborator traits: object store, event sink and blueprint/template
//! repository. Both the in-RAM store and the kube-backed store implement them.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::model::{Blueprint, Template};
use crate::object::{ObjectKey, TypeKey};
use crate::Json;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Optimistic concurrency failure (stale resourceVersion).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Validation failure; retrying the same object will not help.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool { matches!(self, StoreError::Conflict(_) | StoreError::Unavailable(_)) }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Json>, StoreError>;
    /// Objects of `ty` in `namespace` (all namespaces when `None`) carrying every label in `labels`.
    async fn list(&self, ty: &TypeKey, namespace: Option<&str>, labels: &BTreeMap<String, String>) -> Result<Vec<Json>, StoreError>;
    /// Create; honours `metadata.generateName` when `metadata.name` is absent.
    async fn create(&self, obj: Json) -> Result<Json, StoreError>;
    /// Replace spec/metadata. A `metadata.resourceVersion` that is stale yields `Conflict`.
    async fn update(&self, obj: Json) -> Result<Json, StoreError>;
    /// Replace the status subresource only.
    async fn update_status(&self, obj: Json) -> Result<Json, StoreError>;
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;
}

/// Event attached to an owner about a stamped object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampEvent {
    pub regarding: ObjectKey,
    pub regarding_uid: String,
    pub reason: String,
    pub note: String,
    pub warning: bool,
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: StampEvent);
}

/// Read-only access to blueprints and templates.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn blueprints(&self) -> Result<Vec<Blueprint>, StoreError>;
    async fn template(&self, kind: &str, name: &str) -> Result<Option<Template>, StoreError>;
}

/// Reasons to reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Trigger {
    Owner(ObjectKey),
    /// Re-enqueue every known owner (blueprint/template change, periodic resync).
    Resync,
}
