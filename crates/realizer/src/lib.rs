//! Kiln resource realizer: stamp one blueprint resource for one owner,
//! converge the stamped object(s) in the store and report health and outputs.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use kiln_core::condition::{events, reasons, types};
use kiln_core::object::{labels, meta};
use kiln_core::{
    EventSink, HealthRule, Json, Lifecycle, ObjectKey, ObjectStore, Output, Owner, PathQuery, StampEvent, StoreError, Template,
    TypeKey, Verdict,
};
use kiln_stamp::{has_drift, render, Context, Stamp, StampError};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

pub mod health;
pub mod output;
pub mod retry;

pub use health::{evaluate, HealthVerdict};
pub use output::{extract, ExtractError};
pub use retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RealizeError {
    /// Transient store failure that outlived the retry budget.
    #[error("object store: {0}")]
    Store(#[from] StoreError),
}

/// Everything needed to stamp one resource.
#[derive(Debug, Clone)]
pub struct RealizeRequest<'a> {
    pub owner: &'a Owner,
    pub blueprint: &'a str,
    pub resource: &'a str,
    pub template: &'a Template,
    /// Merged params (template defaults, blueprint, resource, owner).
    pub params: BTreeMap<String, Json>,
    /// Wired inputs by name; `None` while the upstream output is missing.
    pub configs: BTreeMap<String, Option<Json>>,
    /// `stampedRef` reported on the previous cycle.
    pub previous: Option<&'a ObjectKey>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Realized {
    pub stamped_ref: Option<ObjectKey>,
    pub output: Option<Output>,
    /// Drives the resource's `ResourceSubmitted` condition.
    pub submitted: Verdict,
    pub health: HealthVerdict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Created,
    Updated,
    Unchanged,
}

pub struct Realizer {
    store: Arc<dyn ObjectStore>,
    events: Arc<dyn EventSink>,
    query: Arc<dyn PathQuery>,
    retry: RetryPolicy,
}

impl Realizer {
    pub fn new(store: Arc<dyn ObjectStore>, events: Arc<dyn EventSink>, query: Arc<dyn PathQuery>, retry: RetryPolicy) -> Self {
        Self { store, events, query, retry }
    }

    pub async fn realize(&self, req: &RealizeRequest<'_>) -> Result<Realized, RealizeError> {
        let t0 = Instant::now();
        let spec = &req.template.spec;
        let ctx = Context { owner: Some(&req.owner.raw), params: req.params.clone(), configs: req.configs.clone() };
        let mut desired = match render(self.query.as_ref(), &spec.template, &ctx) {
            Ok(v) => v,
            Err(e) => return self.not_submitted(req, stamp_verdict(&e)).await,
        };
        let Some(ty) = TypeKey::of(&desired) else {
            let v = Verdict::failed(reasons::TEMPLATE_STAMP_FAILURE, "stamped object must carry apiVersion and kind");
            return self.not_submitted(req, v).await;
        };

        let stamp = Stamp {
            owner: &req.owner.key,
            owner_uid: &req.owner.uid,
            blueprint: req.blueprint,
            resource: req.resource,
            template_kind: &req.template.kind,
            template_name: &req.template.name,
            lifecycle: spec.lifecycle,
        };
        let hash = stamp.apply(&mut desired);
        let selector = stamp.selector_labels();

        let res = match spec.lifecycle {
            Lifecycle::Mutable => self.realize_mutable(req, &ty, &selector, &desired, &hash).await,
            lc => self.realize_append_only(req, &ty, &selector, &desired, &hash, lc).await,
        };
        histogram!("kiln_realize_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        res
    }

    async fn realize_mutable(
        &self,
        req: &RealizeRequest<'_>,
        ty: &TypeKey,
        selector: &BTreeMap<String, String>,
        desired: &Json,
        hash: &str,
    ) -> Result<Realized, RealizeError> {
        let store = self.store.as_ref();
        let ns = meta::str_field(desired, "namespace");
        let name = meta::str_field(desired, "name");
        let previous = req.previous;
        let applied = self
            .retry
            .run("apply", move || Box::pin(apply_mutable_once(store, ty, ns, name, selector, desired, hash, previous)))
            .await;
        let (live, applied) = match applied {
            Ok(v) => v,
            Err(StoreError::Rejected(msg)) => return self.not_submitted(req, rejected(&msg)).await,
            Err(e) => return Err(e.into()),
        };
        let key = ObjectKey::of(&live);
        if let Some(k) = key.as_ref() {
            match applied {
                Applied::Created => self.applied_event(req, k, "Created").await,
                Applied::Updated => self.applied_event(req, k, "Updated").await,
                Applied::Unchanged => debug!(owner = %req.owner.key, object = %k, "realizer: unchanged"),
            }
        }
        self.prune(req, ty, selector, Lifecycle::Mutable, key.as_ref()).await?;

        let health = evaluate(self.query.as_ref(), Some(&live), req.template.spec.health_rule.as_ref());
        let (output, submitted) = self.output_of(req, &live);
        Ok(Realized { stamped_ref: key, output, submitted, health })
    }

    async fn realize_append_only(
        &self,
        req: &RealizeRequest<'_>,
        ty: &TypeKey,
        selector: &BTreeMap<String, String>,
        desired: &Json,
        hash: &str,
        lifecycle: Lifecycle,
    ) -> Result<Realized, RealizeError> {
        let store = self.store.as_ref();
        let ns = meta::str_field(desired, "namespace");
        let revisions = self
            .retry
            .run("revisions", move || Box::pin(ensure_revision(store, ty, ns, selector, desired, hash, lifecycle)))
            .await;
        let (revs, created) = match revisions {
            Ok(v) => v,
            Err(StoreError::Rejected(msg)) => return self.not_submitted(req, rejected(&msg)).await,
            Err(e) => return Err(e.into()),
        };
        if created {
            if let Some(k) = revs.last().and_then(ObjectKey::of) {
                self.applied_event(req, &k, "Created").await;
            }
        }
        self.prune(req, ty, selector, lifecycle, None).await?;

        let rule = match lifecycle {
            Lifecycle::Tekton => Some(HealthRule::single_condition_type(types::SUCCEEDED)),
            _ => req.template.spec.health_rule.clone(),
        };
        let healths: Vec<HealthVerdict> = revs.iter().map(|r| evaluate(self.query.as_ref(), Some(r), rule.as_ref())).collect();
        let latest = revs.len().checked_sub(1);
        let newest_healthy = healths.iter().rposition(HealthVerdict::is_healthy);

        let shown = match lifecycle {
            Lifecycle::Tekton => latest,
            _ => newest_healthy.or(latest),
        };
        let health = shown.map(|i| healths[i].clone()).unwrap_or_else(HealthVerdict::no_stamped_object);
        let stamped_ref = latest.and_then(|i| ObjectKey::of(&revs[i]));

        let (output, submitted) = match newest_healthy {
            Some(i) => self.output_of(req, &revs[i]),
            None => (None, Verdict::failed(reasons::NO_HEALTHY_IMMUTABLE_OBJECT, reasons::NO_HEALTHY_IMMUTABLE_OBJECT_MESSAGE)),
        };
        debug!(owner = %req.owner.key, resource = req.resource, revisions = revs.len(), healthy = ?newest_healthy, "realizer: revisions");
        Ok(Realized { stamped_ref, output, submitted, health })
    }

    fn output_of(&self, req: &RealizeRequest<'_>, obj: &Json) -> (Option<Output>, Verdict) {
        match req.template.spec.config_path.as_deref() {
            None => (None, Verdict::ok(reasons::RESOURCE_SUBMISSION_COMPLETE)),
            Some(path) => match extract(self.query.as_ref(), obj, path) {
                Ok(o) => (Some(o), Verdict::ok(reasons::RESOURCE_SUBMISSION_COMPLETE)),
                Err(e) => (None, e.verdict()),
            },
        }
    }

    /// Nothing new was submitted; keep reporting the previously stamped object.
    async fn not_submitted(&self, req: &RealizeRequest<'_>, submitted: Verdict) -> Result<Realized, RealizeError> {
        debug!(owner = %req.owner.key, resource = req.resource, reason = %submitted.reason, "realizer: not submitted");
        let prev = match req.previous {
            Some(k) => {
                let store = self.store.as_ref();
                self.retry.run("get previous", move || Box::pin(store.get(k))).await?
            }
            None => None,
        };
        let health = evaluate(self.query.as_ref(), prev.as_ref(), req.template.spec.health_rule.as_ref());
        Ok(Realized { stamped_ref: prev.as_ref().and_then(ObjectKey::of), output: None, submitted, health })
    }

    /// Delete stamped objects of another lifecycle and, for mutable templates,
    /// every mutable object other than `keep`. Revisions of the current
    /// append-only lifecycle stay until the owner goes away.
    async fn prune(
        &self,
        req: &RealizeRequest<'_>,
        ty: &TypeKey,
        selector: &BTreeMap<String, String>,
        lifecycle: Lifecycle,
        keep: Option<&ObjectKey>,
    ) -> Result<(), RealizeError> {
        let mut kinds = vec![ty.clone()];
        if let Some(prev) = req.previous.map(ObjectKey::type_key) {
            if prev != *ty {
                kinds.push(prev);
            }
        }
        let store = self.store.as_ref();
        let ns = req.owner.namespace();
        for kind in kinds.iter() {
            let found = self.retry.run("list stamped", move || Box::pin(store.list(kind, ns, selector))).await?;
            for obj in found {
                let Some(key) = ObjectKey::of(&obj) else { continue };
                if Some(&key) == keep || !meta::is_owned_by(&obj, &req.owner.uid) {
                    continue;
                }
                let stamped_as = meta::label(&obj, labels::TEMPLATE_LIFECYCLE).and_then(Lifecycle::parse);
                let doomed = stamped_as != Some(lifecycle) || lifecycle == Lifecycle::Mutable;
                if !doomed {
                    continue;
                }
                let k = &key;
                match self.retry.run("delete stamped", move || Box::pin(store.delete(k))).await {
                    Ok(()) | Err(StoreError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                counter!("kiln_stamped_deleted_total", 1u64);
                info!(owner = %req.owner.key, resource = req.resource, object = %key, "realizer: removed stamped object");
                self.event(req, events::STAMPED_OBJECT_REMOVED, format!("Deleted object [{}]", key)).await;
            }
        }
        Ok(())
    }

    async fn applied_event(&self, req: &RealizeRequest<'_>, key: &ObjectKey, verb: &str) {
        if verb == "Created" {
            counter!("kiln_stamped_created_total", 1u64);
        } else {
            counter!("kiln_stamped_updated_total", 1u64);
        }
        info!(owner = %req.owner.key, resource = req.resource, object = %key, verb, "realizer: applied");
        self.event(req, events::STAMPED_OBJECT_APPLIED, format!("{} object [{}]", verb, key)).await;
    }

    async fn event(&self, req: &RealizeRequest<'_>, reason: &str, note: String) {
        self.events
            .record(StampEvent {
                regarding: req.owner.key.clone(),
                regarding_uid: req.owner.uid.clone(),
                reason: reason.to_string(),
                note,
                warning: false,
            })
            .await;
    }
}

fn stamp_verdict(e: &StampError) -> Verdict {
    if e.is_missing_upstream() {
        Verdict::unknown(reasons::MISSING_UPSTREAM_OUTPUT, e.to_string())
    } else {
        Verdict::failed(reasons::TEMPLATE_STAMP_FAILURE, e.to_string())
    }
}

fn rejected(msg: &str) -> Verdict {
    warn!(error = %msg, "realizer: object rejected");
    Verdict::failed(reasons::TEMPLATE_REJECTED_BY_API_SERVER, msg)
}

/// Races with other writers surface as conflicts so the caller re-reads.
fn as_conflict(e: StoreError) -> StoreError {
    match e {
        StoreError::AlreadyExists(m) | StoreError::NotFound(m) => StoreError::Conflict(m),
        other => other,
    }
}

/// Stamped objects of `lifecycle` for one (owner, resource), oldest first.
async fn list_stamped(
    store: &dyn ObjectStore,
    ty: &TypeKey,
    ns: Option<&str>,
    selector: &BTreeMap<String, String>,
    lifecycle: Lifecycle,
) -> Result<Vec<Json>, StoreError> {
    let mut found: Vec<Json> = store
        .list(ty, ns, selector)
        .await?
        .into_iter()
        .filter(|o| meta::label(o, labels::TEMPLATE_LIFECYCLE) == Some(lifecycle.as_str()))
        .collect();
    // Creation timestamps only have second precision on a real API server,
    // so the stamped revision number decides; unnumbered objects go first.
    found.sort_by(|a, b| {
        meta::revision(a)
            .cmp(&meta::revision(b))
            .then_with(|| meta::creation_ts(a).cmp(&meta::creation_ts(b)))
            .then_with(|| meta::str_field(a, "name").cmp(&meta::str_field(b, "name")))
    });
    Ok(found)
}

#[allow(clippy::too_many_arguments)]
async fn apply_mutable_once(
    store: &dyn ObjectStore,
    ty: &TypeKey,
    ns: Option<&str>,
    name: Option<&str>,
    selector: &BTreeMap<String, String>,
    desired: &Json,
    hash: &str,
    previous: Option<&ObjectKey>,
) -> Result<(Json, Applied), StoreError> {
    let live = match name {
        Some(n) => store.get(&ObjectKey::new(ty, ns, n)).await?,
        None => {
            let mut found = list_stamped(store, ty, ns, selector, Lifecycle::Mutable).await?;
            let tracked = previous.and_then(|p| found.iter().position(|o| ObjectKey::of(o).as_ref() == Some(p)));
            match tracked {
                Some(i) => Some(found.swap_remove(i)),
                None => found.pop(),
            }
        }
    };
    let Some(live) = live else {
        let created = store.create(desired.clone()).await.map_err(as_conflict)?;
        return Ok((created, Applied::Created));
    };
    if meta::annotation(&live, labels::CONTENT_HASH) == Some(hash) && !has_drift(desired, &live) {
        return Ok((live, Applied::Unchanged));
    }
    let mut next = desired.clone();
    if let Some(m) = next.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        if let Some(n) = meta::str_field(&live, "name") {
            m.insert("name".into(), Json::String(n.to_string()));
        }
        if let Some(rv) = meta::str_field(&live, "resourceVersion") {
            m.insert("resourceVersion".into(), Json::String(rv.to_string()));
        }
    }
    let updated = store.update(next).await.map_err(as_conflict)?;
    Ok((updated, Applied::Updated))
}

/// Create a revision unless one with the same content hash exists. New
/// revisions are numbered past every existing one.
async fn ensure_revision(
    store: &dyn ObjectStore,
    ty: &TypeKey,
    ns: Option<&str>,
    selector: &BTreeMap<String, String>,
    desired: &Json,
    hash: &str,
    lifecycle: Lifecycle,
) -> Result<(Vec<Json>, bool), StoreError> {
    let mut revs = list_stamped(store, ty, ns, selector, lifecycle).await?;
    if revs.iter().any(|r| meta::annotation(r, labels::CONTENT_HASH) == Some(hash)) {
        return Ok((revs, false));
    }
    let next = revs.iter().filter_map(meta::revision).max().unwrap_or(0).max(revs.len() as u64) + 1;
    let mut obj = desired.clone();
    set_annotation(&mut obj, labels::REVISION, next.to_string());
    let created = store.create(obj).await.map_err(as_conflict)?;
    revs.push(created);
    Ok((revs, true))
}

fn set_annotation(obj: &mut Json, key: &str, value: String) {
    let Some(m) = obj.as_object_mut().map(|o| o.entry("metadata").or_insert_with(|| Json::Object(Default::default()))) else {
        return;
    };
    let Some(m) = m.as_object_mut() else { return };
    if let Some(a) = m.entry("annotations").or_insert_with(|| Json::Object(Default::default())).as_object_mut() {
        a.insert(key.to_string(), Json::String(value));
    }
}
