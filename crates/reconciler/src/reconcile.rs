//! One reconcile cycle for one owner.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_core::condition::{reasons, timestamp};
use kiln_core::{
    Blueprint, BlueprintRef, BlueprintResource, EventSink, Json, ObjectKey, ObjectStore, Owner, OwnerStatus, PathQuery, Repository,
    StoreError, Template, TemplateIdent, Verdict,
};
use kiln_realizer::{HealthVerdict, RealizeError, RealizeRequest, Realizer};
use kiln_status::{aggregate, stabilize_status, ResourceOutcome};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::select::{select_blueprint, select_option};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("object store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Retry the owner after this delay (transient store failures).
    pub requeue_after: Option<Duration>,
    /// The owner's status was written this cycle.
    pub status_written: bool,
}

pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    repo: Arc<dyn Repository>,
    query: Arc<dyn PathQuery>,
    realizer: Realizer,
    config: Config,
}

/// Template resolution result for one resource.
enum Resolved {
    Template(Template),
    Failed(Verdict),
    Unavailable(StoreError),
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        repo: Arc<dyn Repository>,
        events: Arc<dyn EventSink>,
        query: Arc<dyn PathQuery>,
        config: Config,
    ) -> Self {
        let realizer = Realizer::new(store.clone(), events, query.clone(), config.retry);
        Self { store, repo, query, realizer, config }
    }

    pub fn config(&self) -> &Config { &self.config }

    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
        let t0 = Instant::now();
        counter!("kiln_reconcile_total", 1u64);
        let store = self.store.as_ref();
        let Some(raw) = self.config.retry.run("get owner", move || Box::pin(store.get(key))).await? else {
            debug!(owner = %key, "reconcile: owner gone");
            return Ok(Outcome::default());
        };
        let Some(owner) = Owner::from_object(raw) else {
            warn!(owner = %key, "reconcile: owner without identity");
            return Ok(Outcome::default());
        };

        let now = timestamp(chrono::Utc::now());
        let kind = self.config.blueprint_kind.as_str();
        let mut requeue = false;

        let blueprints = match self.repo.blueprints().await {
            Ok(b) => Ok(b),
            Err(e) if e.is_transient() => {
                requeue = true;
                Err(Verdict::unknown(reasons::OBJECT_STORE_UNAVAILABLE, e.to_string()))
            }
            Err(e) => Err(Verdict::failed(reasons::blueprint_not_found(kind), e.to_string())),
        };
        let selected = blueprints.and_then(|bps| select_blueprint(self.query.as_ref(), &owner, &bps, kind));

        let mut next = match selected {
            Ok(bp) => {
                let (outcomes, store_down) = self.realize_all(&owner, &bp).await;
                requeue |= store_down;
                let agg = aggregate(kind, &Verdict::ok(reasons::READY), &outcomes, &now);
                OwnerStatus {
                    observed_generation: owner.generation,
                    conditions: agg.conditions,
                    resources: agg.resources,
                    blueprint_ref: Some(BlueprintRef { kind: kind.to_string(), name: bp.name.clone() }),
                }
            }
            Err(verdict) => {
                info!(owner = %owner.key, reason = %verdict.reason, "reconcile: no blueprint");
                let agg = aggregate(kind, &verdict, &[], &now);
                OwnerStatus { observed_generation: owner.generation, conditions: agg.conditions, resources: agg.resources, blueprint_ref: None }
            }
        };
        stabilize_status(&owner.status, &mut next);

        let written = if next != owner.status {
            let store = self.store.as_ref();
            let status = &next;
            self.config.retry.run("write status", move || Box::pin(write_status_once(store, key, status))).await?
        } else {
            false
        };

        histogram!("kiln_reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(owner = %key, written, requeue, "reconcile: done");
        Ok(Outcome { requeue_after: requeue.then_some(self.config.requeue), status_written: written })
    }

    /// Realize every resource in declared order, feeding outputs forward.
    /// Returns the outcomes and whether the store was unavailable.
    async fn realize_all(&self, owner: &Owner, bp: &Blueprint) -> (Vec<ResourceOutcome>, bool) {
        let mut outputs: BTreeMap<String, Json> = BTreeMap::new();
        let mut outcomes = Vec::with_capacity(bp.spec.resources.len());
        let mut store_down = false;

        for res in bp.spec.resources.iter() {
            let previous = owner.status.resource(&res.name).and_then(|r| r.stamped_ref.clone());
            let template = match self.resolve_template(owner, res).await {
                Resolved::Template(t) => t,
                Resolved::Failed(v) => {
                    outcomes.push(unrealized(res, None, previous, v));
                    continue;
                }
                Resolved::Unavailable(e) => {
                    store_down = true;
                    outcomes.push(unrealized(res, None, previous, Verdict::unknown(reasons::OBJECT_STORE_UNAVAILABLE, e.to_string())));
                    continue;
                }
            };
            let ident = TemplateIdent { kind: template.kind.clone(), name: template.name.clone() };

            let configs: BTreeMap<String, Option<Json>> =
                res.configs.iter().map(|c| (c.name.clone(), outputs.get(&c.resource).cloned())).collect();
            let req = RealizeRequest {
                owner,
                blueprint: &bp.name,
                resource: &res.name,
                template: &template,
                params: merge_params(&template, bp, res, owner),
                configs,
                previous: previous.as_ref(),
            };
            match self.realizer.realize(&req).await {
                Ok(r) => {
                    if let Some(o) = r.output.as_ref() {
                        outputs.insert(res.name.clone(), o.value.clone());
                    }
                    outcomes.push(ResourceOutcome {
                        name: res.name.clone(),
                        template: Some(ident),
                        stamped_ref: r.stamped_ref,
                        outputs: r.output.into_iter().collect(),
                        submitted: r.submitted,
                        health: r.health.verdict(),
                    });
                }
                Err(RealizeError::Store(e)) => {
                    warn!(owner = %owner.key, resource = %res.name, error = %e, "reconcile: store unavailable");
                    store_down = true;
                    let v = Verdict::unknown(reasons::OBJECT_STORE_UNAVAILABLE, e.to_string());
                    outcomes.push(unrealized(res, Some(ident), previous, v));
                }
            }
        }
        (outcomes, store_down)
    }

    async fn resolve_template(&self, owner: &Owner, res: &BlueprintResource) -> Resolved {
        let r = &res.template_ref;
        let name = match (r.name.as_deref(), r.options.is_empty()) {
            (Some(n), _) => n.to_string(),
            (None, false) => match select_option(self.query.as_ref(), owner, &res.name, &r.options) {
                Ok(opt) => opt.name.clone(),
                Err(v) => return Resolved::Failed(v),
            },
            (None, true) => {
                return Resolved::Failed(Verdict::failed(
                    reasons::TEMPLATE_OBJECT_RETRIEVAL_FAILURE,
                    format!("resource [{}] names neither a template nor template options", res.name),
                ))
            }
        };
        match self.repo.template(&r.kind, &name).await {
            Ok(Some(t)) => Resolved::Template(t),
            Ok(None) => Resolved::Failed(Verdict::failed(
                reasons::TEMPLATE_OBJECT_RETRIEVAL_FAILURE,
                format!("unable to get template [{}]: {} not found", name, r.kind),
            )),
            Err(e) if e.is_transient() => Resolved::Unavailable(e),
            Err(e) => Resolved::Failed(Verdict::failed(reasons::TEMPLATE_OBJECT_RETRIEVAL_FAILURE, e.to_string())),
        }
    }
}

fn unrealized(res: &BlueprintResource, template: Option<TemplateIdent>, previous: Option<ObjectKey>, submitted: Verdict) -> ResourceOutcome {
    let health = match previous {
        Some(_) => Verdict::unknown(submitted.reason.clone(), submitted.message.clone()),
        None => HealthVerdict::no_stamped_object().verdict(),
    };
    ResourceOutcome { name: res.name.clone(), template, stamped_ref: previous, outputs: Vec::new(), submitted, health }
}

/// Template defaults, then blueprint, resource and owner params; later wins.
pub fn merge_params(template: &Template, bp: &Blueprint, res: &BlueprintResource, owner: &Owner) -> BTreeMap<String, Json> {
    let mut out: BTreeMap<String, Json> = template.spec.params.iter().map(|p| (p.name.clone(), p.default.clone())).collect();
    for p in bp.spec.params.iter().chain(res.params.iter()) {
        out.insert(p.name.clone(), p.value.clone());
    }
    out.extend(owner.params());
    out
}

/// Write `status` onto a fresh read of the owner. A changed owner status is
/// re-stabilised first; an equal one is not written.
async fn write_status_once(store: &dyn ObjectStore, key: &ObjectKey, status: &OwnerStatus) -> Result<bool, StoreError> {
    let Some(mut raw) = store.get(key).await? else { return Ok(false) };
    let current = Owner::from_object(raw.clone()).map(|o| o.status).unwrap_or_default();
    let mut next = status.clone();
    stabilize_status(&current, &mut next);
    if next == current {
        return Ok(false);
    }
    let value = serde_json::to_value(&next).map_err(|e| StoreError::Rejected(format!("encoding status: {}", e)))?;
    if let Some(m) = raw.as_object_mut() {
        m.insert("status".into(), value);
    }
    store.update_status(raw).await?;
    counter!("kiln_status_writes_total", 1u64);
    info!(owner = %key, "reconcile: status written");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_merge_in_precedence_order() {
        let template = Template::from_manifest(&json!({
            "kind": "ClusterTemplate", "metadata": { "name": "t" },
            "spec": { "template": {}, "params": [{ "name": "a", "default": 1 }, { "name": "b", "default": 1 }, { "name": "c", "default": 1 }, { "name": "d", "default": 1 }] }
        }))
        .unwrap();
        let bp = Blueprint::from_manifest(&json!({
            "metadata": { "name": "bp" },
            "spec": {
                "params": [{ "name": "b", "value": 2 }, { "name": "c", "value": 2 }, { "name": "d", "value": 2 }],
                "resources": [{ "name": "r", "templateRef": { "kind": "ClusterTemplate", "name": "t" }, "params": [{ "name": "c", "value": 3 }, { "name": "d", "value": 3 }] }]
            }
        }))
        .unwrap();
        let owner = Owner::from_object(json!({
            "apiVersion": "kiln.dev/v1alpha1", "kind": "Workload", "metadata": { "name": "w" },
            "spec": { "params": [{ "name": "d", "value": 4 }] }
        }))
        .unwrap();
        let merged = merge_params(&template, &bp, &bp.spec.resources[0], &owner);
        assert_eq!(merged.values().cloned().collect::<Vec<_>>(), vec![json!(1), json!(2), json!(3), json!(4)]);
    }
}
