#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_core::condition::{events, reasons};
use kiln_core::object::meta;
use kiln_core::{ConditionStatus, HealthState, Json, ObjectKey, ObjectStore, Owner, StoreError, Template, TypeKey};
use kiln_eval::JsonPath;
use kiln_realizer::{RealizeRequest, Realized, Realizer, RetryPolicy};
use kiln_store::{MemoryEvents, MemoryStore, Op};
use serde_json::json;

/// Reports every object as created in the same second, the way an API
/// server with second-precision timestamps does for quick successive creates.
struct SameSecond(Arc<MemoryStore>);

fn coarse(mut obj: Json) -> Json {
    if let Some(m) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        m.insert("creationTimestamp".into(), json!("2026-01-01T00:00:00Z"));
    }
    obj
}

#[async_trait::async_trait]
impl ObjectStore for SameSecond {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Json>, StoreError> { Ok(self.0.get(key).await?.map(coarse)) }
    async fn list(&self, ty: &TypeKey, ns: Option<&str>, labels: &BTreeMap<String, String>) -> Result<Vec<Json>, StoreError> {
        Ok(self.0.list(ty, ns, labels).await?.into_iter().map(coarse).collect())
    }
    async fn create(&self, obj: Json) -> Result<Json, StoreError> { self.0.create(obj).await.map(coarse) }
    async fn update(&self, obj: Json) -> Result<Json, StoreError> { self.0.update(obj).await.map(coarse) }
    async fn update_status(&self, obj: Json) -> Result<Json, StoreError> { self.0.update_status(obj).await.map(coarse) }
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> { self.0.delete(key).await }
}

struct Harness {
    store: Arc<MemoryStore>,
    events: Arc<MemoryEvents>,
    realizer: Realizer,
    owner: Owner,
}

async fn harness() -> Harness { harness_over(|s| s as Arc<dyn ObjectStore>).await }

async fn harness_over(wrap: impl FnOnce(Arc<MemoryStore>) -> Arc<dyn ObjectStore>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let events = Arc::new(MemoryEvents::new());
    let raw = store
        .create(json!({
            "apiVersion": "kiln.dev/v1alpha1", "kind": "Workload",
            "metadata": { "name": "app", "namespace": "dev", "labels": { "type": "web" } },
            "spec": { "image": "reg/app:1" }
        }))
        .await
        .unwrap();
    let owner = Owner::from_object(raw).unwrap();
    let realizer = Realizer::new(wrap(store.clone()), events.clone(), Arc::new(JsonPath::new()), RetryPolicy::immediate(3));
    Harness { store, events, realizer, owner }
}

fn template(lifecycle: &str, config_path: Option<&str>) -> Template {
    let mut spec = json!({
        "lifecycle": lifecycle,
        "template": {
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": "$(workload.metadata.name)$-cfg" },
            "data": { "image": "$(workload.spec.image)$", "tag": "$(params.tag)$" }
        }
    });
    if let Some(p) = config_path {
        spec["configPath"] = json!(p);
    }
    Template::from_manifest(&json!({ "kind": "ClusterConfigTemplate", "metadata": { "name": "cfg" }, "spec": spec })).unwrap()
}

impl Harness {
    async fn realize(&self, t: &Template, tag: &str, previous: Option<&ObjectKey>) -> Realized {
        let params: BTreeMap<String, Json> = [("tag".to_string(), json!(tag))].into_iter().collect();
        let req = RealizeRequest {
            owner: &self.owner,
            blueprint: "basic",
            resource: "config",
            template: t,
            params,
            configs: BTreeMap::new(),
            previous,
        };
        self.realizer.realize(&req).await.unwrap()
    }

    async fn configmaps(&self) -> Vec<Json> {
        self.store.list(&TypeKey::new("v1", "ConfigMap"), Some("dev"), &BTreeMap::new()).await.unwrap()
    }

    fn mark(&self, key: &ObjectKey, cond: &str, status: &str) {
        self.store.set_status(key, json!({ "conditions": [{ "type": cond, "status": status }] })).unwrap();
    }
}

#[tokio::test]
async fn mutable_create_noop_update() {
    let h = harness().await;
    let t = template("mutable", Some("data.image"));

    let first = h.realize(&t, "a", None).await;
    let key = first.stamped_ref.clone().unwrap();
    assert_eq!(key.name, "app-cfg");
    assert_eq!(first.submitted.reason, reasons::RESOURCE_SUBMISSION_COMPLETE);
    assert_eq!(first.output.unwrap().value, json!("reg/app:1"));
    assert_eq!(first.health.state, HealthState::Unknown);

    let again = h.realize(&t, "a", Some(&key)).await;
    assert_eq!(again.stamped_ref.as_ref(), Some(&key));
    assert_eq!(h.events.with_reason(events::STAMPED_OBJECT_APPLIED).len(), 1);

    let changed = h.realize(&t, "b", Some(&key)).await;
    assert_eq!(changed.stamped_ref.as_ref(), Some(&key));
    let applied = h.events.with_reason(events::STAMPED_OBJECT_APPLIED);
    assert_eq!(applied.len(), 2);
    assert!(applied[1].note.starts_with("Updated object ["));
    let live = h.configmaps().await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0]["data"]["tag"], "b");
}

#[tokio::test]
async fn mutable_drift_is_reverted() {
    let h = harness().await;
    let t = template("mutable", None);
    let key = h.realize(&t, "a", None).await.stamped_ref.unwrap();

    let mut live = h.store.get(&key).await.unwrap().unwrap();
    live["data"]["tag"] = json!("edited");
    h.store.update(live).await.unwrap();

    h.realize(&t, "a", Some(&key)).await;
    assert_eq!(h.store.get(&key).await.unwrap().unwrap()["data"]["tag"], "a");
}

#[tokio::test]
async fn immutable_outputs_come_from_newest_healthy_revision() {
    let h = harness().await;
    let t = template("immutable", Some("data.tag"));

    let r1 = h.realize(&t, "one", None).await;
    let rev1 = r1.stamped_ref.clone().unwrap();
    assert!(rev1.name.starts_with("app-cfg-"));
    assert_eq!(r1.submitted.status, ConditionStatus::False);
    assert_eq!(r1.submitted.reason, reasons::NO_HEALTHY_IMMUTABLE_OBJECT);
    assert!(r1.output.is_none());

    h.mark(&rev1, "Ready", "True");
    let r1 = h.realize(&t, "one", Some(&rev1)).await;
    assert_eq!(r1.output.unwrap().value, json!("one"));
    assert!(r1.health.is_healthy());

    // a second revision that is not yet healthy
    let r2 = h.realize(&t, "two", Some(&rev1)).await;
    let rev2 = r2.stamped_ref.clone().unwrap();
    assert_ne!(rev1, rev2);
    assert_eq!(r2.output.unwrap().value, json!("one"));
    assert_eq!(r2.submitted.status, ConditionStatus::True);
    assert!(r2.health.is_healthy());
    assert_eq!(h.configmaps().await.len(), 2);

    h.mark(&rev2, "Ready", "True");
    let r2 = h.realize(&t, "two", Some(&rev2)).await;
    assert_eq!(r2.output.unwrap().value, json!("two"));

    // unchanged inputs never create another revision
    assert_eq!(h.configmaps().await.len(), 2);
}

#[tokio::test]
async fn tekton_tracks_latest_run_succeeded_condition() {
    let h = harness().await;
    let t = template("tekton", Some("data.tag"));

    let run = h.realize(&t, "one", None).await.stamped_ref.unwrap();
    h.mark(&run, "Succeeded", "Unknown");
    let r = h.realize(&t, "one", Some(&run)).await;
    assert_eq!((r.health.state, r.health.reason.as_str()), (HealthState::Unknown, reasons::SUCCEEDED_CONDITION));

    h.mark(&run, "Succeeded", "True");
    let r = h.realize(&t, "one", Some(&run)).await;
    assert!(r.health.is_healthy());
    assert_eq!(r.output.unwrap().value, json!("one"));

    // a new run shows its own health but keeps the last good output
    let r = h.realize(&t, "two", Some(&run)).await;
    assert_ne!(r.stamped_ref.as_ref(), Some(&run));
    assert_eq!(r.health.state, HealthState::Unknown);
    assert_eq!(r.output.unwrap().value, json!("one"));
}

#[tokio::test]
async fn switching_to_immutable_removes_mutable_object() {
    let h = harness().await;
    let mutable = h.realize(&template("mutable", None), "a", None).await.stamped_ref.unwrap();

    let r = h.realize(&template("immutable", None), "a", Some(&mutable)).await;
    assert_ne!(r.stamped_ref.as_ref(), Some(&mutable));
    assert!(h.store.get(&mutable).await.unwrap().is_none());
    let removed = h.events.with_reason(events::STAMPED_OBJECT_REMOVED);
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].note, format!("Deleted object [{}]", mutable));
    assert_eq!(h.configmaps().await.len(), 1);

    // and back again: revisions go, one mutable object remains
    let back = h.realize(&template("mutable", None), "a", r.stamped_ref.as_ref()).await.stamped_ref.unwrap();
    let live = h.configmaps().await;
    assert_eq!(live.len(), 1);
    assert_eq!(ObjectKey::of(&live[0]).unwrap(), back);
}

#[tokio::test]
async fn rejected_object_reports_api_server_reason() {
    let h = harness().await;
    h.store.inject(Op::Create, StoreError::Rejected("spec.data: Invalid value".into()), 1);
    let r = h.realize(&template("mutable", None), "a", None).await;
    assert_eq!((r.submitted.status, r.submitted.reason.as_str()), (ConditionStatus::False, reasons::TEMPLATE_REJECTED_BY_API_SERVER));
    assert!(r.stamped_ref.is_none());
    assert!(h.configmaps().await.is_empty());
}

#[tokio::test]
async fn transient_conflict_is_retried() {
    let h = harness().await;
    h.store.inject(Op::Create, StoreError::Conflict("race".into()), 1);
    let r = h.realize(&template("mutable", None), "a", None).await;
    assert!(r.stamped_ref.is_some());
    assert_eq!(h.configmaps().await.len(), 1);
}

#[tokio::test]
async fn missing_upstream_output_keeps_previous_object() {
    let h = harness().await;
    let base = template("mutable", None);
    let key = h.realize(&base, "a", None).await.stamped_ref.unwrap();

    let mut needs = base.clone();
    needs.spec.template["data"]["src"] = json!("$(configs.source)$");
    let params: BTreeMap<String, Json> = [("tag".to_string(), json!("a"))].into_iter().collect();
    let configs: BTreeMap<String, Option<Json>> = [("source".to_string(), None)].into_iter().collect();
    let req = RealizeRequest { owner: &h.owner, blueprint: "basic", resource: "config", template: &needs, params, configs, previous: Some(&key) };
    let r = h.realizer.realize(&req).await.unwrap();
    assert_eq!((r.submitted.status, r.submitted.reason.as_str()), (ConditionStatus::Unknown, reasons::MISSING_UPSTREAM_OUTPUT));
    assert_eq!(r.stamped_ref, Some(key));
    assert!(h.configmaps().await[0]["data"].get("src").is_none());
    assert!(meta::str_field(&h.configmaps().await[0], "uid").is_some());
}

#[tokio::test]
async fn tekton_failed_run_keeps_last_good_output() {
    let h = harness().await;
    let t = template("tekton", Some("data.tag"));

    let one = h.realize(&t, "one", None).await.stamped_ref.unwrap();
    h.mark(&one, "Succeeded", "True");
    let two = h.realize(&t, "two", Some(&one)).await.stamped_ref.unwrap();
    assert_ne!(one, two);

    h.mark(&two, "Succeeded", "False");
    let r = h.realize(&t, "two", Some(&two)).await;
    assert_eq!(r.stamped_ref.as_ref(), Some(&two));
    assert_eq!((r.health.state, r.health.reason.as_str()), (HealthState::Unhealthy, reasons::SUCCEEDED_CONDITION));
    assert_eq!(r.output.unwrap().value, json!("one"));
    assert_eq!(r.submitted.status, ConditionStatus::True);
}

#[tokio::test]
async fn revisions_created_in_the_same_second_order_by_number() {
    for _ in 0..20 {
        let h = harness_over(|s| Arc::new(SameSecond(s)) as Arc<dyn ObjectStore>).await;
        let t = template("tekton", Some("data.tag"));

        let one = h.realize(&t, "one", None).await.stamped_ref.unwrap();
        h.mark(&one, "Succeeded", "True");
        let two = h.realize(&t, "two", Some(&one)).await.stamped_ref.unwrap();
        assert_ne!(one, two);

        let again = h.realize(&t, "two", Some(&two)).await;
        assert_eq!(again.stamped_ref.as_ref(), Some(&two));
        assert_eq!(again.health.state, HealthState::Unknown);
        assert_eq!(again.output.unwrap().value, json!("one"));

        let first = h.store.get(&one).await.unwrap().unwrap();
        let second = h.store.get(&two).await.unwrap().unwrap();
        assert_eq!((meta::revision(&first), meta::revision(&second)), (Some(1), Some(2)));
    }
}
