#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kiln_core::condition::{find, reasons};
use kiln_core::object::meta;
use kiln_core::{ConditionStatus, Json, ObjectKey, ObjectStore, Owner, OwnerStatus, StoreError, Template, TypeKey};
use kiln_eval::JsonPath;
use kiln_realizer::RetryPolicy;
use kiln_reconciler::{Config, Reconciler};
use kiln_store::{MemoryEvents, MemoryRepository, MemoryStore, Op};
use serde_json::json;

fn source_template(lifecycle: &str) -> Json {
    json!({
        "apiVersion": "kiln.dev/v1alpha1", "kind": "ClusterSourceTemplate",
        "metadata": { "name": "source" },
        "spec": {
            "lifecycle": lifecycle,
            "configPath": "data.url",
            "healthRule": { "alwaysHealthy": {} },
            "template": {
                "apiVersion": "v1", "kind": "ConfigMap",
                "metadata": { "name": "$(workload.metadata.name)$-source" },
                "data": { "url": "$(workload.spec.source)$" }
            }
        }
    })
}

fn fixtures() -> Vec<Json> {
    vec![
        source_template("mutable"),
        json!({
            "apiVersion": "kiln.dev/v1alpha1", "kind": "ClusterImageTemplate",
            "metadata": { "name": "image" },
            "spec": {
                "lifecycle": "immutable",
                "configPath": "data.src",
                "params": [{ "name": "tag", "default": "latest" }],
                "template": {
                    "apiVersion": "v1", "kind": "ConfigMap",
                    "metadata": { "name": "$(workload.metadata.name)$-image" },
                    "data": { "src": "$(configs.source)$", "tag": "$(params.tag)$" }
                }
            }
        }),
        json!({
            "apiVersion": "kiln.dev/v1alpha1", "kind": "SupplyChain",
            "metadata": { "name": "web" },
            "spec": {
                "selector": { "matchLabels": { "type": "web" } },
                "resources": [
                    { "name": "source", "templateRef": { "kind": "ClusterSourceTemplate", "name": "source" } },
                    {
                        "name": "image",
                        "templateRef": { "kind": "ClusterImageTemplate", "name": "image" },
                        "params": [{ "name": "tag", "value": "v1" }],
                        "configs": [{ "resource": "source", "name": "source" }]
                    }
                ]
            }
        }),
    ]
}

struct Env {
    store: Arc<MemoryStore>,
    repo: Arc<MemoryRepository>,
    events: Arc<MemoryEvents>,
    reconciler: Reconciler,
}

fn env(docs: &[Json]) -> Env {
    let store = Arc::new(MemoryStore::new());
    let repo = Arc::new(MemoryRepository::from_documents(docs, "SupplyChain"));
    let events = Arc::new(MemoryEvents::new());
    let config = Config { retry: RetryPolicy::immediate(2), requeue: Duration::from_secs(7), ..Config::default() };
    let reconciler = Reconciler::new(store.clone(), repo.clone(), events.clone(), Arc::new(JsonPath::new()), config);
    Env { store, repo, events, reconciler }
}

impl Env {
    async fn owner(&self, labels: Json) -> ObjectKey {
        let raw = self
            .store
            .create(json!({
                "apiVersion": "kiln.dev/v1alpha1", "kind": "Workload",
                "metadata": { "name": "app", "namespace": "dev", "labels": labels },
                "spec": { "source": "git://example/app" }
            }))
            .await
            .unwrap();
        ObjectKey::of(&raw).unwrap()
    }

    async fn status(&self, key: &ObjectKey) -> OwnerStatus {
        Owner::from_object(self.store.get(key).await.unwrap().unwrap()).unwrap().status
    }

    async fn configmaps(&self) -> Vec<Json> {
        self.store.list(&TypeKey::new("v1", "ConfigMap"), Some("dev"), &BTreeMap::new()).await.unwrap()
    }
}

fn cond<'a>(s: &'a OwnerStatus, ty: &str) -> (ConditionStatus, &'a str) {
    let c = find(&s.conditions, ty).unwrap();
    (c.status, c.reason.as_str())
}

#[tokio::test]
async fn chain_converges_and_status_stabilises() {
    let e = env(&fixtures());
    let key = e.owner(json!({ "type": "web" })).await;

    let out = e.reconciler.reconcile(&key).await.unwrap();
    assert!(out.status_written);
    assert_eq!(out.requeue_after, None);
    let s = e.status(&key).await;
    assert_eq!(cond(&s, "SupplyChainReady"), (ConditionStatus::True, "Ready"));
    assert_eq!(cond(&s, "ResourcesSubmitted"), (ConditionStatus::False, reasons::NO_HEALTHY_IMMUTABLE_OBJECT));
    assert_eq!(cond(&s, "Ready").0, ConditionStatus::False);
    assert_eq!(s.blueprint_ref.as_ref().unwrap().name, "web");
    assert_eq!(s.resource("source").unwrap().outputs[0].preview, "git://example/app");

    // the image revision consumed the source output and the resource param
    let image_ref = s.resource("image").unwrap().stamped_ref.clone().unwrap();
    let image = e.store.get(&image_ref).await.unwrap().unwrap();
    assert_eq!(image["data"], json!({ "src": "git://example/app", "tag": "v1" }));
    assert!(meta::is_owned_by(&image, &Owner::from_object(e.store.get(&key).await.unwrap().unwrap()).unwrap().uid));

    e.store.set_status(&image_ref, json!({ "conditions": [{ "type": "Ready", "status": "True" }] })).unwrap();
    assert!(e.reconciler.reconcile(&key).await.unwrap().status_written);
    let s = e.status(&key).await;
    assert_eq!(cond(&s, "ResourcesSubmitted"), (ConditionStatus::True, "ResourceSubmissionComplete"));
    assert_eq!(cond(&s, "ResourcesHealthy"), (ConditionStatus::True, "Ready"));
    assert_eq!(cond(&s, "Ready"), (ConditionStatus::True, "Ready"));
    assert_eq!(s.resource("image").unwrap().outputs[0].preview, "git://example/app");

    // nothing changed: no write, identical bytes
    let before = serde_json::to_vec(&s).unwrap();
    let out = e.reconciler.reconcile(&key).await.unwrap();
    assert!(!out.status_written);
    assert_eq!(serde_json::to_vec(&e.status(&key).await).unwrap(), before);
    assert_eq!(e.configmaps().await.len(), 2);
}

#[tokio::test]
async fn unmatched_owner_reports_not_found() {
    let e = env(&fixtures());
    let key = e.owner(json!({ "type": "cron" })).await;
    e.reconciler.reconcile(&key).await.unwrap();
    let s = e.status(&key).await;
    assert_eq!(cond(&s, "SupplyChainReady"), (ConditionStatus::False, "SupplyChainNotFound"));
    assert_eq!(cond(&s, "Ready"), (ConditionStatus::False, "SupplyChainNotFound"));
    assert!(s.resources.is_empty());
    assert!(e.configmaps().await.is_empty());
}

#[tokio::test]
async fn template_options_pick_by_owner_fields() {
    let mut docs = fixtures();
    let mut git = source_template("mutable");
    git["metadata"]["name"] = json!("source-git");
    let mut oci = source_template("mutable");
    oci["metadata"]["name"] = json!("source-oci");
    docs.push(git);
    docs.push(oci);
    docs[2]["spec"]["resources"][0]["templateRef"] = json!({
        "kind": "ClusterSourceTemplate",
        "options": [
            { "name": "source-oci", "selector": { "matchFields": [{ "key": "spec.image", "operator": "Exists" }] } },
            { "name": "source-git", "selector": { "matchFields": [{ "key": "spec.source", "operator": "Exists" }] } }
        ]
    });
    let e = env(&docs);
    let key = e.owner(json!({ "type": "web" })).await;
    e.reconciler.reconcile(&key).await.unwrap();
    let s = e.status(&key).await;
    assert_eq!(s.resource("source").unwrap().template_ref.as_ref().unwrap().name, "source-git");
}

#[tokio::test]
async fn missing_template_is_a_retrieval_failure() {
    let e = env(&fixtures());
    e.repo.remove_template("ClusterImageTemplate", "image");
    let key = e.owner(json!({ "type": "web" })).await;
    e.reconciler.reconcile(&key).await.unwrap();
    let s = e.status(&key).await;
    let image = s.resource("image").unwrap();
    let c = find(&image.conditions, "ResourceSubmitted").unwrap();
    assert_eq!((c.status, c.reason.as_str()), (ConditionStatus::False, reasons::TEMPLATE_OBJECT_RETRIEVAL_FAILURE));
    // the source resource is still realized
    assert_eq!(e.configmaps().await.len(), 1);
}

#[tokio::test]
async fn unavailable_store_requeues() {
    let e = env(&fixtures());
    let key = e.owner(json!({ "type": "web" })).await;
    e.store.inject(Op::List, StoreError::Unavailable("etcd leader election".into()), 16);
    let out = e.reconciler.reconcile(&key).await.unwrap();
    assert_eq!(out.requeue_after, Some(Duration::from_secs(7)));
    let s = e.status(&key).await;
    assert_eq!(cond(&s, "ResourcesSubmitted"), (ConditionStatus::Unknown, reasons::OBJECT_STORE_UNAVAILABLE));
}

#[tokio::test]
async fn status_write_conflict_is_retried() {
    let e = env(&fixtures());
    let key = e.owner(json!({ "type": "web" })).await;
    e.store.inject(Op::UpdateStatus, StoreError::Conflict("stale".into()), 1);
    assert!(e.reconciler.reconcile(&key).await.unwrap().status_written);
    assert!(find(&e.status(&key).await.conditions, "Ready").is_some());
}

#[tokio::test]
async fn switching_source_to_immutable_replaces_the_mutable_object() {
    let e = env(&fixtures());
    let key = e.owner(json!({ "type": "web" })).await;
    e.reconciler.reconcile(&key).await.unwrap();
    let mutable = e.status(&key).await.resource("source").unwrap().stamped_ref.clone().unwrap();
    assert_eq!(mutable.name, "app-source");

    e.repo.put_template(Template::from_manifest(&source_template("immutable")).unwrap());
    e.reconciler.reconcile(&key).await.unwrap();
    assert!(e.store.get(&mutable).await.unwrap().is_none());
    let revision = e.status(&key).await.resource("source").unwrap().stamped_ref.clone().unwrap();
    assert!(revision.name.starts_with("app-source-"));
    assert_eq!(e.events.with_reason("StampedObjectRemoved").len(), 1);
}

#[tokio::test]
async fn deleted_owner_is_a_no_op() {
    let e = env(&fixtures());
    let key = e.owner(json!({ "type": "web" })).await;
    e.reconciler.reconcile(&key).await.unwrap();
    e.store.delete(&key).await.unwrap();
    assert!(e.store.is_empty());
    let out = e.reconciler.reconcile(&key).await.unwrap();
    assert!(!out.status_written);
}
