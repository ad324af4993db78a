#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use kiln_core::object::meta;
use kiln_core::{ObjectKey, ObjectStore, StoreError, TypeKey};
use kiln_store::{MemoryStore, Op};
use serde_json::json;

fn cm_type() -> TypeKey { TypeKey::new("v1", "ConfigMap") }

#[tokio::test]
async fn generate_name_produces_distinct_names() {
    let s = MemoryStore::new();
    let obj = json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "generateName": "rev-", "namespace": "ns" } });
    let a = s.create(obj.clone()).await.unwrap();
    let b = s.create(obj).await.unwrap();
    let (na, nb) = (meta::str_field(&a, "name").unwrap(), meta::str_field(&b, "name").unwrap());
    assert!(na.starts_with("rev-") && nb.starts_with("rev-"));
    assert_ne!(na, nb);
    assert_eq!(s.list(&cm_type(), Some("ns"), &BTreeMap::new()).await.unwrap().len(), 2);
}

#[tokio::test]
async fn duplicate_name_is_already_exists() {
    let s = MemoryStore::new();
    let obj = json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "a", "namespace": "ns" } });
    s.create(obj.clone()).await.unwrap();
    assert!(matches!(s.create(obj).await, Err(StoreError::AlreadyExists(_))));
}

#[tokio::test]
async fn stale_resource_version_conflicts() {
    let s = MemoryStore::new();
    let created = s
        .create(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "a", "namespace": "ns" }, "data": { "x": "1" } }))
        .await
        .unwrap();
    let mut first = created.clone();
    first["data"]["x"] = json!("2");
    let updated = s.update(first).await.unwrap();
    assert_eq!(meta::generation(&updated), 2);
    assert_eq!(meta::str_field(&updated, "uid"), meta::str_field(&created, "uid"));

    let mut stale = created;
    stale["data"]["x"] = json!("3");
    assert!(matches!(s.update(stale).await, Err(StoreError::Conflict(_))));
}

#[tokio::test]
async fn update_keeps_status_and_status_update_keeps_spec() {
    let s = MemoryStore::new();
    let created = s
        .create(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "a", "namespace": "ns" }, "data": { "x": "1" } }))
        .await
        .unwrap();
    let key = ObjectKey::of(&created).unwrap();
    s.set_status(&key, json!({ "phase": "Done" })).unwrap();

    let live = s.get(&key).await.unwrap().unwrap();
    let mut next = live.clone();
    next["data"]["x"] = json!("2");
    next.as_object_mut().unwrap().remove("status");
    let after = s.update(next).await.unwrap();
    assert_eq!(after["status"]["phase"], "Done");

    let mut st = after.clone();
    st["status"] = json!({ "phase": "Again" });
    st["data"]["x"] = json!("ignored");
    let after = s.update_status(st).await.unwrap();
    assert_eq!(after["status"]["phase"], "Again");
    assert_eq!(after["data"]["x"], "2");
}

#[tokio::test]
async fn list_filters_by_namespace_and_labels() {
    let s = MemoryStore::new();
    for (name, ns, team) in [("a", "one", "x"), ("b", "one", "y"), ("c", "two", "x")] {
        s.create(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": ns, "labels": { "team": team } }
        }))
        .await
        .unwrap();
    }
    let want: BTreeMap<String, String> = [("team".to_string(), "x".to_string())].into_iter().collect();
    let names = |v: Vec<serde_json::Value>| v.iter().map(|o| meta::str_field(o, "name").unwrap().to_string()).collect::<Vec<_>>();
    assert_eq!(names(s.list(&cm_type(), None, &want).await.unwrap()), vec!["a", "c"]);
    assert_eq!(names(s.list(&cm_type(), Some("one"), &want).await.unwrap()), vec!["a"]);
    assert!(s.list(&TypeKey::new("v1", "Secret"), None, &BTreeMap::new()).await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_cascades_to_dependents() {
    let s = MemoryStore::new();
    let owner = s.create(json!({ "apiVersion": "kiln.dev/v1alpha1", "kind": "Workload", "metadata": { "name": "w", "namespace": "ns" } })).await.unwrap();
    let uid = meta::str_field(&owner, "uid").unwrap().to_string();
    s.create(json!({
        "apiVersion": "v1", "kind": "ConfigMap",
        "metadata": { "name": "child", "namespace": "ns", "ownerReferences": [{ "apiVersion": "kiln.dev/v1alpha1", "kind": "Workload", "name": "w", "uid": uid }] }
    }))
    .await
    .unwrap();
    let mut rx = s.subscribe();
    s.delete(&ObjectKey::of(&owner).unwrap()).await.unwrap();
    assert!(s.is_empty());
    assert!(rx.recv().await.unwrap().deleted);
    assert!(rx.recv().await.unwrap().deleted);
}

#[tokio::test]
async fn injected_unavailability_only_hits_target_op() {
    let s = MemoryStore::new();
    s.inject(Op::List, StoreError::Unavailable("etcd".into()), 2);
    assert!(s.get(&ObjectKey::new(&cm_type(), Some("ns"), "a")).await.unwrap().is_none());
    assert!(s.list(&cm_type(), None, &BTreeMap::new()).await.is_err());
    assert!(s.list(&cm_type(), None, &BTreeMap::new()).await.is_err());
    assert!(s.list(&cm_type(), None, &BTreeMap::new()).await.is_ok());
}
