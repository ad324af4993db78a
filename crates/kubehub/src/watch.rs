use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kiln_core::object::{labels, meta};
use kiln_core::{Json, ObjectKey, Trigger, TypeKey};
use kube::{
    core::DynamicObject,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{strip_managed_fields, Resources};

/// Owner changes reconcile that owner.
pub fn owner_trigger() -> impl Fn(&Json) -> Option<Trigger> + Send + Sync + 'static {
    |obj| ObjectKey::of(obj).map(Trigger::Owner)
}

/// Stamped object changes reconcile the owner named by their labels.
pub fn stamped_trigger(owner: TypeKey) -> impl Fn(&Json) -> Option<Trigger> + Send + Sync + 'static {
    move |obj| {
        if meta::label(obj, labels::OWNER_KIND) != Some(owner.kind.as_str()) {
            return None;
        }
        let name = meta::label(obj, labels::OWNER_NAME)?;
        Some(Trigger::Owner(ObjectKey::new(&owner, meta::str_field(obj, "namespace"), name)))
    }
}

/// Blueprint and template changes may affect every owner.
pub fn resync_trigger() -> impl Fn(&Json) -> Option<Trigger> + Send + Sync + 'static { |_| Some(Trigger::Resync) }

fn raw_of(obj: &DynamicObject) -> Result<Json> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

/// Upper bound for the pause between attempts to resolve a watched type.
fn resolve_backoff_max() -> Duration {
    Duration::from_secs(std::env::var("KILN_WATCH_BACKOFF_MAX_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(30))
}

fn next_wait(wait: Duration, max: Duration) -> Duration { wait.saturating_mul(2).min(max) }

/// Objects carried by one watch event. Errors yield nothing; the backoff
/// wrapped stream resumes on its own.
fn objects_of(ty: &TypeKey, ev: Result<Event<DynamicObject>, watcher::Error>) -> Vec<DynamicObject> {
    match ev {
        Ok(Event::Applied(o)) | Ok(Event::Deleted(o)) => vec![o],
        Ok(Event::Restarted(list)) => {
            debug!(ty = %ty, count = list.len(), "watch restart");
            list
        }
        Err(e) => {
            metrics::counter!("kiln_watch_errors_total", 1u64);
            warn!(ty = %ty, error = %e, "watcher: error, retrying with backoff");
            Vec::new()
        }
    }
}

/// List+watch `ty` and forward mapped triggers into `tx`. `label_selector`
/// narrows the watch server-side. Watch errors are retried with backoff;
/// the task ends only when the receiver is dropped.
pub fn spawn_watch<F>(
    resources: Resources,
    ty: TypeKey,
    namespace: Option<String>,
    label_selector: Option<String>,
    tx: mpsc::Sender<Trigger>,
    map: F,
) -> JoinHandle<Result<()>>
where
    F: Fn(&Json) -> Option<Trigger> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let max = resolve_backoff_max();
        let mut wait = Duration::from_secs(1);
        let r = loop {
            match resources.resolve(&ty).await {
                Ok(Some(r)) => break r,
                Ok(None) => warn!(ty = %ty, retry_secs = wait.as_secs(), "watcher: type not served yet"),
                Err(e) => warn!(ty = %ty, error = %e, retry_secs = wait.as_secs(), "watcher: discovery failed"),
            }
            if tx.is_closed() {
                return Ok(());
            }
            tokio::time::sleep(wait).await;
            resources.forget(&ty).await;
            wait = next_wait(wait, max);
        };
        let api = resources.api(&r, namespace.as_deref());
        let mut cfg = watcher::Config::default();
        if let Some(sel) = label_selector.as_deref() {
            cfg = cfg.labels(sel);
        }
        let stream = watcher::watcher(api, cfg).default_backoff();
        futures::pin_mut!(stream);
        info!(ty = %ty, ns = ?namespace, "watcher started");
        while let Some(ev) = stream.next().await {
            let objs = objects_of(&ty, ev);
            for o in objs.iter() {
                let raw = match raw_of(o) {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!(ty = %ty, error = %e, "watcher: skipping object");
                        continue;
                    }
                };
                if let Some(t) = map(&raw) {
                    metrics::counter!("kiln_watch_triggers_total", 1u64);
                    if tx.send(t).await.is_err() {
                        debug!(ty = %ty, "watcher: receiver closed");
                        return Ok(());
                    }
                }
            }
        }
        Err(anyhow!("watch stream for {} ended", ty))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stamped_objects_map_to_their_owner() {
        let owner = TypeKey::new("kiln.dev/v1alpha1", "Workload");
        let f = stamped_trigger(owner.clone());
        let obj = json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": "app-cfg", "namespace": "dev", "labels": { "kiln.dev/owner-kind": "Workload", "kiln.dev/owner-name": "app" } }
        });
        assert_eq!(f(&obj), Some(Trigger::Owner(ObjectKey::new(&owner, Some("dev"), "app"))));
        let foreign = json!({ "metadata": { "labels": { "kiln.dev/owner-kind": "Deliverable", "kiln.dev/owner-name": "app" } } });
        assert_eq!(f(&foreign), None);
        assert_eq!(resync_trigger()(&obj), Some(Trigger::Resync));
    }

    #[test]
    fn watch_errors_are_skipped_not_fatal() {
        let ty = TypeKey::new("v1", "ConfigMap");
        let err = watcher::Error::WatchError(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version".into(),
            reason: "Expired".into(),
            code: 410,
        });
        assert!(objects_of(&ty, Err(err)).is_empty());

        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "a", "namespace": "dev" }
        }))
        .unwrap();
        assert_eq!(objects_of(&ty, Ok(Event::Applied(obj.clone()))).len(), 1);
        assert_eq!(objects_of(&ty, Ok(Event::Restarted(vec![obj.clone(), obj]))).len(), 2);
    }

    #[test]
    fn discovery_retry_doubles_up_to_cap() {
        let max = Duration::from_secs(30);
        assert_eq!(next_wait(Duration::from_secs(1), max), Duration::from_secs(2));
        assert_eq!(next_wait(Duration::from_secs(16), max), max);
        assert_eq!(next_wait(max, max), max);
    }
}
