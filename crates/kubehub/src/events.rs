use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kiln_core::{EventSink, StampEvent};
use kube::{
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client,
};
use tracing::warn;

/// Publishes stamping events through the kube event recorder.
pub struct KubeEvents {
    client: Client,
    reporter: Reporter,
}

impl KubeEvents {
    pub fn new(client: Client, controller: impl Into<String>) -> Self {
        Self { client, reporter: Reporter { controller: controller.into(), instance: std::env::var("HOSTNAME").ok() } }
    }
}

fn reference(ev: &StampEvent) -> ObjectReference {
    ObjectReference {
        api_version: Some(ev.regarding.api_version.clone()),
        kind: Some(ev.regarding.kind.clone()),
        name: Some(ev.regarding.name.clone()),
        namespace: ev.regarding.namespace.clone(),
        uid: Some(ev.regarding_uid.clone()).filter(|u| !u.is_empty()),
        ..Default::default()
    }
}

#[async_trait]
impl EventSink for KubeEvents {
    async fn record(&self, ev: StampEvent) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference(&ev));
        let out = Event {
            type_: if ev.warning { EventType::Warning } else { EventType::Normal },
            reason: ev.reason.clone(),
            note: Some(ev.note.clone()),
            action: "Stamp".into(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(out).await {
            warn!(owner = %ev.regarding, reason = %ev.reason, error = %e, "events: publish failed");
        }
    }
}
