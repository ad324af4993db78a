use std::sync::Mutex;

use async_trait::async_trait;
use kiln_core::{EventSink, StampEvent};
use tracing::info;

/// Collects events in memory, in emission order.
#[derive(Default)]
pub struct MemoryEvents {
    events: Mutex<Vec<StampEvent>>,
}

impl MemoryEvents {
    pub fn new() -> Self { Self::default() }

    pub fn all(&self) -> Vec<StampEvent> { self.events.lock().map(|e| e.clone()).unwrap_or_default() }

    pub fn with_reason(&self, reason: &str) -> Vec<StampEvent> {
        self.all().into_iter().filter(|e| e.reason == reason).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut e) = self.events.lock() {
            e.clear();
        }
    }
}

#[async_trait]
impl EventSink for MemoryEvents {
    async fn record(&self, event: StampEvent) {
        info!(owner = %event.regarding, reason = %event.reason, note = %event.note, "event");
        if let Ok(mut e) = self.events.lock() {
            e.push(event);
        }
    }
}
