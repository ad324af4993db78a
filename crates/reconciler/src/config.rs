//! Runtime configuration from `KILN_*` environment variables.

use std::time::Duration;

use kiln_realizer::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Concurrent reconcile workers.
    pub workers: usize,
    /// Distinct owners in the ready queue; further keys wait in overflow.
    pub queue_cap: usize,
    pub resync: Duration,
    /// Delay before retrying an owner after a transient store failure.
    pub requeue: Duration,
    pub retry: RetryPolicy,
    /// Blueprint kind used in condition types and reasons (`SupplyChainReady`).
    pub blueprint_kind: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_cap: 2048,
            resync: Duration::from_secs(300),
            requeue: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            blueprint_kind: "SupplyChain".into(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        let num = |k: &str, dflt: u64| std::env::var(k).ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(dflt);
        Self {
            workers: (num("KILN_WORKERS", d.workers as u64) as usize).max(1),
            queue_cap: (num("KILN_QUEUE_CAP", d.queue_cap as u64) as usize).max(1),
            resync: Duration::from_secs(num("KILN_RESYNC_SECS", d.resync.as_secs()).max(1)),
            requeue: Duration::from_secs(num("KILN_REQUEUE_SECS", d.requeue.as_secs())),
            retry: RetryPolicy::from_env(),
            blueprint_kind: std::env::var("KILN_BLUEPRINT_KIND").ok().filter(|s| !s.is_empty()).unwrap_or(d.blueprint_kind),
        }
    }
}
