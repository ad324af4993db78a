//! Kiln reconciler: the per-owner reconcile cycle, a coalescing work queue and
//! the controller loop that feeds it from triggers and a resync timer.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use kiln_core::{ObjectKey, ObjectStore, Trigger, TypeKey};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub mod config;
pub mod queue;
pub mod reconcile;
pub mod select;

pub use config::Config;
pub use queue::WorkQueue;
pub use reconcile::{merge_params, Outcome, ReconcileError, Reconciler};

/// Drives reconciles for every owner of one type.
pub struct Controller {
    reconciler: Arc<Reconciler>,
    store: Arc<dyn ObjectStore>,
    queue: Arc<WorkQueue>,
    owner_type: TypeKey,
    namespace: Option<String>,
}

impl Controller {
    pub fn new(reconciler: Arc<Reconciler>, store: Arc<dyn ObjectStore>, owner_type: TypeKey, namespace: Option<String>) -> Self {
        let queue = Arc::new(WorkQueue::with_capacity(reconciler.config().queue_cap));
        Self { reconciler, store, queue, owner_type, namespace }
    }

    pub fn queue(&self) -> Arc<WorkQueue> { Arc::clone(&self.queue) }

    /// Enqueue every owner currently in the store.
    pub async fn resync(&self) {
        match self.store.list(&self.owner_type, self.namespace.as_deref(), &BTreeMap::new()).await {
            Ok(owners) => {
                debug!(count = owners.len(), "controller: resync");
                for o in owners.iter() {
                    if let Some(k) = ObjectKey::of(o) {
                        self.queue.push(k);
                    }
                }
            }
            Err(e) => warn!(ty = %self.owner_type, error = %e, "controller: resync list failed"),
        }
    }

    /// Run workers until `shutdown` resolves or `triggers` closes, then drain.
    pub async fn run(self, mut triggers: mpsc::Receiver<Trigger>, shutdown: impl Future<Output = ()>) {
        let cfg = self.reconciler.config().clone();
        let mut workers = Vec::with_capacity(cfg.workers);
        for id in 0..cfg.workers {
            let queue = Arc::clone(&self.queue);
            let rec = Arc::clone(&self.reconciler);
            let requeue = cfg.requeue;
            workers.push(tokio::spawn(async move {
                while let Some(key) = queue.next().await {
                    match rec.reconcile(&key).await {
                        Ok(out) => {
                            if let Some(d) = out.requeue_after {
                                queue.push_after(key.clone(), d);
                            }
                        }
                        Err(e) => {
                            metrics::counter!("kiln_reconcile_errors_total", 1u64);
                            warn!(worker = id, owner = %key, error = %e, "controller: reconcile failed");
                            queue.push_after(key.clone(), requeue);
                        }
                    }
                    queue.done(&key);
                }
                debug!(worker = id, "controller: worker stopped");
            }));
        }
        info!(ty = %self.owner_type, workers = cfg.workers, "controller started");

        self.resync().await;
        let mut ticker = tokio::time::interval(cfg.resync);
        ticker.tick().await;
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                maybe = triggers.recv() => match maybe {
                    Some(Trigger::Owner(k)) => self.queue.push(k),
                    Some(Trigger::Resync) => self.resync().await,
                    None => {
                        debug!("trigger channel closed");
                        break;
                    }
                },
                _ = ticker.tick() => self.resync().await,
                _ = &mut shutdown => break,
            }
        }
        self.queue.close();
        for w in workers {
            let _ = w.await;
        }
        info!("controller stopped");
    }
}
