//! Coalescing work queue keyed by owner.
//!
//! Keys are served FIFO. A key pushed while queued is coalesced; a key pushed
//! while a worker holds it is parked and re-queued by [`WorkQueue::done`], so at
//! most one reconcile per owner is in flight. Keys beyond the capacity wait in
//! an overflow list and move into the ready queue as it drains; none are lost.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kiln_core::ObjectKey;
use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct Inner {
    order: VecDeque<ObjectKey>,
    overflow: VecDeque<ObjectKey>,
    /// Keys in `order` or `overflow`.
    queued: FxHashSet<ObjectKey>,
    active: FxHashSet<ObjectKey>,
    dirty: FxHashSet<ObjectKey>,
    deferred: u64,
    closed: bool,
}

impl Inner {
    /// Queue a key not already pending.
    fn enqueue(&mut self, key: ObjectKey, cap: usize) {
        self.queued.insert(key.clone());
        if self.order.len() < cap {
            self.order.push_back(key);
            return;
        }
        self.deferred += 1;
        metrics::counter!("kiln_queue_deferred_total", 1u64);
        debug!(owner = %key, pending = self.overflow.len() + 1, "queue: full, deferring");
        self.overflow.push_back(key);
    }
}

pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    cap: usize,
}

impl WorkQueue {
    pub fn with_capacity(cap: usize) -> Self { Self { inner: Mutex::new(Inner::default()), notify: Notify::new(), cap: cap.max(1) } }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn push(&self, key: ObjectKey) {
        let mut q = self.lock();
        if q.closed {
            return;
        }
        if q.active.contains(&key) {
            q.dirty.insert(key);
            return;
        }
        if q.queued.contains(&key) {
            return;
        }
        q.enqueue(key, self.cap);
        drop(q);
        self.notify.notify_one();
    }

    /// Push `key` once `delay` has elapsed.
    pub fn push_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let q = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.push(key);
        });
    }

    /// Next key to reconcile; `None` once the queue is closed and drained.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut q = self.lock();
                if let Some(key) = q.order.pop_front() {
                    q.queued.remove(&key);
                    q.active.insert(key.clone());
                    if let Some(waiting) = q.overflow.pop_front() {
                        q.order.push_back(waiting);
                    }
                    let more = !q.order.is_empty();
                    drop(q);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if q.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release `key`; a push that arrived meanwhile queues it again.
    pub fn done(&self, key: &ObjectKey) {
        let mut q = self.lock();
        q.active.remove(key);
        if q.dirty.remove(key) && !q.closed && !q.queued.contains(key) {
            q.enqueue(key.clone(), self.cap);
            drop(q);
            self.notify.notify_one();
        }
    }

    /// Stop accepting keys; workers drain what is queued, then see `None`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Pending keys, overflow included.
    pub fn len(&self) -> usize { self.lock().queued.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    /// Pushes that found the ready queue full.
    pub fn deferred(&self) -> u64 { self.lock().deferred }
}
