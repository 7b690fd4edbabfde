// Mixing Queue — accepted requests waiting for a dispatch loop
//
// Entries go in arrival order. Draining is bounded per pass so a burst does
// not turn into one giant batch; dispatch order inside and across batches is
// scrambled by the mixer, not by the queue.

use super::pending::PendingRequest;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Mixing queue is closed")]
pub struct QueueClosed;

#[derive(Default)]
pub struct MixingQueue {
    items: Mutex<VecDeque<Arc<PendingRequest>>>,
    notify: Notify,
    closed: AtomicBool,
}

impl MixingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue without blocking. Fails once the queue is closed.
    pub fn push(&self, request: Arc<PendingRequest>) -> Result<(), QueueClosed> {
        {
            let mut items = self.items.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(QueueClosed);
            }
            items.push_back(request);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Take up to `max` queued requests without waiting
    pub fn try_next_batch(&self, max: usize) -> Vec<Arc<PendingRequest>> {
        let mut items = self.items.lock();
        let count = max.min(items.len());
        items.drain(..count).collect()
    }

    /// Wait until at least one request is queued, then take up to `max`.
    ///
    /// Returns `None` once the queue has been closed.
    pub async fn next_batch(&self, max: usize) -> Option<Vec<Arc<PendingRequest>>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a close() between the check and
            // the await is not missed
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            let batch = self.try_next_batch(max);
            if !batch.is_empty() {
                // Leftovers belong to another dispatch loop
                if !self.is_empty() {
                    self.notify.notify_one();
                }
                return Some(batch);
            }

            notified.await;
        }
    }

    /// Close the queue and return whatever was never drained
    pub fn close(&self) -> Vec<Arc<PendingRequest>> {
        let leftover = {
            let mut items = self.items.lock();
            self.closed.store(true, Ordering::Release);
            items.drain(..).collect()
        };
        self.notify.notify_waiters();
        leftover
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
