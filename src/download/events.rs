// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Non-blocking fan-out of job events.
//!
//! Every subscriber gets its own bounded queue. Publication never waits: a
//! subscriber whose queue is full simply misses that event and is expected to
//! reconcile from a fresh list snapshot when it reconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, error::TrySendError};

use super::types::JobEvent;
use crate::sync::resilient_lock;

/// Default per-subscriber buffer.
pub const DEFAULT_EVENT_BUFFER: usize = 100;

struct BusInner {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<JobEvent>>>,
    next_id: AtomicU64,
    buffer: usize,
    closed: AtomicBool,
}

/// Handle to the event bus. Cloning is cheap; all clones share subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a new subscriber.
    ///
    /// After [`close`](Self::close) the returned subscription is already
    /// ended and yields nothing.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut subscribers = resilient_lock(&self.inner.subscribers);
            if !self.inner.closed.load(Ordering::Acquire) {
                subscribers.insert(id, tx);
            }
        }
        Subscription {
            id,
            rx,
            bus: Arc::clone(&self.inner),
        }
    }

    /// Offer `event` to every subscriber without blocking.
    pub fn publish(&self, event: JobEvent) {
        let mut subscribers = resilient_lock(&self.inner.subscribers);
        subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(
                    subscriber = *id,
                    job_id = %event.job.id,
                    kind = event.kind.as_str(),
                    "Subscriber buffer full, dropping event"
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        resilient_lock(&self.inner.subscribers).len()
    }

    /// Drop every subscriber, ending their streams, and refuse new ones.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        resilient_lock(&self.inner.subscribers).clear();
    }
}

/// One subscriber's end of the bus. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<JobEvent>,
    bus: Arc<BusInner>,
}

impl Subscription {
    /// Next event; `None` once unsubscribed or the bus is closed and drained.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<JobEvent> {
        self.rx.try_recv().ok()
    }

    /// Leave the bus. Idempotent; the channel is closed exactly once.
    pub fn unsubscribe(&mut self) {
        resilient_lock(&self.bus.subscribers).remove(&self.id);
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
