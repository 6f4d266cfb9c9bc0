//! Event bus: per-subscriber channels with an optional loop-id filter.
//!
//! The delivery rule lives in [`LoopEvent::matches_filter`]: an event is
//! withheld from a filtered subscriber only when it carries a differing
//! loop id; events without a loop id reach every subscriber.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::trace;

use crate::domain::LoopEvent;

struct Subscriber {
    filter: Option<String>,
    tx: mpsc::UnboundedSender<LoopEvent>,
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<u64, Subscriber>,
}

/// Broadcast bus. Cheap to clone; clones share the subscriber registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe, optionally filtered to one loop id. The returned
    /// subscription unsubscribes on drop; explicit `unsubscribe` is
    /// idempotent and safe to interleave with delivery.
    pub fn subscribe(&self, filter: Option<String>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .lock()
            .expect("event bus registry poisoned")
            .subscribers
            .insert(id, Subscriber { filter, tx });
        Subscription {
            id,
            receiver: rx,
            registry: self.registry.clone(),
        }
    }

    /// Deliver an event to every subscriber it matches. Subscribers whose
    /// receiver is gone are pruned here.
    pub fn emit(&self, event: LoopEvent) {
        trace!(event_type = %event.event_type, loop_id = ?event.loop_id, "emit");
        let mut registry = self.registry.lock().expect("event bus registry poisoned");
        registry.subscribers.retain(|_, subscriber| {
            if !event.matches_filter(subscriber.filter.as_deref()) {
                return !subscriber.tx.is_closed();
            }
            subscriber.tx.send(event.clone()).is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .lock()
            .expect("event bus registry poisoned")
            .subscribers
            .len()
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<LoopEvent>,
    registry: Arc<Mutex<Registry>>,
}

impl Subscription {
    /// Receive the next matching event; `None` after unsubscription once the
    /// buffer drains.
    pub async fn recv(&mut self) -> Option<LoopEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<LoopEvent> {
        self.receiver.try_recv().ok()
    }

    /// Remove this subscription from the bus. Idempotent.
    pub fn unsubscribe(&self) {
        self.registry
            .lock()
            .expect("event bus registry poisoned")
            .subscribers
            .remove(&self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
