//! Event infrastructure for the dissemination engine.
//!
//! Provides `DisseminationEvent` for debug/monitoring and `EventBus` for
//! subscriptions. Tests use it to observe fan-outs that finish in the
//! background after the submit was already acknowledged.

use crate::node_id::NodeId;
use crate::value::{BroadcastId, Value};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted while handling requests and fanning out values.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DisseminationEvent {
    /// A value was appended to the value store.
    ValueStored {
        value: Value,
        /// Sender of the delivery (client or peer).
        from: NodeId,
    },
    /// A forward carrying an already-seen broadcast id was dropped.
    DuplicateSkipped { id: BroadcastId, from: NodeId },
    /// A neighbor acknowledged a forward.
    ForwardSucceeded { dest: NodeId, value: Value },
    /// A forward to a neighbor failed.
    ForwardFailed {
        dest: NodeId,
        value: Value,
        error: String,
    },
    /// Every forward of one fan-out has resolved.
    FanoutCompleted {
        value: Value,
        attempted: usize,
        failed: usize,
    },
    /// The local neighbor set was replaced.
    TopologyConfigured { neighbors: Vec<NodeId> },
}

/// Keeps a callback registered on an `EventBus` for as long as it lives.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(DisseminationEvent) + Send + Sync>;

/// Fan-in point for `DisseminationEvent`s. Shared between a node and its engine.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` until the returned `Subscription` is dropped.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(DisseminationEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // `emit` releases its read guard before invoking callbacks, so no guard
        // is live on this thread even when Drop runs inside a callback.
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }

    /// Deliver `event` to every callback, in subscription order.
    pub fn emit(&self, event: DisseminationEvent) {
        // Callbacks run without the lock held
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
