//! Broadcast identities this node has already accepted.

use crate::value::BroadcastId;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;

/// Where an accepted broadcast stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Stored; its fan-out has not resolved yet.
    InFlight,
    /// Stored and delivered to every neighbor (or handed to a background fan-out).
    Settled,
    /// Stored, but the fan-out failed. A redelivery re-runs it.
    Failed,
}

/// Outcome of offering a broadcast identity to the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Never seen: store the value and fan it out.
    New,
    /// Stored earlier but its fan-out failed: fan out again without storing.
    Retry,
    /// Already stored and settled or in flight: acknowledge only.
    Duplicate,
}

/// Accepted broadcast identities, for at-most-once storage and re-forwarding.
#[derive(Debug, Default)]
pub struct SeenSet {
    ids: Mutex<HashMap<BroadcastId, State>>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer `id`. Check and update happen under one lock, so two concurrent
    /// deliveries of the same identity cannot both be admitted.
    pub fn admit(&self, id: BroadcastId) -> Admission {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        match ids.entry(id) {
            Entry::Vacant(entry) => {
                entry.insert(State::InFlight);
                Admission::New
            }
            Entry::Occupied(mut entry) if *entry.get() == State::Failed => {
                entry.insert(State::InFlight);
                Admission::Retry
            }
            Entry::Occupied(_) => Admission::Duplicate,
        }
    }

    /// Mark the fan-out of `id` as done.
    pub fn settle(&self, id: &BroadcastId) {
        self.set(id, State::Settled);
    }

    /// Mark the fan-out of `id` as failed so a redelivery runs it again.
    pub fn fail(&self, id: &BroadcastId) {
        self.set(id, State::Failed);
    }

    fn set(&self, id: &BroadcastId, state: State) {
        if let Some(current) = self
            .ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(id)
        {
            *current = state;
        }
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
