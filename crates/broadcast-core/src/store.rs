//! Value store: every value this node has learned, in arrival order.

use crate::value::Value;
use std::sync::RwLock;

/// Append-only sequence of learned values.
///
/// Thread-safe for use in multi-threaded Tokio runtime. Appends serialize on
/// the write lock; snapshots clone under the read lock, so a reader never sees
/// a partial append. Locks are never held across an `.await`.
#[derive(Debug, Default)]
pub struct ValueStore {
    values: RwLock<Vec<Value>>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value and return the new number of stored values.
    pub fn append(&self, value: Value) -> usize {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.push(value);
        values.len()
    }

    /// Point-in-time copy of all stored values.
    pub fn snapshot(&self) -> Vec<Value> {
        self.values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.values.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
