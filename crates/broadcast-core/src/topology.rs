//! Topology store: the neighbor set this node forwards to.

use crate::node_id::NodeId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Holds the local neighbor set.
///
/// The set is stored as an immutable `Arc<[NodeId]>` and swapped wholesale by
/// `configure`, so a fan-out that grabbed a snapshot keeps seeing that exact
/// set even if a new configuration lands mid-flight.
#[derive(Debug)]
pub struct TopologyStore {
    neighbors: RwLock<Arc<[NodeId]>>,
}

impl Default for TopologyStore {
    fn default() -> Self {
        Self {
            neighbors: RwLock::new(Arc::from(Vec::<NodeId>::new())),
        }
    }
}

impl TopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the neighbor set. Duplicates collapse to their first occurrence.
    pub fn configure(&self, neighbors: impl IntoIterator<Item = NodeId>) {
        let mut seen = HashSet::new();
        let unique: Vec<NodeId> = neighbors
            .into_iter()
            .filter(|n| seen.insert(n.clone()))
            .collect();

        *self.neighbors.write().unwrap_or_else(|e| e.into_inner()) = Arc::from(unique);
    }

    /// Current neighbor set.
    pub fn neighbors(&self) -> Arc<[NodeId]> {
        Arc::clone(&self.neighbors.read().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Extract `local`'s entry from a full topology mapping.
///
/// Returns `None` when the mapping has no entry for `local`.
pub fn neighbors_for(topology: &HashMap<NodeId, Vec<NodeId>>, local: &NodeId) -> Option<Vec<NodeId>> {
    topology.get(local).cloned()
}
