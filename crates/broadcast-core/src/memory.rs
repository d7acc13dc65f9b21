//! In-memory network for simulating a cluster inside one process.
//!
//! Forwards are delivered by calling the destination node's `submit` handler
//! directly, so a forward resolves exactly when the destination has handled
//! it. Nodes can be marked down to simulate unreachable neighbors.

use crate::config::EngineConfig;
use crate::node::BroadcastNode;
use crate::node_id::NodeId;
use crate::protocol::{Submit, Topology};
use crate::transport::{Result, Transport, TransportError};
use crate::value::Value;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::debug;

/// One forward attempt observed on the network.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub from: NodeId,
    pub to: NodeId,
    pub submit: Submit,
}

/// A set of nodes wired together in memory.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<NodeId, Arc<BroadcastNode<MemoryTransport>>>>,
    down: RwLock<HashSet<NodeId>>,
    deliveries: Mutex<Vec<Delivery>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a node, attach it to the network and announce the new membership.
    pub fn add_node(self: &Arc<Self>, id: NodeId, config: EngineConfig) -> Arc<BroadcastNode<MemoryTransport>> {
        let transport = MemoryTransport {
            local: id.clone(),
            network: Arc::downgrade(self),
        };
        let node = Arc::new(BroadcastNode::new(Arc::new(transport), config));

        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes.insert(id, Arc::clone(&node));
        let members: Vec<NodeId> = nodes.keys().cloned().collect();
        for member in nodes.values() {
            member.set_cluster(members.iter().cloned());
        }

        node
    }

    pub fn node(&self, id: &NodeId) -> Option<Arc<BroadcastNode<MemoryTransport>>> {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Deliver the same topology to every node.
    pub fn configure_topology(&self, topology: &Topology) {
        let nodes: Vec<_> = self
            .nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for node in nodes {
            node.configure_topology(topology);
        }
    }

    /// Make forwards to `id` fail with `Unreachable` (or restore them).
    pub fn set_down(&self, id: &NodeId, down: bool) {
        let mut set = self.down.write().unwrap_or_else(|e| e.into_inner());
        if down {
            set.insert(id.clone());
        } else {
            set.remove(id);
        }
    }

    fn is_down(&self, id: &NodeId) -> bool {
        self.down
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }

    /// Every forward attempted so far, in send order.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Forwards attempted to `to` carrying `value`.
    pub fn deliveries_of(&self, value: &Value, to: &NodeId) -> usize {
        self.deliveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|d| d.submit.value == *value && d.to == *to)
            .count()
    }
}

/// A node's handle onto a `MemoryNetwork`.
pub struct MemoryTransport {
    local: NodeId,
    network: Weak<MemoryNetwork>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_id(&self) -> &NodeId {
        &self.local
    }

    async fn forward(&self, dest: &NodeId, submit: Submit) -> Result<()> {
        let network = self.network.upgrade().ok_or(TransportError::Closed)?;

        network
            .deliveries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Delivery {
                from: self.local.clone(),
                to: dest.clone(),
                submit: submit.clone(),
            });

        if network.is_down(dest) {
            return Err(TransportError::Unreachable(dest.clone()));
        }
        let node = network
            .node(dest)
            .ok_or_else(|| TransportError::Unreachable(dest.clone()))?;

        debug!("{} -> {}: submit {}", self.local, dest, submit.value);
        node.submit(&self.local, submit)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Rejected {
                dest: dest.clone(),
                code: 13,
                text: e.to_string(),
            })
    }
}
