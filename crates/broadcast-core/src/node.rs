//! BroadcastNode: the `submit`, `query` and `configure-topology` handlers.
//!
//! Each request is handled independently; the only state shared between
//! requests lives in the value store, the topology store and the seen set,
//! each behind its own lock. A long fan-out never blocks a `query`.

use crate::config::{AckMode, EngineConfig};
use crate::engine::{Disseminator, FanoutError, Origin};
use crate::events::{DisseminationEvent, EventBus};
use crate::node_id::NodeId;
use crate::protocol::{Reply, Request, Submit, Topology};
use crate::seen::{Admission, SeenSet};
use crate::store::ValueStore;
use crate::topology::{self, TopologyStore};
use crate::transport::Transport;
use crate::value::{BroadcastId, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Malformed request: {0}")]
    Validation(#[from] serde_json::Error),

    #[error("Fan-out failed: {0}")]
    Fanout(#[from] FanoutError),
}

pub type Result<T> = std::result::Result<T, HandlerError>;

/// One node of the cluster: stores, engine and request handlers.
pub struct BroadcastNode<T> {
    id: NodeId,
    config: EngineConfig,
    values: ValueStore,
    topology: Arc<TopologyStore>,
    seen: SeenSet,
    next_seq: AtomicU64,
    /// Other nodes of the cluster, as announced at startup
    cluster: RwLock<HashSet<NodeId>>,
    engine: Disseminator<T>,
    events: Arc<EventBus>,
}

impl<T: Transport> BroadcastNode<T> {
    /// Create a node with empty stores. The node's identity comes from the transport.
    pub fn new(transport: Arc<T>, config: EngineConfig) -> Self {
        let id = transport.local_id().clone();
        let topology = Arc::new(TopologyStore::new());
        let events = Arc::new(EventBus::new());
        let engine = Disseminator::new(transport, Arc::clone(&topology), Arc::clone(&events));

        Self {
            id,
            config,
            values: ValueStore::new(),
            topology,
            seen: SeenSet::new(),
            next_seq: AtomicU64::new(0),
            cluster: RwLock::new(HashSet::new()),
            engine,
            events,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn engine(&self) -> &Disseminator<T> {
        &self.engine
    }

    /// Record the cluster membership so submits from peers are recognized.
    pub fn set_cluster(&self, nodes: impl IntoIterator<Item = NodeId>) {
        let members: HashSet<NodeId> = nodes.into_iter().filter(|n| *n != self.id).collect();
        *self.cluster.write().unwrap_or_else(|e| e.into_inner()) = members;
    }

    fn is_cluster_member(&self, id: &NodeId) -> bool {
        self.cluster
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }

    /// Parse a message body and dispatch it to the matching handler.
    ///
    /// Returns the reply to send back to `src`. On error, nothing is sent.
    pub async fn handle(&self, src: &NodeId, body: &serde_json::Value) -> Result<Reply> {
        let request = Request::from_body(body)?;
        debug!("Handling {} from {}", request.kind(), src);

        match request {
            Request::Submit(submit) => self.submit(src, submit).await,
            Request::Query => Ok(self.query()),
            Request::ConfigureTopology { topology } => Ok(self.configure_topology(&topology)),
        }
    }

    /// Store a value and fan it out to the neighbors, excluding the sender.
    ///
    /// With dedup on, a forward whose broadcast id was already accepted is
    /// acknowledged without being stored or re-forwarded. The exception is an
    /// id whose blocking fan-out failed: its redelivery re-runs the fan-out
    /// without storing the value a second time.
    pub async fn submit(&self, src: &NodeId, submit: Submit) -> Result<Reply> {
        let origin = self.classify(src, &submit);
        let dedup = self.config.dedup;

        let (id, admission) = match submit.id {
            Some(id) if dedup => {
                let admission = self.seen.admit(id.clone());
                (id, admission)
            }
            Some(id) => (id, Admission::New),
            None => {
                let id = self.mint_id();
                if dedup {
                    self.seen.admit(id.clone());
                }
                (id, Admission::New)
            }
        };

        match admission {
            Admission::Duplicate => {
                debug!("Skipping duplicate broadcast {} from {}", id, src);
                self.events.emit(DisseminationEvent::DuplicateSkipped {
                    id,
                    from: src.clone(),
                });
                return Ok(Reply::SubmitOk);
            }
            Admission::Retry => {
                debug!("Redelivery of {} from {}, fanning out again", id, src);
            }
            Admission::New => {
                let stored = self.values.append(submit.value.clone());
                debug!("Stored {} from {} ({} value(s) total)", submit.value, src, stored);
                self.events.emit(DisseminationEvent::ValueStored {
                    value: submit.value.clone(),
                    from: src.clone(),
                });
            }
        }

        let forward = Submit::forward(submit.value, id.clone());
        match self.config.ack_mode {
            AckMode::Immediate => {
                if dedup {
                    self.seen.settle(&id);
                }
                // Detached: the outcome is logged and published on the event bus
                drop(self.engine.spawn_fan_out(forward, origin));
            }
            AckMode::AfterFanout => {
                let outcome = self.engine.fan_out(forward, &origin).await;
                if dedup {
                    match &outcome {
                        Ok(_) => self.seen.settle(&id),
                        Err(_) => self.seen.fail(&id),
                    }
                }
                outcome?;
            }
        }

        Ok(Reply::SubmitOk)
    }

    /// Snapshot of every value learned so far.
    pub fn query(&self) -> Reply {
        Reply::QueryOk {
            values: self.values.snapshot(),
        }
    }

    /// Replace the neighbor set with this node's entry in `topology`.
    pub fn configure_topology(&self, topology: &Topology) -> Reply {
        let neighbors = topology::neighbors_for(topology, &self.id).unwrap_or_else(|| {
            warn!("Topology has no entry for {}, clearing neighbors", self.id);
            Vec::new()
        });

        self.topology.configure(neighbors);
        let neighbors = self.neighbors();
        info!("Neighbors of {}: {:?}", self.id, neighbors);
        self.events
            .emit(DisseminationEvent::TopologyConfigured { neighbors });

        Reply::ConfigureTopologyOk
    }

    /// Every value learned so far, in arrival order.
    pub fn values(&self) -> Vec<Value> {
        self.values.snapshot()
    }

    /// Current neighbor set.
    pub fn neighbors(&self) -> Vec<NodeId> {
        self.topology.neighbors().to_vec()
    }

    fn classify(&self, src: &NodeId, submit: &Submit) -> Origin {
        if submit.id.is_some() || self.is_cluster_member(src) {
            Origin::Peer(src.clone())
        } else {
            Origin::Client(src.clone())
        }
    }

    fn mint_id(&self) -> BroadcastId {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        BroadcastId::new(self.id.clone(), seq)
    }
}
