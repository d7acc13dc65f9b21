//! broadcast-core: Flood-broadcast dissemination engine for a simulated cluster.
//!
//! This crate provides the core functionality for:
//! - Recording every value a node learns about (`ValueStore`)
//! - Holding the local neighbor set (`TopologyStore`)
//! - Fanning values out to neighbors concurrently (`Disseminator`)
//! - The `submit` / `query` / `configure-topology` request handlers (`BroadcastNode`)
//! - The `Transport` trait abstraction and an in-memory network for tests

pub mod config;
pub mod engine;
pub mod events;
pub mod memory;
pub mod node;
pub mod node_id;
pub mod protocol;
pub mod seen;
pub mod store;
pub mod topology;
pub mod transport;
pub mod value;

pub use config::{AckMode, EngineConfig};
pub use engine::{Disseminator, FanoutError, FanoutHandle, FanoutReport, Origin};
pub use events::{DisseminationEvent, EventBus, Subscription};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use node::{BroadcastNode, HandlerError};
pub use node_id::{NodeId, NodeIdError};
pub use protocol::{Reply, Request, Submit, Topology};
pub use seen::{Admission, SeenSet};
pub use store::ValueStore;
pub use topology::TopologyStore;
pub use transport::{Transport, TransportError};
pub use value::{BroadcastId, Value};
