//! broadcast-node library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the node components,
//! allowing integration tests to drive the dispatch loop in-process.

pub mod config;
pub mod message;
pub mod server;
pub mod transport;

// Re-export key types for convenience
pub use config::{NodeConfig, RetryConfig};
pub use message::{Envelope, ErrorBody, InitMessage, MAX_MESSAGE_SIZE};
pub use server::{run, NodeServer};
pub use transport::NodeTransport;
