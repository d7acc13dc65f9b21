//! Transport trait for node-to-node delivery.
//!
//! Implementations:
//! - In-memory: direct calls between engines in one process (tests, simulation)
//! - Line-delimited JSON over stdin/stdout (the `broadcast-node` binary)

use crate::node_id::NodeId;
use crate::protocol::Submit;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Node unreachable: {0}")]
    Unreachable(NodeId),

    #[error("No acknowledgement from {dest} after {attempts} attempt(s)")]
    Timeout { dest: NodeId, attempts: u32 },

    #[error("{dest} rejected message (code {code}): {text}")]
    Rejected {
        dest: NodeId,
        code: i64,
        text: String,
    },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Delivery of forwards to other nodes.
///
/// Request/reply correlation and retry-until-acknowledged are the
/// implementation's job: `forward` resolves only once `dest` acknowledged the
/// submit, or fails for good.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identity of the local node.
    fn local_id(&self) -> &NodeId;

    /// Deliver a submit-shaped forward to `dest` and wait for its acknowledgement.
    async fn forward(&self, dest: &NodeId, submit: Submit) -> Result<()>;
}
