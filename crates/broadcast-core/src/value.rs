//! Values carried by broadcasts, and the identity that travels with forwards.

use crate::node_id::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// An opaque numeric value submitted by a client or forwarded by a peer.
///
/// Any JSON number is accepted. Equality is raw numeric equality, so the
/// same number submitted twice is two equal `Value`s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Value(serde_json::Number);

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        self.0.as_i64()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.0.as_f64()
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self(n.into())
    }
}

impl From<serde_json::Number> for Value {
    fn from(n: serde_json::Number) -> Self {
        Self(n)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Identity of one broadcast event, distinct from the value it carries.
///
/// Minted by the node that first accepts a client submission as
/// `(its own id, next local sequence number)`. Two client submissions of the
/// same number get different identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastId {
    pub origin: NodeId,
    pub seq: u64,
}

impl BroadcastId {
    pub fn new(origin: NodeId, seq: u64) -> Self {
        Self { origin, seq }
    }
}

impl Display for BroadcastId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.seq)
    }
}
