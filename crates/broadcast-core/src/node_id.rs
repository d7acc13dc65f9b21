//! NodeId: Identity of a node (or client) in the simulated cluster.
//!
//! Identities are opaque labels assigned externally at startup, e.g. `"n1"`
//! for nodes and `"c1"` for clients. The only structural rule is that a
//! label is never empty.

use std::borrow::Borrow;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeIdError {
    #[error("Node ID cannot be empty")]
    Empty,
}

/// An opaque, non-empty node identity.
///
/// # Examples
/// ```
/// use broadcast_core::NodeId;
///
/// let id: NodeId = "n1".parse().unwrap();
/// assert_eq!(id.as_str(), "n1");
/// assert!("".parse::<NodeId>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node ID, rejecting empty labels.
    pub fn new(id: impl Into<String>) -> Result<Self, NodeIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(NodeIdError::Empty);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Serialize as a bare string so topology maps stay `{"n1": ["n2"]}` on the wire
impl serde::Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}
