//! Wire types for the three request handlers and their replies.
//!
//! Requests are JSON bodies discriminated by `type`; each reply echoes the
//! request type with an `_ok` suffix. Transport-level fields (`msg_id`,
//! `in_reply_to`) may be present in the same body and are ignored here.
//!
//! Peer-to-peer forwards reuse the `submit` shape. Forwards produced by this
//! engine also carry the broadcast `id`; client submissions normally don't.

use crate::node_id::NodeId;
use crate::value::{BroadcastId, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Full cluster topology: node id → that node's neighbors.
pub type Topology = HashMap<NodeId, Vec<NodeId>>;

/// Payload of a `submit` request, from a client or forwarded by a peer.
///
/// Wire format: `{"type":"submit","value":42}` or
/// `{"type":"submit","value":42,"id":{"origin":"n1","seq":0}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submit {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<BroadcastId>,
}

impl Submit {
    /// A client-style submission with no broadcast identity.
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            id: None,
        }
    }

    /// A forward carrying its broadcast identity.
    pub fn forward(value: Value, id: BroadcastId) -> Self {
        Self {
            value,
            id: Some(id),
        }
    }
}

/// An inbound request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Request {
    Submit(Submit),
    Query,
    ConfigureTopology { topology: Topology },
}

impl Request {
    /// Parse a request from a message body.
    ///
    /// Fails when `type` is unknown or a required field is missing or has the
    /// wrong JSON type (e.g. `submit` with a string `value`).
    pub fn from_body(body: &serde_json::Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(body)
    }

    /// The wire `type` of this request.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Submit(_) => "submit",
            Request::Query => "query",
            Request::ConfigureTopology { .. } => "configure-topology",
        }
    }

    /// Serialize to a JSON body.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("Request serialization should not fail")
    }
}

/// A reply body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Reply {
    #[serde(rename = "submit_ok")]
    SubmitOk,
    #[serde(rename = "query_ok")]
    QueryOk { values: Vec<Value> },
    #[serde(rename = "configure-topology_ok")]
    ConfigureTopologyOk,
}

impl Reply {
    /// Serialize to a JSON body.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("Reply serialization should not fail")
    }

    /// Try to parse a reply from a message body.
    ///
    /// Returns `None` for bodies that aren't one of the three `_ok` replies.
    pub fn from_body(body: &serde_json::Value) -> Option<Self> {
        Self::deserialize(body).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    // ==================== Request parsing ====================

    #[test]
    fn test_parse_client_submit() {
        let body = json!({"type": "submit", "value": 42, "msg_id": 1});
        let req = Request::from_body(&body).unwrap();
        assert_eq!(req, Request::Submit(Submit::new(42i64)));
        assert_eq!(req.kind(), "submit");
    }

    #[test]
    fn test_parse_forwarded_submit() {
        let body = json!({
            "type": "submit",
            "value": 7,
            "id": {"origin": "n1", "seq": 4},
        });
        let Request::Submit(submit) = Request::from_body(&body).unwrap() else {
            panic!("expected submit");
        };
        assert_eq!(submit.id, Some(BroadcastId::new(id("n1"), 4)));
    }

    #[test]
    fn test_submit_requires_numeric_value() {
        assert!(Request::from_body(&json!({"type": "submit"})).is_err());
        assert!(Request::from_body(&json!({"type": "submit", "value": "42"})).is_err());
        assert!(Request::from_body(&json!({"type": "submit", "value": null})).is_err());
    }

    #[test]
    fn test_parse_query_ignores_transport_fields() {
        let body = json!({"type": "query", "msg_id": 9});
        assert_eq!(Request::from_body(&body).unwrap(), Request::Query);
    }

    #[test]
    fn test_parse_configure_topology() {
        let body = json!({"type": "configure-topology", "topology": {"A": ["B"], "B": ["A"]}});
        let Request::ConfigureTopology { topology } = Request::from_body(&body).unwrap() else {
            panic!("expected configure-topology");
        };
        assert_eq!(topology[&id("A")], vec![id("B")]);
        assert_eq!(topology[&id("B")], vec![id("A")]);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(Request::from_body(&json!({"type": "generate"})).is_err());
        assert!(Request::from_body(&json!({"value": 1})).is_err());
    }

    #[test]
    fn test_client_submit_omits_id_on_wire() {
        let body = Request::Submit(Submit::new(5i64)).to_body();
        assert_eq!(body, json!({"type": "submit", "value": 5}));
    }

    // ==================== Reply wire format ====================

    #[test]
    fn test_reply_types() {
        assert_eq!(Reply::SubmitOk.to_body(), json!({"type": "submit_ok"}));
        assert_eq!(
            Reply::ConfigureTopologyOk.to_body(),
            json!({"type": "configure-topology_ok"})
        );

        let query = Reply::QueryOk {
            values: vec![Value::from(1i64), Value::from(1i64)],
        };
        assert_eq!(query.to_body(), json!({"type": "query_ok", "values": [1, 1]}));
    }

    #[test]
    fn test_reply_from_body() {
        let body = json!({"type": "submit_ok", "in_reply_to": 3});
        assert_eq!(Reply::from_body(&body), Some(Reply::SubmitOk));
        assert_eq!(Reply::from_body(&json!({"type": "error", "code": 13})), None);
    }
}
