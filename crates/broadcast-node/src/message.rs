//! Wire envelope and transport-level messages.
//!
//! Every message is one JSON object per line:
//! `{"src":"n1","dest":"n2","body":{"type":"submit","msg_id":3,...}}`.
//! Request/reply correlation lives in the body: requests carry `msg_id`,
//! replies carry `in_reply_to` pointing at it.

use broadcast_core::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Maximum line size (1MB) to prevent memory exhaustion from a misbehaving peer.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// A routed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub src: NodeId,
    pub dest: NodeId,
    pub body: serde_json::Value,
}

impl Envelope {
    pub fn new(src: NodeId, dest: NodeId, body: serde_json::Value) -> Self {
        Self { src, dest, body }
    }

    /// Parse one line of input.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }

    /// Serialize to a single line (without the trailing newline).
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).expect("Envelope serialization should not fail")
    }

    /// The body's `type`, if present.
    pub fn msg_type(&self) -> Option<&str> {
        self.body.get("type").and_then(serde_json::Value::as_str)
    }

    pub fn msg_id(&self) -> Option<u64> {
        self.body.get("msg_id").and_then(serde_json::Value::as_u64)
    }

    pub fn in_reply_to(&self) -> Option<u64> {
        self.body.get("in_reply_to").and_then(serde_json::Value::as_u64)
    }
}

/// Set `msg_id` and, for replies, `in_reply_to` on a body object.
///
/// Non-object bodies are left untouched.
pub fn stamp_body(mut body: serde_json::Value, msg_id: u64, in_reply_to: Option<u64>) -> serde_json::Value {
    if let Some(fields) = body.as_object_mut() {
        fields.insert("msg_id".to_string(), json!(msg_id));
        if let Some(request_id) = in_reply_to {
            fields.insert("in_reply_to".to_string(), json!(request_id));
        }
    }
    body
}

/// Handshake message sent once at startup, telling a node who it is.
///
/// Wire format: `{"type":"init","node_id":"n1","node_ids":["n1","n2"]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitMessage {
    #[serde(rename = "type")]
    msg_type: String,
    pub node_id: NodeId,
    #[serde(default)]
    pub node_ids: Vec<NodeId>,
}

impl InitMessage {
    pub fn new(node_id: NodeId, node_ids: Vec<NodeId>) -> Self {
        Self {
            msg_type: "init".to_string(),
            node_id,
            node_ids,
        }
    }

    pub fn to_body(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("InitMessage serialization should not fail")
    }

    /// Try to parse from a body.
    ///
    /// Returns `None` if the body is malformed or its `type` isn't `"init"`.
    pub fn from_body(body: &serde_json::Value) -> Option<Self> {
        let msg = Self::deserialize(body).ok()?;
        if msg.msg_type == "init" {
            Some(msg)
        } else {
            None
        }
    }

    /// Body of the acknowledgement.
    pub fn ok_body() -> serde_json::Value {
        json!({"type": "init_ok"})
    }
}

/// Error reply: `{"type":"error","code":11,"text":"..."}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    msg_type: String,
    pub code: i64,
    #[serde(default)]
    pub text: String,
}

impl ErrorBody {
    /// Request timed out at the receiver.
    pub const TIMEOUT: i64 = 0;
    /// Receiver is temporarily unable to serve the request.
    pub const TEMPORARILY_UNAVAILABLE: i64 = 11;

    pub fn new(code: i64, text: impl Into<String>) -> Self {
        Self {
            msg_type: "error".to_string(),
            code,
            text: text.into(),
        }
    }

    pub fn to_body(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("ErrorBody serialization should not fail")
    }

    /// Returns `None` unless the body is an `error` reply.
    pub fn from_body(body: &serde_json::Value) -> Option<Self> {
        let msg = Self::deserialize(body).ok()?;
        if msg.msg_type == "error" {
            Some(msg)
        } else {
            None
        }
    }

    /// Whether sending the same request again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.code, Self::TIMEOUT | Self::TEMPORARILY_UNAVAILABLE)
    }
}
