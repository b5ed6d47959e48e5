//! Classifies JSON-RPC 2.0 messages as request / response / notification.
//!
//! Grounded on `crates/codex/src/mcp/jsonrpc.rs::decode_message`'s `Incoming`
//! enum, generalized to a three-way split (a single upstream client only
//! ever sees responses and notifications, never requests from its server)
//! and to accept either string or integer IDs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC 2.0 identifier: string or integer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageId::Number(n) => write!(f, "{n}"),
            MessageId::String(s) => write!(f, "{s}"),
        }
    }
}

/// Borrowed classification of a raw decoded JSON value, without consuming
/// it — used by `Router`/`UpstreamServer` to decide where to route a frame
/// before deserializing the full payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Notification,
}

/// Classify a decoded JSON-RPC value by the presence of `id`/`method`.
pub fn classify(value: &Value) -> Option<MessageKind> {
    let has_id = value.get("id").is_some();
    let has_method = value.get("method").is_some();
    match (has_id, has_method) {
        (true, true) => Some(MessageKind::Request),
        (true, false) => Some(MessageKind::Response),
        (false, true) => Some(MessageKind::Notification),
        (false, false) => None,
    }
}

pub fn request(id: MessageId, method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
        "params": params,
    })
}

pub fn notification(method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params,
    })
}

pub fn success(id: MessageId, result: Value) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

pub fn error_response(id: Option<MessageId>, code: i64, message: &str, data: Option<Value>) -> Value {
    let mut error = serde_json::json!({
        "code": code,
        "message": message,
    });
    if let Some(data) = data {
        error["data"] = data;
    }
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": error,
    })
}
