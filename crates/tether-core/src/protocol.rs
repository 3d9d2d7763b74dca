//! Client-facing envelope: one JSON-RPC 2.0 object per line.
//!
//! Parsing rejects anything that is not a versioned JSON object before any
//! dispatch happens. Messages without an `id` are notifications and never
//! produce a reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ToolError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol revision announced in the `initialize` result.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const UNKNOWN_TOOL: i64 = -32001;
    pub const BRIDGE_UNAVAILABLE: i64 = -32002;
    pub const TOOL_EXECUTION: i64 = -32003;
    pub const RESOURCE_LOCKED: i64 = -32004;
    pub const TIMED_OUT: i64 = -32005;
}

/// A malformed envelope. Fatal to the single exchange only.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Parse(String),

    #[error("invalid request: {reason}")]
    InvalidRequest { id: Option<Value>, reason: String },
}

impl ProtocolError {
    fn invalid(id: Option<Value>, reason: impl Into<String>) -> Self {
        ProtocolError::InvalidRequest {
            id,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            ProtocolError::Parse(_) => codes::PARSE_ERROR,
            ProtocolError::InvalidRequest { .. } => codes::INVALID_REQUEST,
        }
    }

    /// The request id, when it could be recovered from the bad message.
    pub fn id(&self) -> Option<&Value> {
        match self {
            ProtocolError::Parse(_) => None,
            ProtocolError::InvalidRequest { id, .. } => id.as_ref(),
        }
    }

    /// The error response to send back for this failure.
    pub fn to_response(&self) -> Message {
        Message::error(
            self.id().cloned(),
            RpcError::new(self.code(), self.to_string()),
        )
    }
}

impl From<ProtocolError> for ToolError {
    fn from(err: ProtocolError) -> Self {
        ToolError::Protocol(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }
}

impl From<&ToolError> for RpcError {
    fn from(err: &ToolError) -> Self {
        let payload = err.to_payload();
        let mut data = serde_json::Map::new();
        data.insert("kind".into(), Value::String(payload.kind));
        if let Some(detail) = payload.detail {
            data.insert("detail".into(), detail);
        }
        Self {
            code: err.rpc_code(),
            message: err.to_string(),
            data: Some(Value::Object(data)),
        }
    }
}

/// One protocol envelope: a request, a notification, or a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Message {
    fn empty(id: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }

    pub fn request(id: Value, method: impl Into<String>, params: Value) -> Self {
        Self {
            method: Some(method.into()),
            params: Some(params),
            ..Self::empty(Some(id))
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: Some(method.into()),
            params,
            ..Self::empty(None)
        }
    }

    /// A success response. The id is echoed as given, `null` included.
    pub fn result(id: Option<Value>, result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::empty(Some(id.unwrap_or(Value::Null)))
        }
    }

    pub fn error(id: Option<Value>, error: RpcError) -> Self {
        Self {
            error: Some(error),
            ..Self::empty(Some(id.unwrap_or(Value::Null)))
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none() && self.method.is_some()
    }

    pub fn is_response(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }
}

/// Decode one line into a [`Message`].
pub fn parse(line: &str) -> Result<Message, ProtocolError> {
    let value: Value =
        serde_json::from_str(line.trim()).map_err(|e| ProtocolError::Parse(e.to_string()))?;

    let Value::Object(object) = value else {
        return Err(ProtocolError::invalid(None, "message must be a JSON object"));
    };

    let id = object.get("id").filter(|v| !v.is_null()).cloned();

    if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(ProtocolError::invalid(
            id,
            "invalid or missing jsonrpc version",
        ));
    }

    let message: Message = serde_json::from_value(Value::Object(object))
        .map_err(|e| ProtocolError::invalid(id.clone(), e.to_string()))?;

    if message.method.is_none() && !message.is_response() {
        return Err(ProtocolError::invalid(id, "message has no method"));
    }
    if message.result.is_some() && message.error.is_some() {
        return Err(ProtocolError::invalid(
            id,
            "message carries both result and error",
        ));
    }

    Ok(message)
}

/// Encode a message as one compact line, terminator included.
pub fn serialize(message: &Message) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_request_with_id() {
        let msg = parse(r#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#).unwrap();
        assert_eq!(msg.id, Some(json!(7)));
        assert_eq!(msg.method.as_deref(), Some("tools/list"));
        assert!(!msg.is_notification());
    }

    #[test]
    fn null_id_is_a_notification() {
        let msg = parse(r#"{"jsonrpc":"2.0","id":null,"method":"notifications/initialized"}"#)
            .unwrap();
        assert!(msg.is_notification());
    }

    #[test]
    fn rejects_invalid_json_with_parse_code() {
        let err = parse("{not json").unwrap_err();
        assert_eq!(err.code(), codes::PARSE_ERROR);
        assert!(err.id().is_none());
    }

    #[test]
    fn rejects_non_object() {
        let err = parse("[1,2,3]").unwrap_err();
        assert_eq!(err.code(), codes::INVALID_REQUEST);
    }

    #[test]
    fn rejects_missing_version_but_keeps_id() {
        let err = parse(r#"{"id":"abc","method":"ping"}"#).unwrap_err();
        assert_eq!(err.code(), codes::INVALID_REQUEST);
        assert_eq!(err.id(), Some(&json!("abc")));

        let response = err.to_response();
        assert_eq!(response.id, Some(json!("abc")));
        assert_eq!(response.error.unwrap().code, codes::INVALID_REQUEST);
    }

    #[test]
    fn rejects_wrong_version() {
        let err = parse(r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidRequest { .. }));
    }

    #[test]
    fn rejects_message_without_method_or_outcome() {
        let err = parse(r#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert!(err.to_string().contains("no method"));
    }

    #[test]
    fn serialized_null_result_is_kept() {
        let line = serialize(&Message::result(Some(json!(1)), Value::Null)).unwrap();
        assert!(line.ends_with('\n'));
        let value: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "id": 1, "result": null}));
    }

    #[test]
    fn tool_error_maps_to_rpc_error_with_kind() {
        let err = ToolError::ResourceLocked {
            resource: "object:Cube".into(),
            owner: "a".into(),
        };
        let rpc = RpcError::from(&err);
        assert_eq!(rpc.code, codes::RESOURCE_LOCKED);
        let data = rpc.data.unwrap();
        assert_eq!(data["kind"], "resource_locked");
        assert_eq!(data["detail"]["owner"], "a");
    }
}
