//! Envelopes exchanged between bridge clients and servers.
//!
//! Persistent connections open with a [`Hello`] / [`HelloAck`] exchange and
//! then carry [`ClientFrame`] requests answered by [`Reply`] frames. The
//! per-call HTTP variant reuses [`Reply`] as its response body.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tether_core::{ErrorPayload, ToolError};

pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Answered by the bridge itself, never queued for the host.
pub const PING_COMMAND: &str = "ping";

/// Looks up a job's retained result by id, never queued for the host.
pub const RESULT_COMMAND: &str = "job.result";

/// Header carrying the shared token on the per-call variant.
pub const TOKEN_HEADER: &str = "x-tether-token";

/// First frame on a persistent connection.
///
/// Only `token` is interpreted. Everything else the client sends is kept
/// as-is for logging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub client: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub capabilities: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloAck {
    pub ok: bool,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Call {
        tool: String,
        #[serde(default)]
        args: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl Reply {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(err: &ToolError) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(err.to_payload()),
        }
    }

    pub fn from_result(result: Result<Value, ToolError>) -> Self {
        match result {
            Ok(value) => Self::success(value),
            Err(err) => Self::failure(&err),
        }
    }

    pub fn into_result(self) -> Result<Value, ToolError> {
        if self.ok {
            return Ok(self.result.unwrap_or(Value::Null));
        }
        Err(self.error.map(ToolError::from).unwrap_or_else(|| {
            ToolError::Protocol("failure reply without an error body".into())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_frame_is_tagged() {
        let frame = ClientFrame::Call {
            tool: "echo".into(),
            args: json!({"text": "hi"}),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "call", "tool": "echo", "args": {"text": "hi"}})
        );

        let parsed: ClientFrame =
            serde_json::from_value(json!({"type": "call", "tool": "ping"})).unwrap();
        assert_eq!(
            parsed,
            ClientFrame::Call {
                tool: "ping".into(),
                args: Value::Null
            }
        );
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        let parsed = serde_json::from_value::<ClientFrame>(json!({"type": "subscribe"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn failure_reply_restores_typed_error() {
        let reply = Reply::failure(&ToolError::TimedOut {
            job_id: "j-1".into(),
        });
        let wire = serde_json::to_string(&reply).unwrap();
        let back: Reply = serde_json::from_str(&wire).unwrap();
        assert_eq!(
            back.into_result(),
            Err(ToolError::TimedOut {
                job_id: "j-1".into()
            })
        );
    }

    #[test]
    fn hello_accepts_arbitrary_extra_fields() {
        let hello: Hello = serde_json::from_value(json!({
            "token": "secret",
            "client": "tether-proxy",
            "capabilities": ["call"],
            "locale": "en"
        }))
        .unwrap();
        assert_eq!(hello.token.as_deref(), Some("secret"));
        assert_eq!(hello.extra.get("locale"), Some(&json!("en")));
    }

    #[test]
    fn hello_capabilities_may_be_any_json() {
        let hello: Hello = serde_json::from_value(json!({
            "token": "secret",
            "capabilities": {"streaming": true},
            "client": {"name": "blender-addon", "build": 42}
        }))
        .unwrap();
        assert_eq!(hello.token.as_deref(), Some("secret"));
        assert_eq!(hello.capabilities, json!({"streaming": true}));
        assert_eq!(hello.client["build"], json!(42));

        let bare: Hello = serde_json::from_value(json!({})).unwrap();
        assert_eq!(bare, Hello::default());
    }
}
