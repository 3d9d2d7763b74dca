use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::protocol::codes;

/// Every failure a tool call can surface to a caller.
///
/// `UnknownTool` and `SchemaValidation` are raised before dispatch and never
/// touch the host. `TimedOut` means the caller stopped waiting; the job may
/// still complete and its result stays retrievable by `job_id`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid arguments for '{tool}': {message}")]
    SchemaValidation { tool: String, message: String },

    #[error("bridge unavailable: {0}")]
    BridgeUnavailable(String),

    #[error("tool execution failed: {message}")]
    ToolExecution {
        message: String,
        detail: Option<Value>,
    },

    #[error("resource '{resource}' is locked by '{owner}'")]
    ResourceLocked { resource: String, owner: String },

    #[error("timed out waiting for job {job_id}")]
    TimedOut { job_id: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ToolError {
    pub fn execution(message: impl Into<String>) -> Self {
        ToolError::ToolExecution {
            message: message.into(),
            detail: None,
        }
    }

    /// Stable snake_case identifier, used on the wire and in RPC error data.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::Protocol(_) => "protocol_error",
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::SchemaValidation { .. } => "schema_validation_error",
            ToolError::BridgeUnavailable(_) => "bridge_unavailable",
            ToolError::ToolExecution { .. } => "tool_execution_error",
            ToolError::ResourceLocked { .. } => "resource_locked",
            ToolError::TimedOut { .. } => "timed_out",
            ToolError::Internal(_) => "internal_error",
        }
    }

    /// JSON-RPC error code reported to the client.
    pub fn rpc_code(&self) -> i64 {
        match self {
            ToolError::Protocol(_) => codes::INVALID_REQUEST,
            ToolError::UnknownTool(_) => codes::UNKNOWN_TOOL,
            ToolError::SchemaValidation { .. } => codes::INVALID_PARAMS,
            ToolError::BridgeUnavailable(_) => codes::BRIDGE_UNAVAILABLE,
            ToolError::ToolExecution { .. } => codes::TOOL_EXECUTION,
            ToolError::ResourceLocked { .. } => codes::RESOURCE_LOCKED,
            ToolError::TimedOut { .. } => codes::TIMED_OUT,
            ToolError::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Whether retrying the same call later may succeed without changing input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ToolError::BridgeUnavailable(_)
                | ToolError::ResourceLocked { .. }
                | ToolError::TimedOut { .. }
        )
    }

    /// Structured context that accompanies the message.
    pub fn detail(&self) -> Option<Value> {
        match self {
            ToolError::UnknownTool(tool) => Some(json!({ "tool": tool })),
            ToolError::SchemaValidation { tool, .. } => Some(json!({ "tool": tool })),
            ToolError::ToolExecution { detail, .. } => detail.clone(),
            ToolError::ResourceLocked { resource, owner } => {
                Some(json!({ "resource": resource, "owner": owner }))
            }
            ToolError::TimedOut { job_id } => Some(json!({ "job_id": job_id })),
            _ => None,
        }
    }

    fn bare_message(&self) -> String {
        match self {
            ToolError::Protocol(m)
            | ToolError::BridgeUnavailable(m)
            | ToolError::Internal(m) => m.clone(),
            ToolError::SchemaValidation { message, .. } | ToolError::ToolExecution { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind().to_string(),
            message: self.bare_message(),
            detail: self.detail(),
        }
    }
}

/// Serializable form of a [`ToolError`], carried across the bridge wire so
/// typed failures survive the hop between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl ErrorPayload {
    fn detail_str(&self, key: &str) -> Option<String> {
        self.detail
            .as_ref()
            .and_then(|d| d.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

impl From<ErrorPayload> for ToolError {
    fn from(payload: ErrorPayload) -> Self {
        match payload.kind.as_str() {
            "protocol_error" => ToolError::Protocol(payload.message),
            "unknown_tool" => {
                ToolError::UnknownTool(payload.detail_str("tool").unwrap_or(payload.message))
            }
            "schema_validation_error" => ToolError::SchemaValidation {
                tool: payload.detail_str("tool").unwrap_or_default(),
                message: payload.message,
            },
            "bridge_unavailable" => ToolError::BridgeUnavailable(payload.message),
            "resource_locked" => ToolError::ResourceLocked {
                resource: payload.detail_str("resource").unwrap_or_default(),
                owner: payload.detail_str("owner").unwrap_or_default(),
            },
            "timed_out" => ToolError::TimedOut {
                job_id: payload.detail_str("job_id").unwrap_or_default(),
            },
            "tool_execution_error" => ToolError::ToolExecution {
                message: payload.message,
                detail: payload.detail,
            },
            _ => ToolError::Internal(payload.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_preserves_typed_variants() {
        let errors = vec![
            ToolError::UnknownTool("nope".into()),
            ToolError::SchemaValidation {
                tool: "echo".into(),
                message: "missing required param: text".into(),
            },
            ToolError::ResourceLocked {
                resource: "object:Cube".into(),
                owner: "session-a".into(),
            },
            ToolError::TimedOut {
                job_id: "job-1".into(),
            },
            ToolError::ToolExecution {
                message: "boom".into(),
                detail: Some(json!({"trace": "line 3"})),
            },
            ToolError::BridgeUnavailable("connection refused".into()),
        ];

        for err in errors {
            let wire = serde_json::to_string(&err.to_payload()).unwrap();
            let back: ErrorPayload = serde_json::from_str(&wire).unwrap();
            assert_eq!(ToolError::from(back), err);
        }
    }

    #[test]
    fn unrecognized_kind_becomes_internal() {
        let payload = ErrorPayload {
            kind: "mystery".into(),
            message: "something odd".into(),
            detail: None,
        };
        assert_eq!(
            ToolError::from(payload),
            ToolError::Internal("something odd".into())
        );
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(ToolError::BridgeUnavailable("down".into()).is_retryable());
        assert!(!ToolError::UnknownTool("x".into()).is_retryable());
        assert!(!ToolError::execution("bad").is_retryable());
    }
}
