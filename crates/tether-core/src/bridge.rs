use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::error::ToolError;

/// Transport to the host process.
///
/// Forwarded tools hand their validated arguments to a `Bridge`, which
/// delivers them to the host's job queue and returns the host's result.
/// Uses Pin<Box<dyn Future>> so implementations can live behind `Arc<dyn Bridge>`.
pub trait Bridge: Send + Sync {
    /// Short transport name for logging.
    fn name(&self) -> &str;

    fn call<'a>(
        &'a self,
        command: &'a str,
        args: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>>;
}

/// A bridge with nothing on the other end. Every call fails as unavailable.
pub struct DetachedBridge;

impl Bridge for DetachedBridge {
    fn name(&self) -> &str {
        "detached"
    }

    fn call<'a>(
        &'a self,
        command: &'a str,
        _args: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>> {
        Box::pin(async move {
            Err(ToolError::BridgeUnavailable(format!(
                "no host attached for '{command}'"
            )))
        })
    }
}
