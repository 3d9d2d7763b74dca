use std::path::PathBuf;
use std::time::Duration;

use tether_core::ToolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("connection closed by peer")]
    Closed,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("invalid bridge URL: {0}")]
    InvalidUrl(String),
}

/// Transport failures reach tool callers as `BridgeUnavailable`.
impl From<BridgeError> for ToolError {
    fn from(err: BridgeError) -> Self {
        ToolError::BridgeUnavailable(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}
