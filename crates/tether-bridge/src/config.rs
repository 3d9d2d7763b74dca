use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tether_core::Access;

use crate::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::error::ConfigError;
use crate::queue::DEFAULT_RESULTS_CAPACITY;

pub const CONFIG_FILE: &str = "tether.toml";

/// Overrides `bridge.token` when set.
pub const TOKEN_ENV: &str = "TETHER_BRIDGE_TOKEN";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub host: HostConfig,
    /// Extra host-forwarded tools appended to the built-in catalog.
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Framed,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub transport: Transport,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Client-side wait for one reply. Longer than the host-side mutation
    /// wait, so the host's `TimedOut` (with its job id) arrives first.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    pub token: Option<String>,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8765
}
fn default_timeout_ms() -> u64 {
    70_000
}
fn default_retries() -> u32 {
    1
}
fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}
fn default_handshake_timeout_ms() -> u64 {
    2_000
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            host: default_host(),
            port: default_port(),
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
            token: None,
            max_frame_bytes: default_max_frame_bytes(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl BridgeConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_max_per_tick")]
    pub max_per_tick: usize,
    #[serde(default = "default_exec_timeout_ms")]
    pub exec_timeout_ms: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_mutation_timeout_ms")]
    pub mutation_timeout_ms: u64,
    #[serde(default = "default_results_capacity")]
    pub results_capacity: usize,
}

fn default_tick_ms() -> u64 {
    50
}
fn default_max_per_tick() -> usize {
    8
}
fn default_exec_timeout_ms() -> u64 {
    30_000
}
fn default_query_timeout_ms() -> u64 {
    10_000
}
fn default_mutation_timeout_ms() -> u64 {
    60_000
}
fn default_results_capacity() -> usize {
    DEFAULT_RESULTS_CAPACITY
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            max_per_tick: default_max_per_tick(),
            exec_timeout_ms: default_exec_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            mutation_timeout_ms: default_mutation_timeout_ms(),
            results_capacity: default_results_capacity(),
        }
    }
}

impl HostConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn mutation_timeout(&self) -> Duration {
        Duration::from_millis(self.mutation_timeout_ms)
    }
}

/// A host command exposed as a tool.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_input_schema")]
    pub input_schema: Value,
    #[serde(default)]
    pub access: Access,
    /// Host command name, when it differs from the tool name.
    pub command: Option<String>,
}

fn default_input_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

impl ToolSpec {
    pub fn command(&self) -> &str {
        self.command.as_deref().unwrap_or(&self.name)
    }
}

impl TetherConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load from `explicit`, else `./tether.toml`, else the user config dir,
    /// else defaults. Then apply environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match Self::locate(explicit)? {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading config");
                Self::from_file(&path)?
            }
            None => {
                tracing::debug!("No config file found, using defaults");
                Self::default()
            }
        };
        config.override_token(std::env::var(TOKEN_ENV).ok());
        Ok(config)
    }

    fn locate(explicit: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
        if let Some(path) = explicit {
            return if path.is_file() {
                Ok(Some(path.to_path_buf()))
            } else {
                Err(ConfigError::NotFound(path.to_path_buf()))
            };
        }

        let candidates = [
            Some(PathBuf::from(CONFIG_FILE)),
            dirs::config_dir().map(|dir| dir.join("tether").join(CONFIG_FILE)),
        ];
        Ok(candidates.into_iter().flatten().find(|p| p.is_file()))
    }

    /// A non-empty `token` replaces the configured one.
    pub fn override_token(&mut self, token: Option<String>) {
        if let Some(token) = token
            && !token.is_empty()
        {
            self.bridge.token = Some(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let config: TetherConfig = toml::from_str("").unwrap();
        assert_eq!(config.bridge.transport, Transport::Framed);
        assert_eq!(config.bridge.addr(), "127.0.0.1:8765");
        assert_eq!(config.bridge.timeout(), Duration::from_secs(70));
        assert_eq!(config.host.tick(), Duration::from_millis(50));
        assert_eq!(config.host.max_per_tick, 8);
        assert_eq!(config.host.results_capacity, 1024);
        assert!(config.tools.is_empty());
    }

    #[test]
    fn default_matches_empty_file() {
        let parsed: TetherConfig = toml::from_str("").unwrap();
        let built = TetherConfig::default();
        assert_eq!(parsed.bridge.port, built.bridge.port);
        assert_eq!(parsed.bridge.max_frame_bytes, built.bridge.max_frame_bytes);
        assert_eq!(parsed.host.exec_timeout_ms, built.host.exec_timeout_ms);
    }

    #[test]
    fn parses_full_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[bridge]
transport = "http"
port = 9100
token = "secret"
retries = 3

[host]
tick_ms = 20
query_timeout_ms = 500

[[tools]]
name = "scene.info"
description = "Describe the scene"
access = "query"
command = "get_scene_info"

[tools.input_schema]
type = "object"
additionalProperties = false

[[tools]]
name = "object.delete"
"#
        )
        .unwrap();

        let config = TetherConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.bridge.transport, Transport::Http);
        assert_eq!(config.bridge.base_url(), "http://127.0.0.1:9100");
        assert_eq!(config.bridge.retries, 3);
        assert_eq!(config.host.tick_ms, 20);
        assert_eq!(config.host.query_timeout(), Duration::from_millis(500));
        assert_eq!(config.host.mutation_timeout_ms, 60_000);

        assert_eq!(config.tools.len(), 2);
        let info = &config.tools[0];
        assert_eq!(info.access, Access::Query);
        assert_eq!(info.command(), "get_scene_info");
        assert_eq!(info.input_schema["additionalProperties"], Value::Bool(false));

        let delete = &config.tools[1];
        assert_eq!(delete.access, Access::Mutation);
        assert_eq!(delete.command(), "object.delete");
        assert_eq!(delete.input_schema["type"], "object");
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            TetherConfig::load(Some(&missing)),
            Err(ConfigError::NotFound(p)) if p == missing
        ));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[bridge]\nport = \"not a number\"\n").unwrap();
        assert!(matches!(
            TetherConfig::from_file(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn token_override() {
        let mut config = TetherConfig::default();
        config.override_token(Some(String::new()));
        assert!(config.bridge.token.is_none());
        config.override_token(Some("from-env".into()));
        assert_eq!(config.bridge.token.as_deref(), Some("from-env"));
        config.override_token(None);
        assert_eq!(config.bridge.token.as_deref(), Some("from-env"));
    }
}
