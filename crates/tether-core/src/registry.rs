use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::bridge::Bridge;
use crate::error::ToolError;
use crate::schema::{InputSchema, SchemaError};

static TOOL_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]*(\.[a-z][a-z0-9_]*)*$").expect("tool name pattern compiles")
});

/// Startup-time registration failure. The catalog is static, so any of
/// these means the process should refuse to start.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid tool name '{0}' (expected dotted lower_snake_case)")]
    InvalidName(String),

    #[error("tool '{0}' is already registered")]
    Duplicate(String),

    #[error("invalid input schema for '{name}': {source}")]
    InvalidSchema {
        name: String,
        #[source]
        source: SchemaError,
    },
}

/// Whether a tool only reads host state or may change it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Query,
    #[default]
    Mutation,
}

/// Public description of a tool, as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(skip)]
    pub access: Access,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            access: Access::Mutation,
        }
    }

    pub fn query(mut self) -> Self {
        self.access = Access::Query;
        self
    }
}

pub type LocalFn = dyn Fn(&Map<String, Value>) -> Result<Value, ToolError> + Send + Sync;

/// What runs when a validated call is dispatched.
#[derive(Clone)]
pub enum ToolHandler {
    /// Sent across the bridge as host command `command`.
    Forward { command: String },
    /// Answered in-process without touching the host.
    Local(Arc<LocalFn>),
}

impl ToolHandler {
    pub fn forward(command: impl Into<String>) -> Self {
        ToolHandler::Forward {
            command: command.into(),
        }
    }

    pub fn local<F>(f: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        ToolHandler::Local(Arc::new(f))
    }
}

impl fmt::Debug for ToolHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolHandler::Forward { command } => {
                f.debug_struct("Forward").field("command", command).finish()
            }
            ToolHandler::Local(_) => f.write_str("Local(..)"),
        }
    }
}

struct Entry {
    definition: ToolDefinition,
    schema: InputSchema,
    handler: ToolHandler,
}

/// Name-keyed catalog of tools with compiled argument schemas.
///
/// Built once at startup and read-only afterwards.
#[derive(Default)]
pub struct ToolRegistry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        definition: ToolDefinition,
        handler: ToolHandler,
    ) -> Result<(), RegistryError> {
        if !TOOL_NAME.is_match(&definition.name) {
            return Err(RegistryError::InvalidName(definition.name));
        }
        if self.index.contains_key(&definition.name) {
            return Err(RegistryError::Duplicate(definition.name));
        }
        let schema = InputSchema::compile(&definition.input_schema).map_err(|source| {
            RegistryError::InvalidSchema {
                name: definition.name.clone(),
                source,
            }
        })?;

        tracing::debug!(tool = %definition.name, handler = ?handler, "Registered tool");

        self.index
            .insert(definition.name.clone(), self.entries.len());
        self.entries.push(Entry {
            definition,
            schema,
            handler,
        });
        Ok(())
    }

    /// All tools in registration order.
    pub fn list(&self) -> Vec<&ToolDefinition> {
        self.entries.iter().map(|e| &e.definition).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.entry(name).map(|e| &e.definition)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Host commands reached by forwarded tools, with their access class.
    pub fn forwarded_commands(&self) -> impl Iterator<Item = (&str, Access)> + '_ {
        self.entries.iter().filter_map(|e| match &e.handler {
            ToolHandler::Forward { command } => Some((command.as_str(), e.definition.access)),
            ToolHandler::Local(_) => None,
        })
    }

    fn entry(&self, name: &str) -> Option<&Entry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    /// Check `args` against the tool's schema without side effects.
    ///
    /// A `null` argument bag is treated as `{}`. Returns the normalized
    /// argument object on success.
    pub fn validate(&self, name: &str, args: &Value) -> Result<Map<String, Value>, ToolError> {
        let entry = self
            .entry(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        let args = match args {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            _ => {
                return Err(ToolError::SchemaValidation {
                    tool: name.to_string(),
                    message: "arguments must be an object".into(),
                });
            }
        };

        entry
            .schema
            .validate(&args)
            .map_err(|message| ToolError::SchemaValidation {
                tool: name.to_string(),
                message,
            })?;

        Ok(args)
    }

    /// Run the handler for an already-validated call.
    ///
    /// Failures of any kind, panics in local handlers included, come back as
    /// a typed [`ToolError`].
    pub async fn dispatch(
        &self,
        name: &str,
        args: Map<String, Value>,
        bridge: &dyn Bridge,
    ) -> Result<Value, ToolError> {
        let entry = self
            .entry(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        match &entry.handler {
            ToolHandler::Forward { command } => {
                tracing::debug!(tool = %name, command = %command, bridge = bridge.name(), "Forwarding call");
                bridge.call(command, &Value::Object(args)).await
            }
            ToolHandler::Local(handler) => {
                match panic::catch_unwind(AssertUnwindSafe(|| (**handler)(&args))) {
                    Ok(result) => result,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        tracing::error!(tool = %name, error = %message, "Local handler panicked");
                        Err(ToolError::execution(format!("handler panicked: {message}")))
                    }
                }
            }
        }
    }

    /// Validate and then dispatch.
    pub async fn call(
        &self,
        name: &str,
        args: &Value,
        bridge: &dyn Bridge,
    ) -> Result<Value, ToolError> {
        let args = self.validate(name, args)?;
        self.dispatch(name, args, bridge).await
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
