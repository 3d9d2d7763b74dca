//! A small in-memory host for exercising the bridge end to end.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Value, json};

use crate::host::{Host, HostFailure};

/// Longest `sleep` the demo host accepts.
pub const MAX_SLEEP_MS: u64 = 60_000;

#[derive(Debug, Default)]
pub struct MemoryHost {
    store: HashMap<String, Value>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, HostFailure> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| HostFailure::new(format!("missing string argument '{key}'")))
}

impl Host for MemoryHost {
    fn execute(&mut self, command: &str, args: &Value) -> Result<Value, HostFailure> {
        match command {
            "echo" => Ok(args.clone()),
            "sleep" => {
                let ms = args
                    .get("ms")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| HostFailure::new("missing integer argument 'ms'"))?
                    .min(MAX_SLEEP_MS);
                std::thread::sleep(Duration::from_millis(ms));
                Ok(json!({ "slept_ms": ms }))
            }
            "store.set" => {
                let key = str_arg(args, "key")?;
                let value = args.get("value").cloned().unwrap_or(Value::Null);
                let previous = self.store.insert(key.to_string(), value);
                Ok(json!({ "key": key, "previous": previous }))
            }
            "store.get" => {
                let key = str_arg(args, "key")?;
                Ok(json!({ "key": key, "value": self.store.get(key) }))
            }
            other => Err(HostFailure::new(format!("unknown host command '{other}'"))
                .with_detail(json!({ "command": other }))),
        }
    }
}
