//! The static tool catalog: bridge-level tools, session and lock tools that
//! never leave this process, the demo host's commands, and any extra host
//! commands listed in the config.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tether_bridge::TetherConfig;
use tether_core::registry::RegistryError;
use tether_core::{LockManager, SessionManager, ToolDefinition, ToolError, ToolHandler, ToolRegistry};

const DEFAULT_LOCK_TTL_SECS: u64 = 30;
const MAX_LOCK_TTL_SECS: u64 = 24 * 60 * 60;

fn str_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::Internal(format!("validated argument '{key}' missing")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|e| ToolError::Internal(e.to_string()))
}

fn object(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}

pub fn build_registry(
    config: &TetherConfig,
    sessions: Arc<SessionManager>,
    locks: Arc<LockManager>,
) -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();

    register_bridge_tools(&mut registry)?;
    register_session_tools(&mut registry, sessions)?;
    register_lock_tools(&mut registry, locks)?;
    register_demo_tools(&mut registry)?;

    for spec in &config.tools {
        let mut definition =
            ToolDefinition::new(&spec.name, &spec.description, spec.input_schema.clone());
        definition.access = spec.access;
        registry.register(definition, ToolHandler::forward(spec.command()))?;
    }

    tracing::debug!(tools = registry.len(), "Catalog built");
    Ok(registry)
}

fn register_bridge_tools(registry: &mut ToolRegistry) -> Result<(), RegistryError> {
    registry.register(
        ToolDefinition::new(
            "ping",
            "Check that the bridge is reachable and report host health. Succeeds even while the host is busy.",
            object(json!({}), &[]),
        )
        .query(),
        ToolHandler::forward("ping"),
    )?;

    registry.register(
        ToolDefinition::new(
            "job.result",
            "Look up the result of a host job by id, e.g. one whose call timed out.",
            object(json!({"job_id": {"type": "string"}}), &["job_id"]),
        )
        .query(),
        ToolHandler::forward("job.result"),
    )?;
    Ok(())
}

fn register_session_tools(
    registry: &mut ToolRegistry,
    sessions: Arc<SessionManager>,
) -> Result<(), RegistryError> {
    let s = Arc::clone(&sessions);
    registry.register(
        ToolDefinition::new(
            "session.create",
            "Open a session. Its id is the identity used for resource locks.",
            object(
                json!({"name": {"type": "string"}, "metadata": {"type": "object"}}),
                &["name"],
            ),
        ),
        ToolHandler::local(move |args| {
            let name = str_arg(args, "name")?;
            let metadata = args
                .get("metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            to_json(&s.create(name, metadata))
        }),
    )?;

    let s = Arc::clone(&sessions);
    registry.register(
        ToolDefinition::new("session.list", "List open sessions.", object(json!({}), &[])).query(),
        ToolHandler::local(move |_| Ok(json!({ "sessions": to_json(&s.list())? }))),
    )?;

    let s = Arc::clone(&sessions);
    registry.register(
        ToolDefinition::new(
            "session.get",
            "Describe one session.",
            object(json!({"session_id": {"type": "string"}}), &["session_id"]),
        )
        .query(),
        ToolHandler::local(move |args| {
            let session_id = str_arg(args, "session_id")?;
            match s.get(session_id) {
                Some(session) => to_json(&session),
                None => Err(ToolError::ToolExecution {
                    message: format!("unknown session '{session_id}'"),
                    detail: Some(json!({ "session_id": session_id })),
                }),
            }
        }),
    )?;

    let s = sessions;
    registry.register(
        ToolDefinition::new(
            "session.close",
            "Close a session. Locks it holds stay until released or expired.",
            object(json!({"session_id": {"type": "string"}}), &["session_id"]),
        ),
        ToolHandler::local(move |args| {
            let session_id = str_arg(args, "session_id")?;
            Ok(json!({ "closed": s.close(session_id) }))
        }),
    )?;
    Ok(())
}

fn register_lock_tools(
    registry: &mut ToolRegistry,
    locks: Arc<LockManager>,
) -> Result<(), RegistryError> {
    let l = Arc::clone(&locks);
    registry.register(
        ToolDefinition::new(
            "lock.acquire",
            "Take or renew a lease on a named resource for a session.",
            object(
                json!({
                    "resource": {"type": "string"},
                    "session_id": {"type": "string"},
                    "ttl_secs": {"type": "integer", "minimum": 1, "maximum": MAX_LOCK_TTL_SECS}
                }),
                &["resource", "session_id"],
            ),
        ),
        ToolHandler::local(move |args| {
            let resource = str_arg(args, "resource")?;
            let session_id = str_arg(args, "session_id")?;
            let ttl = args
                .get("ttl_secs")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_LOCK_TTL_SECS);
            to_json(&l.acquire(resource, session_id, Duration::from_secs(ttl))?)
        }),
    )?;

    let l = Arc::clone(&locks);
    registry.register(
        ToolDefinition::new(
            "lock.release",
            "Release a lease held by the session.",
            object(
                json!({"resource": {"type": "string"}, "session_id": {"type": "string"}}),
                &["resource", "session_id"],
            ),
        ),
        ToolHandler::local(move |args| {
            let resource = str_arg(args, "resource")?;
            let session_id = str_arg(args, "session_id")?;
            Ok(json!({ "released": l.release(resource, session_id)? }))
        }),
    )?;

    let l = locks;
    registry.register(
        ToolDefinition::new(
            "lock.get",
            "Show the live lease on a resource, if any.",
            object(json!({"resource": {"type": "string"}}), &["resource"]),
        )
        .query(),
        ToolHandler::local(move |args| {
            let resource = str_arg(args, "resource")?;
            Ok(json!({ "lock": to_json(&l.get(resource))? }))
        }),
    )?;
    Ok(())
}

/// Commands understood by the demo host (`tether host`).
fn register_demo_tools(registry: &mut ToolRegistry) -> Result<(), RegistryError> {
    registry.register(
        ToolDefinition::new(
            "echo",
            "Return the given text unchanged.",
            object(json!({"text": {"type": "string"}}), &["text"]),
        )
        .query(),
        ToolHandler::forward("echo"),
    )?;
    registry.register(
        ToolDefinition::new(
            "sleep",
            "Block the host thread for a number of milliseconds.",
            object(
                json!({"ms": {"type": "integer", "minimum": 0, "maximum": 60000}}),
                &["ms"],
            ),
        ),
        ToolHandler::forward("sleep"),
    )?;
    registry.register(
        ToolDefinition::new(
            "store.set",
            "Store a value under a key in host memory.",
            object(json!({"key": {"type": "string"}, "value": {}}), &["key", "value"]),
        ),
        ToolHandler::forward("store.set"),
    )?;
    registry.register(
        ToolDefinition::new(
            "store.get",
            "Read a value stored in host memory.",
            object(json!({"key": {"type": "string"}}), &["key"]),
        )
        .query(),
        ToolHandler::forward("store.get"),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_bridge::ToolSpec;
    use tether_core::{Access, DetachedBridge};

    fn registry() -> ToolRegistry {
        build_registry(
            &TetherConfig::default(),
            Arc::new(SessionManager::new()),
            Arc::new(LockManager::new()),
        )
        .unwrap()
    }

    #[test]
    fn catalog_names_are_unique_and_ordered() {
        let names: Vec<_> = registry().list().iter().map(|d| d.name.clone()).collect();
        assert_eq!(names[..2], ["ping", "job.result"]);
        assert!(names.contains(&"lock.acquire".to_string()));
        assert!(names.contains(&"store.get".to_string()));
    }

    #[test]
    fn forwarded_queries_are_marked() {
        let registry = registry();
        let forwarded: Vec<_> = registry.forwarded_commands().collect();
        assert!(forwarded.contains(&("echo", Access::Query)));
        assert!(forwarded.contains(&("sleep", Access::Mutation)));
        assert!(!forwarded.iter().any(|(c, _)| c.starts_with("lock.")));
    }

    #[tokio::test]
    async fn lock_tools_enforce_ownership() {
        let registry = registry();
        let bridge = DetachedBridge;

        let a = registry
            .call("session.create", &json!({"name": "a"}), &bridge)
            .await
            .unwrap();
        let a = a["id"].as_str().unwrap().to_string();

        let held = registry
            .call("lock.acquire", &json!({"resource": "object:Cube", "session_id": a}), &bridge)
            .await
            .unwrap();
        assert_eq!(held["owner"], json!(a));

        let err = registry
            .call("lock.acquire", &json!({"resource": "object:Cube", "session_id": "b"}), &bridge)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ToolError::ResourceLocked {
                resource: "object:Cube".into(),
                owner: a.clone()
            }
        );

        let released = registry
            .call("lock.release", &json!({"resource": "object:Cube", "session_id": a}), &bridge)
            .await
            .unwrap();
        assert_eq!(released, json!({"released": true}));

        let lock = registry
            .call("lock.get", &json!({"resource": "object:Cube"}), &bridge)
            .await
            .unwrap();
        assert_eq!(lock, json!({"lock": null}));
    }

    #[tokio::test]
    async fn ttl_bounds_are_validated() {
        let registry = registry();
        let err = registry
            .call(
                "lock.acquire",
                &json!({"resource": "r", "session_id": "s", "ttl_secs": 0}),
                &DetachedBridge,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::SchemaValidation { .. }));
    }

    #[tokio::test]
    async fn unknown_session_is_an_execution_error() {
        let err = registry()
            .call("session.get", &json!({"session_id": "missing"}), &DetachedBridge)
            .await
            .unwrap_err();
        assert_eq!(err.detail(), Some(json!({"session_id": "missing"})));
    }

    fn config_with(spec: ToolSpec) -> TetherConfig {
        TetherConfig {
            tools: vec![spec],
            ..TetherConfig::default()
        }
    }

    #[test]
    fn config_tools_are_forwarded() {
        let config = config_with(ToolSpec {
            name: "scene.info".into(),
            description: "Describe the scene".into(),
            input_schema: json!({"type": "object"}),
            access: Access::Query,
            command: Some("get_scene_info".into()),
        });
        let registry = build_registry(
            &config,
            Arc::new(SessionManager::new()),
            Arc::new(LockManager::new()),
        )
        .unwrap();
        assert!(registry.get("scene.info").is_some());
        assert!(
            registry
                .forwarded_commands()
                .any(|c| c == ("get_scene_info", Access::Query))
        );
    }

    #[test]
    fn config_tool_clashing_with_builtin_is_rejected() {
        let config = config_with(ToolSpec {
            name: "ping".into(),
            description: String::new(),
            input_schema: json!({}),
            access: Access::Mutation,
            command: None,
        });
        let result = build_registry(
            &config,
            Arc::new(SessionManager::new()),
            Arc::new(LockManager::new()),
        );
        assert!(matches!(result, Err(RegistryError::Duplicate(_))));
    }
}
