use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use serde_json::{Value, json};
use tether_bridge::codec::{DEFAULT_MAX_FRAME_BYTES, FrameCodec};
use tether_bridge::error::BridgeError;
use tether_core::protocol::{self, Message, PROTOCOL_VERSION, ProtocolError, RpcError};
use tether_core::{Bridge, SessionManager, ToolRegistry};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
    /// Touches the session's `last_seen` when known.
    #[serde(default)]
    session_id: Option<String>,
}

/// Client-facing protocol engine: answers `initialize`, `ping`,
/// `tools/list` and `tools/call` over one line-delimited stream.
pub struct ToolServer {
    registry: ToolRegistry,
    sessions: Arc<SessionManager>,
    bridge: Arc<dyn Bridge>,
}

impl ToolServer {
    pub fn new(
        registry: ToolRegistry,
        sessions: Arc<SessionManager>,
        bridge: Arc<dyn Bridge>,
    ) -> Self {
        Self {
            registry,
            sessions,
            bridge,
        }
    }

    pub async fn handle_message(&self, message: Message) -> Option<Message> {
        let Some(method) = message.method.as_deref() else {
            tracing::debug!(id = ?message.id, "Ignoring response sent by client");
            return None;
        };

        let Some(id) = message.id.clone() else {
            self.handle_notification(method);
            return None;
        };

        let params = message.params.clone().unwrap_or(Value::Null);
        Some(match self.handle_request(method, params).await {
            Ok(result) => Message::result(Some(id), result),
            Err(error) => Message::error(Some(id), error),
        })
    }

    // Unknown notifications are dropped so they can never produce output.
    fn handle_notification(&self, method: &str) {
        match method {
            "notifications/initialized" => tracing::info!("Client initialized"),
            other => tracing::debug!(method = %other, "Ignoring notification"),
        }
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_result()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": self.registry.list() })),
            "tools/call" => self.call_tool(params).await,
            other => Err(RpcError::method_not_found(other)),
        }
    }

    fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {
                "name": "tether",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "tools": { "listChanged": false }
            },
            "instructions": format!(
                "Tools reach a single-threaded host through the '{}' bridge. \
                 A timed-out call keeps running; fetch its result with job.result.",
                self.bridge.name()
            ),
        })
    }

    async fn call_tool(&self, params: Value) -> Result<Value, RpcError> {
        let params: CallParams = serde_json::from_value(params)
            .map_err(|e| RpcError::invalid_params(format!("invalid tools/call params: {e}")))?;

        if let Some(session_id) = &params.session_id
            && !self.sessions.touch(session_id)
        {
            tracing::debug!(session_id = %session_id, "Call names an unknown session");
        }

        tracing::info!(tool = %params.name, "Tool call");
        match self
            .registry
            .call(&params.name, &params.arguments, self.bridge.as_ref())
            .await
        {
            Ok(value) => Ok(json!({
                "content": [{ "type": "text", "text": value.to_string() }],
                "structuredContent": value,
                "isError": false,
            })),
            Err(err) => {
                tracing::warn!(tool = %params.name, kind = err.kind(), error = %err, "Tool call failed");
                Err(RpcError::from(&err))
            }
        }
    }

    /// Serve requests from `reader` until end of input.
    ///
    /// `tools/call` requests run on their own tasks, so their responses may
    /// be written out of order. Everything else is answered inline, which
    /// keeps `ping` responsive while host calls are outstanding. On end of
    /// input, calls still running are finished and answered before return.
    pub async fn run<R, W>(self: Arc<Self>, mut reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let codec = FrameCodec::lines(DEFAULT_MAX_FRAME_BYTES);
        tracing::info!(tools = self.registry.len(), bridge = self.bridge.name(), "Serving on stdio");

        let (responses, outbox) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_responses(outbox, writer));
        let mut calls = JoinSet::new();

        loop {
            let message = match codec.read_frame(&mut reader).await {
                Ok(Some(frame)) => protocol::parse(&String::from_utf8_lossy(&frame)),
                Ok(None) => break,
                Err(BridgeError::FrameTooLarge { len, max }) => Err(ProtocolError::Parse(
                    format!("message of {len} bytes exceeds {max}"),
                )),
                Err(e) => return Err(e.into()),
            };

            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(code = e.code(), error = %e, "Rejected malformed message");
                    send(&responses, e.to_response());
                    continue;
                }
            };

            if message.id.is_some() && message.method.as_deref() == Some("tools/call") {
                let server = Arc::clone(&self);
                let responses = responses.clone();
                calls.spawn(async move {
                    if let Some(response) = server.handle_message(message).await {
                        send(&responses, response);
                    }
                });
            } else if let Some(response) = self.handle_message(message).await {
                send(&responses, response);
            }

            while let Some(joined) = calls.try_join_next() {
                log_join(joined);
            }
        }

        tracing::info!(outstanding = calls.len(), "Input closed, finishing outstanding calls");
        while let Some(joined) = calls.join_next().await {
            log_join(joined);
        }
        drop(responses);
        writer_task.await??;
        Ok(())
    }
}

fn send(responses: &mpsc::UnboundedSender<Message>, response: Message) {
    if responses.send(response).is_err() {
        tracing::warn!("Output closed, dropping response");
    }
}

fn log_join(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Tool call task failed");
    }
}

/// Sole writer of the output stream: one serialized message per line.
async fn write_responses<W>(mut outbox: mpsc::UnboundedReceiver<Message>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = outbox.recv().await {
        let line = protocol::serialize(&response)?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::{Duration, Instant};

    use tether_bridge::TetherConfig;
    use tether_core::protocol::codes;
    use tether_core::{LockManager, ToolError};
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    use crate::catalog::build_registry;

    /// Answers forwarded calls the way the demo host would for `echo`.
    struct EchoBridge;

    impl Bridge for EchoBridge {
        fn name(&self) -> &str {
            "echo"
        }

        fn call<'a>(
            &'a self,
            command: &'a str,
            args: &'a Value,
        ) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>> {
            Box::pin(async move {
                match command {
                    "echo" => Ok(args.clone()),
                    "sleep" => Err(ToolError::TimedOut {
                        job_id: "job-9".into(),
                    }),
                    _ => Err(ToolError::BridgeUnavailable("down".into())),
                }
            })
        }
    }

    fn server() -> ToolServer {
        let sessions = Arc::new(SessionManager::new());
        let registry = build_registry(
            &TetherConfig::default(),
            Arc::clone(&sessions),
            Arc::new(LockManager::new()),
        )
        .unwrap();
        ToolServer::new(registry, sessions, Arc::new(EchoBridge))
    }

    async fn handle_line(server: &ToolServer, line: &str) -> Option<Message> {
        match protocol::parse(line) {
            Ok(message) => server.handle_message(message).await,
            Err(e) => Some(e.to_response()),
        }
    }

    async fn request(server: &ToolServer, line: Value) -> Message {
        handle_line(server, &line.to_string()).await.unwrap()
    }

    #[tokio::test]
    async fn initialize_and_list() {
        let server = server();
        let init = request(
            &server,
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
        )
        .await;
        let result = init.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "tether");

        let list = request(&server, json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"})).await;
        let tools = list.result.unwrap()["tools"].as_array().unwrap().clone();
        let echo = tools.iter().find(|t| t["name"] == "echo").unwrap();
        assert_eq!(echo["inputSchema"]["required"], json!(["text"]));
    }

    #[tokio::test]
    async fn echo_scenario() {
        let server = server();

        let ok = request(
            &server,
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                   "params": {"name": "echo", "arguments": {"text": "hi"}}}),
        )
        .await;
        let result = ok.result.unwrap();
        assert_eq!(result["structuredContent"], json!({"text": "hi"}));
        assert_eq!(result["isError"], json!(false));

        let missing = request(
            &server,
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call",
                   "params": {"name": "echo", "arguments": {}}}),
        )
        .await;
        let error = missing.error.unwrap();
        assert_eq!(error.code, codes::INVALID_PARAMS);
        assert!(error.message.contains("text"), "{}", error.message);
        assert_eq!(error.data.unwrap()["kind"], "schema_validation_error");

        let unknown = request(
            &server,
            json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call",
                   "params": {"name": "nope", "arguments": {}}}),
        )
        .await;
        assert_eq!(unknown.error.unwrap().code, codes::UNKNOWN_TOOL);
    }

    #[tokio::test]
    async fn timeout_error_carries_job_id() {
        let server = server();
        let response = request(
            &server,
            json!({"jsonrpc": "2.0", "id": "t", "method": "tools/call",
                   "params": {"name": "sleep", "arguments": {"ms": 10}}}),
        )
        .await;
        assert_eq!(response.id, Some(json!("t")));
        let error = response.error.unwrap();
        assert_eq!(error.code, codes::TIMED_OUT);
        assert_eq!(error.data.unwrap()["detail"]["job_id"], "job-9");
    }

    #[tokio::test]
    async fn protocol_errors_never_dispatch() {
        let server = server();

        let garbage = handle_line(&server, "not json").await.unwrap();
        assert_eq!(garbage.error.unwrap().code, codes::PARSE_ERROR);
        assert_eq!(garbage.id, Some(Value::Null));

        let no_version = request(&server, json!({"id": 4, "method": "ping"})).await;
        assert_eq!(no_version.id, Some(json!(4)));
        assert_eq!(no_version.error.unwrap().code, codes::INVALID_REQUEST);

        let array = handle_line(&server, "[1, 2]").await.unwrap();
        assert_eq!(array.error.unwrap().code, codes::INVALID_REQUEST);

        let unknown = request(&server, json!({"jsonrpc": "2.0", "id": 5, "method": "resources/list"})).await;
        assert_eq!(unknown.error.unwrap().code, codes::METHOD_NOT_FOUND);

        let bad_params = request(
            &server,
            json!({"jsonrpc": "2.0", "id": 6, "method": "tools/call", "params": {"arguments": {}}}),
        )
        .await;
        assert_eq!(bad_params.error.unwrap().code, codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn notifications_get_no_reply() {
        let server = server();
        for line in [
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            json!({"jsonrpc": "2.0", "method": "notifications/whatever", "params": {"x": 1}}),
            json!({"jsonrpc": "2.0", "id": null, "method": "tools/list"}),
        ] {
            assert!(handle_line(&server, &line.to_string()).await.is_none());
        }
    }

    #[tokio::test]
    async fn call_touches_known_session() {
        let server = server();
        let session = server.sessions.create("agent", Default::default());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        request(
            &server,
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                   "params": {"name": "echo", "arguments": {"text": "x"}, "session_id": session.id}}),
        )
        .await;
        assert!(server.sessions.get(&session.id).unwrap().last_seen > session.last_seen);
    }

    async fn read_lines(output: DuplexStream) -> Vec<Message> {
        let mut lines = BufReader::new(output).lines();
        let mut messages = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            messages.push(protocol::parse(&line).unwrap());
        }
        messages
    }

    #[tokio::test]
    async fn run_loop_writes_one_line_per_request() {
        let server = Arc::new(server());
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n\n",
            "{broken\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"echo","arguments":{"text":"hi"}}}"#,
            "\n",
        );

        let (writer, output) = tokio::io::duplex(64 * 1024);
        server.run(input.as_bytes(), writer).await.unwrap();

        let lines = read_lines(output).await;
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].id, Some(json!(1)));
        assert_eq!(lines[0].result, Some(json!({})));
        assert_eq!(lines[1].error.as_ref().unwrap().code, codes::PARSE_ERROR);
        assert_eq!(lines[2].result.as_ref().unwrap()["structuredContent"], json!({"text": "hi"}));
    }

    /// Holds every forwarded call for a while before echoing it.
    struct SlowBridge(Duration);

    impl Bridge for SlowBridge {
        fn name(&self) -> &str {
            "slow"
        }

        fn call<'a>(
            &'a self,
            _command: &'a str,
            args: &'a Value,
        ) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>> {
            Box::pin(async move {
                tokio::time::sleep(self.0).await;
                Ok(args.clone())
            })
        }
    }

    #[tokio::test]
    async fn ping_overtakes_a_slow_call() {
        let sessions = Arc::new(SessionManager::new());
        let registry = build_registry(
            &TetherConfig::default(),
            Arc::clone(&sessions),
            Arc::new(LockManager::new()),
        )
        .unwrap();
        let server = Arc::new(ToolServer::new(
            registry,
            sessions,
            Arc::new(SlowBridge(Duration::from_millis(500))),
        ));

        let (mut input, reader) = tokio::io::duplex(4096);
        let (writer, output) = tokio::io::duplex(64 * 1024);
        let serving = tokio::spawn(server.run(BufReader::new(reader), writer));

        input
            .write_all(concat!(
                r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"echo","arguments":{"text":"slow"}}}"#,
                "\n",
                r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
                "\n",
            ).as_bytes())
            .await
            .unwrap();

        let mut lines = BufReader::new(output).lines();
        let started = Instant::now();
        let first = protocol::parse(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first.id, Some(json!(2)));
        assert!(started.elapsed() < Duration::from_millis(400));

        // Closing input still lets the outstanding call answer.
        drop(input);
        let second = protocol::parse(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second.id, Some(json!(1)));
        assert_eq!(second.result.unwrap()["structuredContent"], json!({"text": "slow"}));
        assert!(lines.next_line().await.unwrap().is_none());
        serving.await.unwrap().unwrap();
    }
}
