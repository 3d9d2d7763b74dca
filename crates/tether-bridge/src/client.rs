//! Bridge clients used by the proxy to reach the host.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tether_core::{Bridge, ToolError};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use crate::codec::{DEFAULT_MAX_FRAME_BYTES, FrameCodec};
use crate::config::{BridgeConfig, Transport};
use crate::error::BridgeError;
use crate::wire::{
    BRIDGE_VERSION, ClientFrame, Hello, HelloAck, PING_COMMAND, RESULT_COMMAND, Reply, TOKEN_HEADER,
};

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Retry `connect` up to `retries` extra times with a linear backoff.
async fn with_retries<T, F, Fut>(retries: u32, mut connect: F) -> Result<T, BridgeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BridgeError>>,
{
    let mut attempt = 0;
    loop {
        match connect().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < retries => {
                attempt += 1;
                tracing::warn!(attempt, retries, error = %e, "Bridge connect failed, retrying");
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Client for the persistent framed bridge.
///
/// Connects lazily on first call and keeps the connection for later calls.
/// Host calls are serialized over one connection. `ping` and `job.result`,
/// which the bridge answers itself, use a second control connection so they
/// never wait behind a long host call. When an exchange fails its connection
/// is dropped and the call is not resent, since the host may already have
/// run it; the next call reconnects.
pub struct FramedClient {
    addr: String,
    token: Option<String>,
    codec: FrameCodec,
    timeout: Duration,
    handshake_timeout: Duration,
    retries: u32,
    calls: Mutex<Option<Connection>>,
    control: Mutex<Option<Connection>>,
}

impl FramedClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            token: None,
            codec: FrameCodec::length_prefixed(DEFAULT_MAX_FRAME_BYTES),
            timeout: Duration::from_secs(70),
            handshake_timeout: Duration::from_secs(2),
            retries: 1,
            calls: Mutex::new(None),
            control: Mutex::new(None),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.addr())
            .with_token(config.token.clone())
            .with_timeout(config.timeout())
            .with_handshake_timeout(config.handshake_timeout())
            .with_retries(config.retries)
            .with_max_frame_bytes(config.max_frame_bytes)
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.codec = FrameCodec::length_prefixed(max);
        self
    }

    async fn connect(&self) -> Result<Connection, BridgeError> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let hello = Hello {
            token: self.token.clone(),
            client: json!(format!("tether/{BRIDGE_VERSION}")),
            capabilities: json!(["call"]),
            ..Hello::default()
        };
        self.codec.write_json(&mut writer, &hello).await?;

        // A rejected token shows up as a closed connection or silence.
        let ack = tokio::time::timeout(
            self.handshake_timeout,
            self.codec.read_json::<HelloAck, _>(&mut reader),
        )
        .await
        .map_err(|_| BridgeError::Handshake("no reply to handshake".into()))?;

        match ack {
            Ok(Some(ack)) if ack.ok => {
                tracing::info!(addr = %self.addr, version = %ack.version, "Connected to bridge");
                Ok(Connection { reader, writer })
            }
            Ok(Some(_)) => Err(BridgeError::Handshake("handshake refused".into())),
            Ok(None) | Err(BridgeError::Closed) => Err(BridgeError::Handshake(
                "connection closed during handshake".into(),
            )),
            Err(BridgeError::Io(e)) => Err(BridgeError::Handshake(format!(
                "connection lost during handshake: {e}"
            ))),
            Err(e) => Err(e),
        }
    }

    pub async fn request(&self, command: &str, args: &Value) -> Result<Value, ToolError> {
        let slot = match command {
            PING_COMMAND | RESULT_COMMAND => &self.control,
            _ => &self.calls,
        };
        self.exchange(slot, command, args).await
    }

    async fn exchange(
        &self,
        slot: &Mutex<Option<Connection>>,
        command: &str,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let mut guard = slot.lock().await;
        if guard.is_none() {
            let conn = with_retries(self.retries, || self.connect()).await?;
            *guard = Some(conn);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(ToolError::Internal("bridge connection missing".into()));
        };

        let frame = ClientFrame::Call {
            tool: command.to_string(),
            args: args.clone(),
        };
        let codec = self.codec;
        let exchange = async {
            codec.write_json(&mut conn.writer, &frame).await?;
            codec
                .read_json::<Reply, _>(&mut conn.reader)
                .await?
                .ok_or(BridgeError::Closed)
        };

        let outcome = tokio::time::timeout(self.timeout, exchange).await;
        match outcome {
            Ok(Ok(reply)) => reply.into_result(),
            Ok(Err(e)) => {
                *guard = None;
                tracing::warn!(command = %command, error = %e, "Bridge exchange failed, dropping connection");
                Err(e.into())
            }
            Err(_) => {
                // A late reply would be read as the answer to the next call.
                *guard = None;
                tracing::warn!(command = %command, timeout_ms = self.timeout.as_millis() as u64, "Bridge reply timed out");
                Err(BridgeError::Timeout(self.timeout).into())
            }
        }
    }
}

impl Bridge for FramedClient {
    fn name(&self) -> &str {
        "framed"
    }

    fn call<'a>(
        &'a self,
        command: &'a str,
        args: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>> {
        Box::pin(self.request(command, args))
    }
}

/// Client for the per-call HTTP bridge.
pub struct HttpClient {
    base_url: reqwest::Url,
    token: Option<String>,
    retries: u32,
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BridgeError> {
        let base_url = base_url.into();
        let parsed = reqwest::Url::parse(&base_url)
            .map_err(|e| BridgeError::InvalidUrl(format!("{base_url}: {e}")))?;
        if parsed.cannot_be_a_base() {
            return Err(BridgeError::InvalidUrl(base_url));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: parsed,
            token: None,
            retries: 1,
            client,
        })
    }

    pub fn from_config(config: &BridgeConfig) -> Result<Self, BridgeError> {
        Ok(Self::new(config.base_url(), config.timeout())?
            .with_token(config.token.clone())
            .with_retries(config.retries))
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// `{base}/call/{command}` with the command as one encoded segment.
    fn call_url(&self, command: &str) -> Result<reqwest::Url, BridgeError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| BridgeError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push("call")
            .push(command);
        Ok(url)
    }

    async fn send(&self, url: &reqwest::Url, args: &Value) -> Result<reqwest::Response, BridgeError> {
        let mut request = self.client.post(url.clone()).json(args);
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        Ok(request.send().await?)
    }

    pub async fn request(&self, command: &str, args: &Value) -> Result<Value, ToolError> {
        let url = self.call_url(command)?;

        // Only connection failures are retried: the request never arrived.
        let mut attempt = 0;
        let response = loop {
            match self.send(&url, args).await {
                Ok(response) => break response,
                Err(BridgeError::Http(e)) if e.is_connect() && attempt < self.retries => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "Bridge connect failed, retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(BridgeError::Handshake("bridge refused the token".into()).into());
        }
        let reply: Reply = response.json().await.map_err(|e| {
            BridgeError::UnexpectedResponse(format!("status {status}: {e}"))
        })?;
        reply.into_result()
    }
}

impl Bridge for HttpClient {
    fn name(&self) -> &str {
        "http"
    }

    fn call<'a>(
        &'a self,
        command: &'a str,
        args: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>> {
        Box::pin(self.request(command, args))
    }
}

/// Build the client for the configured transport.
pub fn connect_bridge(config: &BridgeConfig) -> Result<Arc<dyn Bridge>, BridgeError> {
    Ok(match config.transport {
        Transport::Framed => Arc::new(FramedClient::from_config(config)),
        Transport::Http => Arc::new(HttpClient::from_config(config)?),
    })
}
