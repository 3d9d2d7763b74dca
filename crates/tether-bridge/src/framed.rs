//! Persistent-connection bridge server.
//!
//! Each connection opens with a [`Hello`] handshake and then carries any
//! number of length-prefixed [`ClientFrame`] calls, answered in order.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tether_core::ToolError;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::codec::FrameCodec;
use crate::error::BridgeError;
use crate::server::BridgeState;
use crate::wire::{BRIDGE_VERSION, ClientFrame, Hello, HelloAck, Reply};

pub struct FramedServer {
    listener: TcpListener,
    state: BridgeState,
    codec: FrameCodec,
    handshake_timeout: Duration,
}

impl FramedServer {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        state: BridgeState,
        max_frame_bytes: usize,
        handshake_timeout: Duration,
    ) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state,
            codec: FrameCodec::length_prefixed(max_frame_bytes),
            handshake_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BridgeError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<(), BridgeError> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves. Open connections are
    /// left to finish on their own tasks.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        let auth = self.state.token_fingerprint().unwrap_or_else(|| "none".into());
        tracing::info!(addr = %addr, auth = %auth, "Framed bridge listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(addr = %addr, "Framed bridge shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let state = self.state.clone();
                    let codec = self.codec;
                    let handshake_timeout = self.handshake_timeout;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, state, codec, handshake_timeout).await {
                            tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: BridgeState,
    codec: FrameCodec,
    handshake_timeout: Duration,
) -> Result<(), BridgeError> {
    stream.set_nodelay(true)?;
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // Any handshake problem closes the connection without a reply.
    let hello = match tokio::time::timeout(
        handshake_timeout,
        codec.read_json::<Hello, _>(&mut reader),
    )
    .await
    {
        Ok(Ok(Some(hello))) => hello,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => {
            tracing::warn!(peer = %peer, error = %e, "Malformed handshake, closing");
            return Ok(());
        }
        Err(_) => {
            tracing::warn!(peer = %peer, "Handshake timed out, closing");
            return Ok(());
        }
    };

    if !state.authorize(hello.token.as_deref()) {
        tracing::warn!(peer = %peer, client = %hello.client, "Handshake rejected, closing");
        return Ok(());
    }

    codec
        .write_json(
            &mut writer,
            &HelloAck {
                ok: true,
                version: BRIDGE_VERSION.to_string(),
            },
        )
        .await?;
    tracing::info!(
        peer = %peer,
        client = %hello.client,
        capabilities = %hello.capabilities,
        "Client connected"
    );

    loop {
        let frame = match codec.read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::info!(peer = %peer, "Client disconnected");
                return Ok(());
            }
            Err(BridgeError::FrameTooLarge { len, max }) => {
                // The body was never read, so the stream is out of sync.
                tracing::warn!(peer = %peer, len, max, "Oversized frame, closing");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let reply = match serde_json::from_slice::<ClientFrame>(&frame) {
            Ok(ClientFrame::Call { tool, args }) => {
                Reply::from_result(state.handle_call(&tool, args).await)
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Malformed call frame");
                Reply::failure(&ToolError::Protocol(format!("malformed call frame: {e}")))
            }
        };
        codec.write_json(&mut writer, &reply).await?;
    }
}
