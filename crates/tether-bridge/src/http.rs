//! Per-call bridge server: one HTTP request per call.
//!
//! - `GET /ping`: bridge liveness and host health, no token required
//! - `POST /call/:tool`: JSON body is the argument object
//! - `GET /jobs/:id`: retained result of an earlier job

use std::future::Future;
use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tether_core::ToolError;
use tokio::net::{TcpListener, ToSocketAddrs};

use crate::error::BridgeError;
use crate::server::BridgeState;
use crate::wire::{Reply, TOKEN_HEADER};

pub fn build_router(state: BridgeState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/call/:tool", post(call))
        .route("/jobs/:id", get(job))
        .with_state(state)
}

pub struct HttpServer {
    listener: TcpListener,
    state: BridgeState,
}

impl HttpServer {
    pub async fn bind(addr: impl ToSocketAddrs, state: BridgeState) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BridgeError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<(), BridgeError> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        let auth = self.state.token_fingerprint().unwrap_or_else(|| "none".into());
        tracing::info!(addr = %addr, auth = %auth, "HTTP bridge listening");

        axum::serve(self.listener, build_router(self.state))
            .with_graceful_shutdown(shutdown)
            .await?;
        tracing::info!(addr = %addr, "HTTP bridge stopped");
        Ok(())
    }
}

fn authorized(state: &BridgeState, headers: &HeaderMap) -> bool {
    let presented = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
    state.authorize(presented)
}

fn status_for(err: &ToolError) -> StatusCode {
    match err {
        ToolError::TimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
        ToolError::Protocol(_) | ToolError::SchemaValidation { .. } => StatusCode::BAD_REQUEST,
        ToolError::UnknownTool(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    }
}

fn reply(result: Result<Value, ToolError>) -> Response {
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(err) => status_for(err),
    };
    (status, Json(Reply::from_result(result))).into_response()
}

async fn ping(State(state): State<BridgeState>) -> Json<Value> {
    Json(state.ping())
}

async fn call(
    State(state): State<BridgeState>,
    Path(tool): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Same as the framed variant: no hint about why.
    if !authorized(&state, &headers) {
        tracing::warn!(tool = %tool, "Rejected call with bad token");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let args = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(args) => args,
            Err(e) => {
                return reply(Err(ToolError::Protocol(format!("invalid JSON body: {e}"))));
            }
        }
    };

    reply(state.handle_call(&tool, args).await)
}

async fn job(
    State(state): State<BridgeState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let body = state.job_result(&id);
    let status = if body["status"] == "unknown" {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    };
    (status, Json(Reply::success(body))).into_response()
}
