//! Host-side bridge for tether.
//!
//! Calls arrive over one of two transports ([`FramedServer`] or
//! [`HttpServer`]), become jobs on a [`JobQueue`], and are executed one at a
//! time by a [`HostRunner`] on the host's own thread. [`FramedClient`] and
//! [`HttpClient`] are the matching clients, usable as a
//! [`tether_core::Bridge`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tether_bridge::{
//!     BridgeState, FramedServer, HostHealth, HostRunner, HostThread, JobQueue, MemoryHost,
//!     TimeoutPolicy,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = JobQueue::default();
//! let health = HostHealth::new(Duration::from_secs(30));
//!
//! // The host thread is the only place commands execute.
//! let runner = HostRunner::new(MemoryHost::new(), queue.clone(), health.clone());
//! let _host = HostThread::spawn(runner, Duration::from_millis(50), 8)?;
//!
//! let state = BridgeState::new(queue, health, TimeoutPolicy::default()).with_token(Some("secret"));
//! let server = FramedServer::bind("127.0.0.1:8765", state, 8 << 20, Duration::from_secs(2)).await?;
//! server.serve().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod demo;
pub mod error;
pub mod framed;
pub mod host;
pub mod http;
pub mod queue;
pub mod server;
pub mod wire;

pub use client::{FramedClient, HttpClient, connect_bridge};
pub use codec::FrameCodec;
pub use config::{BridgeConfig, HostConfig, TetherConfig, ToolSpec, Transport};
pub use demo::MemoryHost;
pub use error::{BridgeError, ConfigError};
pub use framed::FramedServer;
pub use host::{Host, HostFailure, HostHealth, HostRunner, HostThread};
pub use http::HttpServer;
pub use queue::{JobQueue, JobStatus};
pub use server::{BridgeState, TimeoutPolicy};
