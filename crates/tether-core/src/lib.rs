//! Transport-independent core of tether.
//!
//! - [`protocol`]: the line-delimited JSON-RPC envelope spoken to clients
//! - [`registry`] and [`schema`]: the tool catalog and argument validation
//! - [`session`]: client sessions and per-resource leases
//! - [`bridge`]: the seam through which forwarded tools reach the host

pub mod bridge;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod session;

pub use bridge::{Bridge, DetachedBridge};
pub use error::{ErrorPayload, ToolError};
pub use registry::{Access, ToolDefinition, ToolHandler, ToolRegistry};
pub use session::{LockInfo, LockManager, Session, SessionManager};
