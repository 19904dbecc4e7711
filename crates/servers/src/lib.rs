//! Tool-server connection plane.
//!
//! JSON-RPC protocol types, the four transports (sandbox-attached stdio,
//! local process stdio, HTTP, SSE), the file-backed server registry, the
//! connection manager with catalog aggregation and name routing, and the
//! health monitor with circuit-broken reconnection.

pub mod connection;
pub mod frame;
pub mod health;
pub mod naming;
pub mod protocol;
pub mod registry;
pub mod remote;
pub mod transport;

pub use connection::ConnectionManager;
pub use health::{HealthConfig, HealthMonitor};
pub use registry::ToolServerRegistry;
