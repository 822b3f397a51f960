//! Transports, client transports and binaries support for the MCP server
//! framework built on `mcp-core`.

pub mod client_transport;
pub mod config;
pub mod logging;
pub mod tools;
pub mod transport;

pub use client_transport::{ChildProcessTransport, HttpStreamsClientTransport, SseClientTransport};
pub use config::{Config, TransportKind};
pub use transport::{HttpStreamsTransport, LineStreamTransport, SseTransport};
