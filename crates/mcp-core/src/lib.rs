//! Transport-agnostic core of the MCP server framework.

pub mod client;
pub mod error;
pub mod jsonrpc;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tool;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use client::Client;
pub use error::{ClientError, HandlerError, TransportError};
pub use jsonrpc::{JsonRpcError, Message, Notification, Params, Request, RequestId, Response};
pub use server::{RequestContext, Server};
pub use tool::ToolRegistry;
pub use transport::{MessageHandler, Transport, TransportOptions};
