//! Error types shared by transports, the dispatcher and the client.

use crate::jsonrpc::JsonRpcError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("transport already started")]
    AlreadyStarted,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Failure of a request or notification handler.
///
/// A structured protocol error is forwarded to the peer verbatim; anything
/// else is reported as `InternalError`.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Rpc(#[from] JsonRpcError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn into_rpc_error(self) -> JsonRpcError {
        match self {
            HandlerError::Rpc(err) => err,
            HandlerError::Internal(err) => JsonRpcError::internal_error(format!("{:#}", err)),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Internal(err.into())
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is closed")]
    Closed,

    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    #[error("call cancelled")]
    Cancelled,

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("server returned error: {0}")]
    Rpc(#[from] JsonRpcError),

    #[error("failed to decode result: {0}")]
    Decode(#[from] serde_json::Error),
}
