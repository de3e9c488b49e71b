use thiserror::Error;

use tether_json_rpc::{JsonRpcErrorObject, PendingError, RequestId};

/// Errors raised by session store backends
#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Maximum sessions limit reached: {0}")]
    MaxSessionsReached(usize),
}

/// Errors raised when the server talks to a client through its session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session {0} is closed")]
    Closed(String),

    #[error("Request {0} to client timed out")]
    Timeout(RequestId),

    #[error("Client returned error: {0}")]
    Remote(JsonRpcErrorObject),

    #[error("Pending request failed: {0}")]
    Pending(#[from] PendingError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by a message sink
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    #[error("Channel closed")]
    Closed,

    #[error("Send failed: {0}")]
    Failed(String),
}
