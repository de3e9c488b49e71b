//! Error types for client operations
//!
//! Callers of the request sender only ever see [`ClientError`]. Everything
//! that goes wrong below it (sockets, HTTP, broker queues, serialization)
//! is folded into [`TransportError`] first.

use serde_json::Value;
use thiserror::Error;

use tether_json_rpc::JsonRpcErrorObject;
use tether_json_rpc::error_codes::RECONNECTION_ERROR;

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    /// No response arrived within the call's deadline
    #[error("Request timed out")]
    Timeout,

    /// The physical channel failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The peer answered with a JSON-RPC error
    #[error("Server error (code {code}): {message}")]
    Application {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// The server no longer knows our session
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// The client was closed by its owner
    #[error("Client closed")]
    Closed,
}

/// Transport-specific errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP transport error: {0}")]
    Http(String),

    #[error("WebSocket transport error: {0}")]
    WebSocket(String),

    #[error("Broker transport error: {0}")]
    Broker(String),

    #[error("Unsupported transport: {0}")]
    Unsupported(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport closed unexpectedly")]
    Closed,
}

impl ClientError {
    /// Map a JSON-RPC error object into the caller-visible error
    pub fn from_error_object(error: JsonRpcErrorObject) -> Self {
        if error.code == RECONNECTION_ERROR {
            return Self::SessionExpired(error.message);
        }
        Self::Application {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }

    /// Only transport failures are worth resending
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Get the error code if this is an application error
    pub fn error_code(&self) -> Option<i64> {
        match self {
            Self::Application { code, .. } => Some(*code),
            Self::SessionExpired(_) => Some(RECONNECTION_ERROR),
            _ => None,
        }
    }
}

impl TransportError {
    /// Failures where the message may never have reached the server
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::Closed | Self::WebSocket(_) | Self::Broker(_)
        )
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_connect() {
            Self::ConnectionFailed(error.to_string())
        } else {
            Self::Http(error.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(error.to_string())
    }
}

impl From<tether_broker::BrokerError> for TransportError {
    fn from(error: tether_broker::BrokerError) -> Self {
        Self::Broker(error.to_string())
    }
}
