use thiserror::Error;

use tether_broker::BrokerError;
use tether_session_storage::{SessionError, SessionStoreError};

/// Result type for server operations
pub type ServerResult<T> = std::result::Result<T, ServerError>;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Session store error: {0}")]
    Store(#[from] SessionStoreError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors a handler gets back from a [`crate::Transaction`]
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("A response was already sent for request {0}")]
    AlreadyResponded(String),

    #[error("Failed to serialize response: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to deliver response: {0}")]
    Delivery(#[from] SessionError),
}
