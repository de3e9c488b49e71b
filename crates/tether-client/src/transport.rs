//! Client transports
//!
//! A transport owns one logical channel to the server and may replace the
//! physical connection underneath it. Everything it receives, and every
//! change of connection state, is reported as a [`TransportEvent`] on a
//! single receiver that the request sender takes once.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

use tether_broker::MessageBroker;

use crate::error::TransportError;

pub mod broker;
pub mod http;
pub mod ws;

// Re-export transport implementations
pub use broker::BrokerTransport;
pub use http::HttpTransport;
pub use ws::WsTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportType {
    WebSocket,
    /// HTTP POST per message, server push through `poll`
    Http,
    /// Request/reply over a message broker
    Broker,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WebSocket => write!(f, "WebSocket"),
            Self::Http => write!(f, "HTTP"),
            Self::Broker => write!(f, "Broker"),
        }
    }
}

/// Transport capabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportCapabilities {
    /// Server can push without the client asking
    pub bidirectional: bool,

    /// One physical connection carries every message
    pub persistent: bool,

    /// Responses are matched to requests by an out-of-band correlation id
    pub correlated: bool,

    pub max_message_size: Option<usize>,
}

/// Snapshot of a transport's connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub transport_type: TransportType,
    pub endpoint: String,
    pub connected: bool,
    /// Name of the current physical binding, when the client knows it
    pub transport_id: Option<String>,
}

/// What a transport reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A new physical connection is up
    Connected,
    /// One inbound JSON-RPC message
    Message(String),
    /// The physical connection is gone
    Disconnected(String),
    /// A non-fatal failure worth logging
    Error(String),
}

pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

#[async_trait]
pub trait Transport: Send + Sync {
    fn transport_type(&self) -> TransportType;

    fn capabilities(&self) -> TransportCapabilities;

    /// Establish the physical channel if it is not up. Returns `true` when
    /// a new connection was made.
    async fn connect_if_necessary(&self) -> Result<bool, TransportError>;

    /// Send one serialized message. Concurrent callers are serialized.
    async fn send(&self, message: String) -> Result<(), TransportError>;

    /// Send a response to a request the server pushed to us
    async fn send_response(&self, message: String) -> Result<(), TransportError> {
        self.send(message).await
    }

    /// Close the channel for good
    async fn close(&self);

    /// Tear down the current physical connection, reporting `reason`.
    /// The next [`Transport::connect_if_necessary`] builds a new one.
    async fn drop_connection(&self, reason: &str);

    fn is_connected(&self) -> bool;

    /// Take the event receiver. Only the first call gets it.
    fn take_event_receiver(&self) -> Option<EventReceiver>;

    fn connection_info(&self) -> ConnectionInfo;

    /// Session id learned by the client, for transports that need it on
    /// their own traffic
    fn set_session_id(&self, _session_id: Option<String>) {}
}

/// Boxed transport trait object
pub type BoxedTransport = Box<dyn Transport>;

/// Helper function to detect transport type from URL
pub fn detect_transport_type(url_str: &str) -> Result<TransportType, TransportError> {
    let url = Url::parse(url_str)
        .map_err(|e| TransportError::ConnectionFailed(format!("Invalid URL: {}", e)))?;

    match url.scheme() {
        "http" | "https" => Ok(TransportType::Http),
        "ws" | "wss" => Ok(TransportType::WebSocket),
        scheme => Err(TransportError::Unsupported(format!("Unknown scheme: {}", scheme))),
    }
}

/// Transport factory for creating transport instances
pub struct TransportFactory;

impl TransportFactory {
    /// Create a transport from URL string
    pub fn from_url(url: &str, connect_timeout: Duration) -> Result<BoxedTransport, TransportError> {
        match detect_transport_type(url)? {
            TransportType::Http => Ok(Box::new(HttpTransport::new(url, connect_timeout)?)),
            TransportType::WebSocket => Ok(Box::new(WsTransport::new(url, connect_timeout)?)),
            TransportType::Broker => Err(TransportError::Unsupported(
                "broker transports are created with TransportFactory::broker".to_string(),
            )),
        }
    }

    /// Broker request/reply towards the server's well-known queue
    pub fn broker(broker: Arc<dyn MessageBroker>, server_queue: &str) -> BoxedTransport {
        Box::new(BrokerTransport::new(broker, server_queue))
    }

    /// List available transport types
    pub fn available_transports() -> Vec<TransportType> {
        vec![TransportType::WebSocket, TransportType::Http, TransportType::Broker]
    }
}
