//! # Tether Client
//!
//! Client side of a tether JSON-RPC session: a request sender that keeps
//! one logical session alive across physical reconnections, over
//! WebSocket, HTTP long-poll or a message broker.
//!
//! ## Features
//!
//! - **Correlation**: every call is matched to its response by id, with a
//!   hard deadline per call
//! - **Two call modes**: awaited calls and callback calls run on a bounded
//!   worker pool
//! - **Reconnection**: the `reconnect` handshake rebinds the session after a
//!   lost connection; an expired session is dropped and replaced lazily
//! - **Keep-alive**: per-session `ping` or per-object `keepAlive` messages
//! - **Server push**: requests from the server go to a [`ServerRequestHandler`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether_client::JsonRpcClient;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = JsonRpcClient::builder()
//!         .with_url("ws://localhost:8888/ws")?
//!         .build()?;
//!
//!     let echoed = client
//!         .send_request_value("echo", Some(json!({"param1": "Value1"})))
//!         .await?;
//!     println!("echo returned {} in session {:?}", echoed, client.session_id());
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Transports
//!
//! - [`transport::WsTransport`]: `ws://` and `wss://`
//! - [`transport::HttpTransport`]: `http://` and `https://`, server push via `poll`
//! - [`transport::BrokerTransport`]: any [`tether_broker::MessageBroker`]

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod keepalive;
pub mod prelude;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export main types
pub use client::{ConnectionEvent, JsonRpcClient, JsonRpcClientBuilder};
pub use config::{
    ClientConfig, ConfigError, KeepAliveConfig, KeepAliveMode, ReconnectConfig, RetryConfig,
    TimeoutConfig, WorkerConfig,
};
pub use error::{ClientError, ClientResult, TransportError};
pub use handler::ServerRequestHandler;
pub use keepalive::KeepAliveManager;
pub use session::{SessionInfo, SessionState};

// Re-export transport types
pub use transport::{Transport, TransportEvent, TransportFactory, TransportType};
