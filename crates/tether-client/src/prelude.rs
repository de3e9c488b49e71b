//! # Tether Client Prelude
//!
//! ```rust
//! use tether_client::prelude::*;
//! ```

// Core client types
pub use crate::client::{ConnectionEvent, JsonRpcClient, JsonRpcClientBuilder};
pub use crate::config::{ClientConfig, KeepAliveMode, ReconnectConfig, RetryConfig, TimeoutConfig};
pub use crate::error::{ClientError, ClientResult, TransportError};
pub use crate::handler::ServerRequestHandler;
pub use crate::keepalive::KeepAliveManager;
pub use crate::session::{SessionInfo, SessionState};

// Transport types
pub use crate::transport::{
    BrokerTransport, HttpTransport, Transport, TransportFactory, TransportType, WsTransport,
};

// Message model commonly used with the client
pub use tether_json_rpc::prelude::*;

pub use std::time::Duration;
