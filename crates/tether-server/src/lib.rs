//! # Tether Server
//!
//! Server side of a bidirectional JSON-RPC 2.0 session layer. Logical
//! sessions outlive the physical connections they ride on: a client that
//! drops its WebSocket, stops polling, or loses its broker link can
//! `reconnect` within the grace window and keep its session.
//!
//! ## Transports
//! - **WebSocket**: full duplex, server push goes straight to the socket
//! - **HTTP long-poll**: one POST per message, server push is drained by `poll`
//! - **Broker**: request/reply over queues, correlated by id
//!
//! ## Features
//! - Atomic session resolution, one session per new connection
//! - Exactly one response per request, handler failures and panics included
//! - Ping watchdog closing transports whose client went silent

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod prelude;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export main types
pub use config::{PingWatchdogConfig, ServerConfig};
pub use dispatch::MethodRouter;
pub use error::{ServerError, ServerResult, TransactionError};
pub use handler::{HandlerError, HandlerResult, JsonRpcHandler, Transaction};
pub use protocol::{InboundContext, ProtocolManager};
pub use server::{ServerStats, TetherServer, TetherServerBuilder};
pub use transport::broker::BrokerBridge;
pub use transport::http::{HttpTransport, TRANSPORT_ID_HEADER};
pub use watchdog::PingWatchdog;

// Re-export foundational types
pub use tether_json_rpc::{JsonRpcErrorObject, JsonRpcRequest, JsonRpcResponse, RequestId};
pub use tether_session_storage::{ServerSession, SessionStore};
