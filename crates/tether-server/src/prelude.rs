//! # Tether Server Prelude
//!
//! ```rust
//! use tether_server::prelude::*;
//! ```

// Core server types
pub use crate::config::{PingWatchdogConfig, ServerConfig};
pub use crate::server::{ServerStats, TetherServer, TetherServerBuilder};
pub use crate::transport::broker::BrokerBridge;

// Handler types
pub use crate::dispatch::MethodRouter;
pub use crate::handler::{HandlerError, HandlerResult, JsonRpcHandler, Transaction};

// Session types
pub use tether_session_storage::prelude::*;

// Error types
pub use crate::error::{ServerError, ServerResult, TransactionError};

// Wire types
pub use tether_json_rpc::prelude::*;
