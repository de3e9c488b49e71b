//! # JSON-RPC 2.0 Message Model
//!
//! Wire types shared by both ends of a tether session: requests,
//! notifications, responses and error objects, plus the registry that
//! correlates outgoing requests with their responses.
//!
//! ## Features
//! - JSON-RPC 2.0 framing with the session id carried inside `params` for
//!   requests and as a top-level `sessionId` member for responses
//! - Inbound classification of text into requests and responses
//! - Exactly-once resolution of pending requests (waiter or continuation)

pub mod error;
pub mod message;
pub mod pending;
pub mod prelude;
pub mod request;
pub mod response;
pub mod types;

// Re-export main types
pub use error::{JsonRpcErrorCode, JsonRpcErrorObject, MessageError};
pub use message::{JsonRpcMessage, error_reply, parse_message, parse_value};
pub use pending::{Continuation, PendingError, PendingOutcome, PendingRequests};
pub use request::JsonRpcRequest;
pub use response::{JsonRpcResponse, ResponseOutcome};
pub use types::{JsonRpcVersion, RequestId};

/// JSON-RPC 2.0 version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// Member name of the session id, inside `params` or at the response top level
pub const SESSION_ID_FIELD: &str = "sessionId";

/// Result marker returned by a successful `reconnect`
pub const RECONNECTION_SUCCESSFUL: &str = "RECONNECTION_SUCCESSFUL";

/// Result value of a `ping`
pub const PONG: &str = "pong";

/// Method names reserved by the session protocol
pub mod methods {
    /// Rebind an existing session to a new physical connection
    pub const RECONNECT: &str = "reconnect";
    /// Long-poll drain: ship owed responses, fetch queued server requests
    pub const POLL: &str = "poll";
    /// Session liveness check
    pub const PING: &str = "ping";
    /// Liveness check for a single tracked object
    pub const KEEP_ALIVE: &str = "keepAlive";
    /// Client-initiated session destruction
    pub const CLOSE_SESSION: &str = "closeSession";

    pub fn is_reserved(method: &str) -> bool {
        matches!(method, RECONNECT | POLL | PING | KEEP_ALIVE | CLOSE_SESSION)
    }
}

/// Standard JSON-RPC 2.0 error codes plus the session protocol codes
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    // Server error range: -32099 to -32000
    pub const SERVER_ERROR_START: i64 = -32099;
    pub const SERVER_ERROR_END: i64 = -32000;

    /// A handler failed or panicked while serving the request
    pub const HANDLER_ERROR: i64 = -32000;

    /// Reconnect to an unknown or expired session
    pub const RECONNECTION_ERROR: i64 = 40007;
}
