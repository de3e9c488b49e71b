//! # JSON-RPC Prelude
//!
//! ```rust
//! use tether_json_rpc::prelude::*;
//! ```

pub use crate::error::{JsonRpcErrorCode, JsonRpcErrorObject, MessageError};
pub use crate::message::{JsonRpcMessage, parse_message};
pub use crate::pending::{PendingError, PendingRequests};
pub use crate::request::JsonRpcRequest;
pub use crate::response::{JsonRpcResponse, ResponseOutcome};
pub use crate::types::{JsonRpcVersion, RequestId};
pub use crate::{RECONNECTION_SUCCESSFUL, SESSION_ID_FIELD, methods};

// Standard error codes
pub use crate::error_codes::*;
