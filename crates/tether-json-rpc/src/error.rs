use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::error_codes;
use crate::types::RequestId;

/// JSON-RPC error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonRpcErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    /// The business handler failed while processing the request
    HandlerError,
    /// A `reconnect` named a session that is unknown or already expired
    ReconnectionError,
    Custom(i64),
}

impl JsonRpcErrorCode {
    pub fn code(&self) -> i64 {
        match self {
            JsonRpcErrorCode::ParseError => error_codes::PARSE_ERROR,
            JsonRpcErrorCode::InvalidRequest => error_codes::INVALID_REQUEST,
            JsonRpcErrorCode::MethodNotFound => error_codes::METHOD_NOT_FOUND,
            JsonRpcErrorCode::InvalidParams => error_codes::INVALID_PARAMS,
            JsonRpcErrorCode::InternalError => error_codes::INTERNAL_ERROR,
            JsonRpcErrorCode::HandlerError => error_codes::HANDLER_ERROR,
            JsonRpcErrorCode::ReconnectionError => error_codes::RECONNECTION_ERROR,
            JsonRpcErrorCode::Custom(code) => *code,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            JsonRpcErrorCode::ParseError => "Parse error",
            JsonRpcErrorCode::InvalidRequest => "Invalid Request",
            JsonRpcErrorCode::MethodNotFound => "Method not found",
            JsonRpcErrorCode::InvalidParams => "Invalid params",
            JsonRpcErrorCode::InternalError => "Internal error",
            JsonRpcErrorCode::HandlerError => "Handler error",
            JsonRpcErrorCode::ReconnectionError => "RECONNECTION_ERROR",
            JsonRpcErrorCode::Custom(_) => "Application error",
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            error_codes::PARSE_ERROR => JsonRpcErrorCode::ParseError,
            error_codes::INVALID_REQUEST => JsonRpcErrorCode::InvalidRequest,
            error_codes::METHOD_NOT_FOUND => JsonRpcErrorCode::MethodNotFound,
            error_codes::INVALID_PARAMS => JsonRpcErrorCode::InvalidParams,
            error_codes::INTERNAL_ERROR => JsonRpcErrorCode::InternalError,
            error_codes::HANDLER_ERROR => JsonRpcErrorCode::HandlerError,
            error_codes::RECONNECTION_ERROR => JsonRpcErrorCode::ReconnectionError,
            other => JsonRpcErrorCode::Custom(other),
        }
    }

    /// Codes produced by the protocol layer itself rather than a handler
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            JsonRpcErrorCode::ParseError
                | JsonRpcErrorCode::InvalidRequest
                | JsonRpcErrorCode::MethodNotFound
                | JsonRpcErrorCode::InvalidParams
                | JsonRpcErrorCode::InternalError
        )
    }
}

impl fmt::Display for JsonRpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

/// JSON-RPC error object carried in the `error` member of a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl JsonRpcErrorObject {
    pub fn new(code: JsonRpcErrorCode, message: Option<String>, data: Option<Value>) -> Self {
        Self::with_code(
            code.code(),
            message.unwrap_or_else(|| code.message().to_string()),
            data,
        )
    }

    /// Build an error from a raw code. `type` is taken from `data.type`
    /// when the data is an object carrying one.
    pub fn with_code(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        let error_type = data
            .as_ref()
            .and_then(|d| d.get("type"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            code,
            message: message.into(),
            data,
            error_type,
        }
    }

    pub fn parse_error(data: Option<Value>) -> Self {
        Self::new(JsonRpcErrorCode::ParseError, None, data)
    }

    pub fn invalid_request(message: Option<String>) -> Self {
        Self::new(JsonRpcErrorCode::InvalidRequest, message, None)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            JsonRpcErrorCode::MethodNotFound,
            Some(format!("Method '{}' not found", method)),
            None,
        )
    }

    pub fn invalid_params(message: &str) -> Self {
        Self::new(
            JsonRpcErrorCode::InvalidParams,
            Some(message.to_string()),
            None,
        )
    }

    pub fn internal_error(message: Option<String>) -> Self {
        Self::new(JsonRpcErrorCode::InternalError, message, None)
    }

    pub fn handler_error(message: impl fmt::Display, data: Option<Value>) -> Self {
        Self::new(
            JsonRpcErrorCode::HandlerError,
            Some(format!("Handler error: {}", message)),
            data,
        )
    }

    pub fn reconnection_error(message: &str) -> Self {
        Self::new(
            JsonRpcErrorCode::ReconnectionError,
            Some(format!("{}: {}", JsonRpcErrorCode::ReconnectionError.message(), message)),
            None,
        )
    }

    pub fn kind(&self) -> JsonRpcErrorCode {
        JsonRpcErrorCode::from_code(self.code)
    }
}

impl fmt::Display for JsonRpcErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcErrorObject {}

/// Failures turning text into a message. Each maps to a wire error
/// the receiving peer can answer with.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid request: {message}")]
    InvalidRequest {
        id: Option<RequestId>,
        message: String,
    },
}

impl MessageError {
    /// The error object a peer answers a rejected message with
    pub fn to_error_object(&self) -> JsonRpcErrorObject {
        match self {
            MessageError::Parse(e) => {
                JsonRpcErrorObject::parse_error(Some(Value::String(e.to_string())))
            }
            MessageError::InvalidRequest { message, .. } => {
                JsonRpcErrorObject::invalid_request(Some(message.clone()))
            }
        }
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            MessageError::Parse(_) => None,
            MessageError::InvalidRequest { id, .. } => id.as_ref(),
        }
    }
}
