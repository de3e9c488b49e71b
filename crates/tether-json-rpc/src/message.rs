use serde_json::Value;

use crate::error::MessageError;
use crate::request::JsonRpcRequest;
use crate::response::JsonRpcResponse;
use crate::types::RequestId;

/// A message read off any transport. Either peer may send either kind.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
}

impl JsonRpcMessage {
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(request) => request.id.as_ref(),
            JsonRpcMessage::Response(response) => response.id.as_ref(),
        }
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        match self {
            JsonRpcMessage::Request(request) => serde_json::to_string(request),
            JsonRpcMessage::Response(response) => serde_json::to_string(response),
        }
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(request: JsonRpcRequest) -> Self {
        Self::Request(request)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(response: JsonRpcResponse) -> Self {
        Self::Response(response)
    }
}

/// Classify inbound text: anything with a `method` member is a request,
/// anything with `result` or `error` is a response.
pub fn parse_message(text: &str) -> Result<JsonRpcMessage, MessageError> {
    let value: Value = serde_json::from_str(text)?;
    parse_value(value)
}

pub fn parse_value(value: Value) -> Result<JsonRpcMessage, MessageError> {
    let Some(obj) = value.as_object() else {
        return Err(MessageError::InvalidRequest {
            id: None,
            message: "message is not a JSON object".to_string(),
        });
    };

    let id = obj
        .get("id")
        .and_then(|v| serde_json::from_value::<RequestId>(v.clone()).ok());

    if let Some(version) = obj.get("jsonrpc") {
        if version != "2.0" {
            return Err(MessageError::InvalidRequest {
                id,
                message: format!("unsupported jsonrpc version {}", version),
            });
        }
    }

    if obj.contains_key("method") {
        serde_json::from_value::<JsonRpcRequest>(value)
            .map(JsonRpcMessage::Request)
            .map_err(|e| MessageError::InvalidRequest {
                id,
                message: e.to_string(),
            })
    } else if obj.contains_key("result") || obj.contains_key("error") {
        serde_json::from_value::<JsonRpcResponse>(value)
            .map(JsonRpcMessage::Response)
            .map_err(|e| MessageError::InvalidRequest {
                id,
                message: e.to_string(),
            })
    } else {
        Err(MessageError::InvalidRequest {
            id,
            message: "message has neither method nor result/error".to_string(),
        })
    }
}

/// The response a peer sends back for a message it could not read
pub fn error_reply(error: &MessageError) -> JsonRpcResponse {
    JsonRpcResponse::error(error.request_id().cloned(), error.to_error_object())
}
