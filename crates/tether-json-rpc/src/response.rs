use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::JsonRpcErrorObject;
use crate::types::{JsonRpcVersion, RequestId};

/// Exactly one of `result` or `error`
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Result(Value),
    Error(JsonRpcErrorObject),
}

/// A JSON-RPC response.
///
/// `id` is `None` only for error replies to messages whose id could not be
/// read. The session id is a top-level member on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireResponse", into = "WireResponse")]
pub struct JsonRpcResponse {
    pub version: JsonRpcVersion,
    pub id: Option<RequestId>,
    pub outcome: ResponseOutcome,
    pub session_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct WireResponse {
    #[serde(rename = "jsonrpc", default)]
    version: JsonRpcVersion,
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcErrorObject>,
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

/// Distinguishes `"result": null` (present) from a missing `result`
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<WireResponse> for JsonRpcResponse {
    type Error = String;

    fn try_from(wire: WireResponse) -> Result<Self, Self::Error> {
        let outcome = match (wire.result, wire.error) {
            (Some(result), None) => ResponseOutcome::Result(result),
            (None, Some(error)) => ResponseOutcome::Error(error),
            (Some(_), Some(_)) => {
                return Err("response carries both result and error".to_string());
            }
            (None, None) => return Err("response carries neither result nor error".to_string()),
        };

        Ok(Self {
            version: wire.version,
            id: wire.id,
            outcome,
            session_id: wire.session_id,
        })
    }
}

impl From<JsonRpcResponse> for WireResponse {
    fn from(response: JsonRpcResponse) -> Self {
        let (result, error) = match response.outcome {
            ResponseOutcome::Result(value) => (Some(value), None),
            ResponseOutcome::Error(error) => (None, Some(error)),
        };
        Self {
            version: response.version,
            id: response.id,
            result,
            error,
            session_id: response.session_id,
        }
    }
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            version: JsonRpcVersion::V2_0,
            id: Some(id),
            outcome: ResponseOutcome::Result(result),
            session_id: None,
        }
    }

    pub fn null(id: RequestId) -> Self {
        Self::success(id, Value::Null)
    }

    pub fn error(id: Option<RequestId>, error: JsonRpcErrorObject) -> Self {
        Self {
            version: JsonRpcVersion::V2_0,
            id,
            outcome: ResponseOutcome::Error(error),
            session_id: None,
        }
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ResponseOutcome::Error(_))
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            ResponseOutcome::Result(value) => Some(value),
            ResponseOutcome::Error(_) => None,
        }
    }

    pub fn error_object(&self) -> Option<&JsonRpcErrorObject> {
        match &self.outcome {
            ResponseOutcome::Error(error) => Some(error),
            ResponseOutcome::Result(_) => None,
        }
    }

    pub fn into_result(self) -> Result<Value, JsonRpcErrorObject> {
        match self.outcome {
            ResponseOutcome::Result(value) => Ok(value),
            ResponseOutcome::Error(error) => Err(error),
        }
    }
}
