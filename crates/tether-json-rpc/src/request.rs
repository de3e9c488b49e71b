use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::SESSION_ID_FIELD;
use crate::types::{JsonRpcVersion, RequestId};

/// A JSON-RPC request, or a notification when `id` is `None`.
///
/// The session id travels inside `params` on the wire and is lifted into
/// its own field on the way in, so handlers see the params the caller
/// actually sent.
///
/// Absent, `null` and `{}` params are the same thing on the wire once a
/// session id is added, so all three are held as `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireRequest", into = "WireRequest")]
pub struct JsonRpcRequest {
    pub version: JsonRpcVersion,
    pub id: Option<RequestId>,
    pub method: String,
    /// Never `Some(null)` or `Some({})` when built through this API
    pub params: Option<Value>,
    pub session_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct WireRequest {
    #[serde(rename = "jsonrpc", default)]
    version: JsonRpcVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl From<WireRequest> for JsonRpcRequest {
    fn from(wire: WireRequest) -> Self {
        let mut params = wire.params;
        let mut session_id = None;

        if let Some(Value::Object(map)) = params.as_mut() {
            if let Some(Value::String(id)) = map.remove(SESSION_ID_FIELD) {
                session_id = Some(id);
            }
        }

        Self {
            version: wire.version,
            id: wire.id,
            method: wire.method,
            params: normalize_params(params),
            session_id,
        }
    }
}

impl From<JsonRpcRequest> for WireRequest {
    fn from(request: JsonRpcRequest) -> Self {
        let params = match (normalize_params(request.params), request.session_id) {
            (Some(Value::Object(mut map)), Some(session_id)) => {
                map.insert(SESSION_ID_FIELD.to_string(), Value::String(session_id));
                Some(Value::Object(map))
            }
            (None, Some(session_id)) => {
                let mut map = Map::new();
                map.insert(SESSION_ID_FIELD.to_string(), Value::String(session_id));
                Some(Value::Object(map))
            }
            // Positional params have nowhere to carry a session id
            (params, _) => params,
        };

        Self {
            version: request.version,
            id: request.id,
            method: request.method,
            params,
        }
    }
}

fn normalize_params(params: Option<Value>) -> Option<Value> {
    match params {
        Some(Value::Null) => None,
        Some(Value::Object(map)) if map.is_empty() => None,
        params => params,
    }
}

impl JsonRpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            version: JsonRpcVersion::V2_0,
            id: Some(id),
            method: method.into(),
            params: normalize_params(params),
            session_id: None,
        }
    }

    /// Create a notification: a request that never gets a response
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            version: JsonRpcVersion::V2_0,
            id: None,
            method: method.into(),
            params: normalize_params(params),
            session_id: None,
        }
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Get a parameter by name (if params are an object)
    pub fn get_param(&self, name: &str) -> Option<&Value> {
        self.params.as_ref()?.as_object()?.get(name)
    }

    /// Get a parameter by index (if params are an array)
    pub fn get_param_index(&self, index: usize) -> Option<&Value> {
        self.params.as_ref()?.as_array()?.get(index)
    }

    /// Deserialize the params into a typed value; absent params read as `null`
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.params.clone().unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{from_str, json, to_string, to_value};

    #[test]
    fn test_request_serialization() {
        let request = JsonRpcRequest::new(RequestId::Number(1), "test_method", None);

        let json = to_string(&request).unwrap();
        let parsed: JsonRpcRequest = from_str(&json).unwrap();

        assert_eq!(parsed.id, Some(RequestId::Number(1)));
        assert_eq!(parsed.method, "test_method");
        assert!(parsed.params.is_none());
        assert!(parsed.session_id.is_none());
    }

    #[test]
    fn test_session_id_travels_inside_params() {
        let request = JsonRpcRequest::new(
            RequestId::Number(3),
            "echo",
            Some(json!({"param1": "Value1", "param2": "Value2"})),
        )
        .with_session_id(Some("abc".to_string()));

        let wire = to_value(&request).unwrap();
        assert_eq!(wire["params"]["sessionId"], "abc");
        assert_eq!(wire["jsonrpc"], "2.0");
        assert!(wire.get("sessionId").is_none());

        let parsed: JsonRpcRequest = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(
            parsed.params,
            Some(json!({"param1": "Value1", "param2": "Value2"}))
        );
    }

    #[test]
    fn test_session_id_without_params() {
        let request = JsonRpcRequest::new(RequestId::Number(9), "reconnect", None)
            .with_session_id(Some("s-1".to_string()));

        let wire = to_value(&request).unwrap();
        assert_eq!(wire["params"], json!({"sessionId": "s-1"}));

        let parsed: JsonRpcRequest = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed.session_id(), Some("s-1"));
        assert!(parsed.params.is_none());
    }

    #[test]
    fn test_empty_and_null_params_survive_session_id() {
        for params in [Some(json!({})), Some(Value::Null), None] {
            for session_id in [Some("s".to_string()), None] {
                let request = JsonRpcRequest::new(RequestId::Number(1), "m", params.clone())
                    .with_session_id(session_id.clone());
                assert!(request.params.is_none());

                let parsed: JsonRpcRequest = from_str(&to_string(&request).unwrap()).unwrap();
                assert_eq!(parsed, request);
                assert_eq!(parsed.session_id, session_id);
            }
        }

        // Same on the way in: an explicit `{}` reads as no params
        let parsed: JsonRpcRequest =
            from_str(r#"{"jsonrpc":"2.0","id":1,"method":"m","params":{}}"#).unwrap();
        assert!(parsed.params.is_none());
    }

    #[test]
    fn test_notification_has_no_id() {
        let notification = JsonRpcRequest::notification("log", Some(json!({"level": "info"})));
        let json_str = to_string(&notification).unwrap();

        assert!(!json_str.contains("\"id\""));
        assert!(json_str.contains("\"method\":\"log\""));

        let parsed: JsonRpcRequest = from_str(&json_str).unwrap();
        assert!(parsed.is_notification());
        assert_eq!(parsed.get_param("level"), Some(&json!("info")));
    }

    #[test]
    fn test_array_params() {
        let request = JsonRpcRequest::new(
            RequestId::Number(2),
            "process",
            Some(json!(["test", 42, true])),
        );

        assert_eq!(request.get_param_index(0), Some(&json!("test")));
        assert_eq!(request.get_param_index(1), Some(&json!(42)));
        assert_eq!(request.get_param_index(3), None);
        assert_eq!(request.get_param("test"), None);
    }

    #[test]
    fn test_typed_params() {
        #[derive(Deserialize)]
        struct Ping {
            interval: u64,
        }

        let request: JsonRpcRequest =
            from_str(r#"{"jsonrpc":"2.0","id":5,"method":"ping","params":{"interval":3000,"sessionId":"x"}}"#)
                .unwrap();
        let ping: Ping = request.params_as().unwrap();
        assert_eq!(ping.interval, 3000);
        assert_eq!(request.session_id(), Some("x"));
    }
}
