//! Handlers and settings shared by the E2E tests

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tether_client::{ClientConfig, ReconnectConfig, RetryConfig, ServerRequestHandler};
use tether_json_rpc::{JsonRpcErrorObject, JsonRpcRequest, error_codes};
use tether_server::{HandlerResult, JsonRpcHandler, ServerConfig, ServerSession, Transaction};

/// Server-side business handler used by every E2E test.
///
/// - `echo`: returns its params
/// - `boom`: fails with a handler error
/// - `isNew`: whether this is the first message of the session
/// - `sessionId`: the server's id for the session
/// - `sleep`: waits `ms` milliseconds, then answers
/// - `pushDouble`: asks the client to `double` `n` and returns its answer
/// - `doubleRespond`: tries to answer twice
#[derive(Default)]
pub struct TestHandler {
    established: AtomicUsize,
    closed: Mutex<Vec<(String, String)>>,
    kept_alive: Mutex<Vec<Value>>,
}

impl TestHandler {
    pub fn established_count(&self) -> usize {
        self.established.load(Ordering::SeqCst)
    }

    /// `(session id, reason)` of every session closed so far
    pub fn closed_sessions(&self) -> Vec<(String, String)> {
        self.closed.lock().clone()
    }

    /// Objects named by the client's `keepAlive` messages, in arrival order
    pub fn kept_alive(&self) -> Vec<Value> {
        self.kept_alive.lock().clone()
    }
}

#[async_trait]
impl JsonRpcHandler for TestHandler {
    async fn handle_request(
        &self,
        session: Arc<ServerSession>,
        transaction: Transaction,
        request: JsonRpcRequest,
    ) -> HandlerResult<()> {
        match request.method.as_str() {
            "echo" => {
                transaction
                    .send_response(request.params.clone().unwrap_or(Value::Null))
                    .await?;
            }
            "boom" => return Err("boom".into()),
            "isNew" => transaction.send_response(json!(session.is_new())).await?,
            "sessionId" => transaction.send_response(json!(session.session_id())).await?,
            "sleep" => {
                let ms = request.get_param("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                transaction.send_response(json!("slept")).await?;
            }
            "pushDouble" => {
                let n = request.get_param("n").cloned().unwrap_or(Value::Null);
                let doubled = session.call("double", Some(json!({ "n": n }))).await?;
                transaction.send_response(doubled).await?;
            }
            "doubleRespond" => {
                transaction.send_response(json!("first")).await?;
                // Dropped by the transaction
                let _ = transaction.send_response(json!("second")).await;
            }
            other => {
                transaction
                    .send_error(
                        error_codes::METHOD_NOT_FOUND,
                        format!("Method not found: {}", other),
                        None,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn after_connection_established(&self, _session: Arc<ServerSession>) {
        self.established.fetch_add(1, Ordering::SeqCst);
    }

    async fn after_connection_closed(&self, session: Arc<ServerSession>, reason: &str) {
        self.closed
            .lock()
            .push((session.session_id().to_string(), reason.to_string()));
    }

    async fn keep_alive(&self, _session: Arc<ServerSession>, object: Option<Value>) -> HandlerResult<()> {
        self.kept_alive.lock().push(object.unwrap_or(Value::Null));
        Ok(())
    }
}

/// Client-side handler answering the server's `double` requests
pub struct DoublingHandler;

#[async_trait]
impl ServerRequestHandler for DoublingHandler {
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, JsonRpcErrorObject> {
        if method != "double" {
            return Err(JsonRpcErrorObject::method_not_found(method));
        }
        let n = params
            .as_ref()
            .and_then(|p| p.get("n"))
            .and_then(Value::as_i64)
            .ok_or_else(|| JsonRpcErrorObject::invalid_params("n must be an integer"))?;
        Ok(json!(n * 2))
    }
}

/// Common settings for E2E tests
pub struct TestFixtures;

impl TestFixtures {
    /// Server with a short grace window so expiry tests stay fast
    pub fn server_config() -> ServerConfig {
        ServerConfig {
            reconnection_timeout: Duration::from_millis(400),
            long_poll_wait: Duration::from_millis(500),
            http_response_timeout: Duration::from_secs(10),
            push_request_timeout: Duration::from_secs(5),
            reply_queue_check_interval: Duration::from_millis(100),
            ..ServerConfig::default()
        }
    }

    /// Client reconnecting quickly after a lost connection
    pub fn client_config() -> ClientConfig {
        ClientConfig {
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(100),
                ..RetryConfig::default()
            },
            reconnect: ReconnectConfig {
                enabled: true,
                delay: Duration::from_millis(50),
                try_forever: false,
                max_attempts: 10,
            },
            ..ClientConfig::default()
        }
        .with_request_timeout(Duration::from_secs(5))
    }

    /// Client that only reconnects lazily, on its next request
    pub fn lazy_client_config() -> ClientConfig {
        ClientConfig {
            reconnect: ReconnectConfig {
                enabled: false,
                ..ReconnectConfig::default()
            },
            ..Self::client_config()
        }
    }

    pub fn echo_params() -> Value {
        json!({ "param1": "Value1", "param2": 2 })
    }
}
