//! Handling of requests the server pushes to the client

use async_trait::async_trait;
use serde_json::Value;

use tether_json_rpc::JsonRpcErrorObject;

#[async_trait]
pub trait ServerRequestHandler: Send + Sync {
    /// Answer a request the server sent us
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, JsonRpcErrorObject>;

    async fn handle_notification(&self, method: &str, _params: Option<Value>) {
        tracing::debug!(method, "Ignoring server notification");
    }
}
