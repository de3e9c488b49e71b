//! Typed method dispatch table
//!
//! A [`MethodRouter`] maps method names to async functions and answers
//! the transaction with whatever they return. Methods it does not know
//! are answered with `-32601` without reaching any function.

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use tether_json_rpc::{JsonRpcErrorObject, JsonRpcRequest};
use tether_session_storage::ServerSession;

use crate::handler::{HandlerResult, JsonRpcHandler, Transaction};

type MethodFn = Arc<
    dyn Fn(Arc<ServerSession>, Option<Value>) -> BoxFuture<'static, HandlerResult<Value>>
        + Send
        + Sync,
>;
type SessionHook = Arc<dyn Fn(Arc<ServerSession>) -> BoxFuture<'static, ()> + Send + Sync>;
type ClosedHook = Arc<dyn Fn(Arc<ServerSession>, String) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct MethodRouter {
    methods: HashMap<String, MethodFn>,
    on_established: Option<SessionHook>,
    on_closed: Option<ClosedHook>,
}

impl MethodRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async function for `method`
    pub fn route<F, Fut>(mut self, method: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<ServerSession>, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Value>> + Send + 'static,
    {
        let f: MethodFn = Arc::new(move |session: Arc<ServerSession>, params: Option<Value>| {
            f(session, params).boxed()
        });
        self.methods.insert(method.into(), f);
        self
    }

    pub fn on_established<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<ServerSession>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_established = Some(Arc::new(move |session: Arc<ServerSession>| f(session).boxed()));
        self
    }

    pub fn on_closed<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<ServerSession>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_closed = Some(Arc::new(move |session: Arc<ServerSession>, reason: String| {
            f(session, reason).boxed()
        }));
        self
    }

    pub fn supported_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.methods.keys().cloned().collect();
        methods.sort();
        methods
    }
}

#[async_trait]
impl JsonRpcHandler for MethodRouter {
    async fn handle_request(
        &self,
        session: Arc<ServerSession>,
        transaction: Transaction,
        request: JsonRpcRequest,
    ) -> HandlerResult<()> {
        let Some(method) = self.methods.get(&request.method) else {
            debug!(method = %request.method, "No route for method");
            transaction
                .send_error_object(JsonRpcErrorObject::method_not_found(&request.method))
                .await?;
            return Ok(());
        };

        let result = method(session, request.params).await?;
        transaction.send_response(result).await?;
        Ok(())
    }

    async fn after_connection_established(&self, session: Arc<ServerSession>) {
        if let Some(hook) = &self.on_established {
            hook(session).await;
        }
    }

    async fn after_connection_closed(&self, session: Arc<ServerSession>, reason: &str) {
        if let Some(hook) = &self.on_closed {
            hook(session, reason.to_string()).await;
        }
    }
}

impl std::fmt::Debug for MethodRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRouter")
            .field("methods", &self.supported_methods())
            .finish()
    }
}
