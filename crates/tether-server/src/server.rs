//! Tether server: one listener serving WebSocket upgrades and HTTP long-poll

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use tether_broker::MessageBroker;
use tether_session_storage::{BoxedSessionStore, InMemorySessionStore, SessionInfo};

use crate::config::ServerConfig;
use crate::dispatch::MethodRouter;
use crate::error::ServerResult;
use crate::handler::JsonRpcHandler;
use crate::protocol::ProtocolManager;
use crate::transport::broker::BrokerBridge;
use crate::transport::http::HttpTransport;
use crate::transport::{ResponseBody, status_response, ws};

/// Builder for a tether server with pluggable session store and handler
pub struct TetherServerBuilder {
    config: ServerConfig,
    store: Arc<BoxedSessionStore>,
    handler: Option<Arc<dyn JsonRpcHandler>>,
}

impl TetherServerBuilder {
    /// Create a new builder with in-memory storage
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            store: Arc::new(InMemorySessionStore::new()),
            handler: None,
        }
    }

    /// Create a new builder with a specific session store
    pub fn with_store(store: Arc<BoxedSessionStore>) -> Self {
        Self {
            store,
            ..Self::new()
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.config.bind_address = addr;
        self
    }

    pub fn http_path(mut self, path: impl Into<String>) -> Self {
        self.config.http_path = path.into();
        self
    }

    pub fn ws_path(mut self, path: impl Into<String>) -> Self {
        self.config.ws_path = path.into();
        self
    }

    pub fn reconnection_timeout(mut self, timeout: Duration) -> Self {
        self.config.reconnection_timeout = timeout;
        self
    }

    pub fn handler<H>(mut self, handler: H) -> Self
    where
        H: JsonRpcHandler + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn shared_handler(mut self, handler: Arc<dyn JsonRpcHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Build the server. Without a handler every method answers `-32601`.
    pub fn build(self) -> TetherServer {
        let handler = self
            .handler
            .unwrap_or_else(|| Arc::new(MethodRouter::new()));
        let protocol = ProtocolManager::new(self.config.clone(), self.store, handler);
        let http = HttpTransport::new(protocol.clone());

        TetherServer {
            config: self.config,
            protocol,
            http,
        }
    }
}

impl Default for TetherServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct TetherServer {
    config: ServerConfig,
    protocol: ProtocolManager,
    http: HttpTransport,
}

impl TetherServer {
    pub fn builder() -> TetherServerBuilder {
        TetherServerBuilder::new()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn protocol(&self) -> &ProtocolManager {
        &self.protocol
    }

    /// Bridge a broker queue into this server's sessions
    pub fn broker_bridge(&self, broker: Arc<dyn MessageBroker>, queue: impl Into<String>) -> BrokerBridge {
        BrokerBridge::new(self.protocol.clone(), broker, queue)
    }

    /// Bind the configured address and serve until an accept fails
    pub async fn run(&self) -> ServerResult<()> {
        let listener = TcpListener::bind(&self.config.bind_address).await?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> ServerResult<()> {
        info!("Tether server listening on {}", listener.local_addr()?);
        info!("WebSocket endpoint: {}", self.config.ws_path);
        info!("HTTP endpoint: {}", self.config.http_path);
        info!("Session store: {}", self.protocol.store().backend_name());

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            debug!("New connection from {}", peer_addr);

            let server = self.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.route(req).await) }
                });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    let err_str = err.to_string();
                    if err_str.contains("connection closed before message completed") {
                        debug!("Client disconnected (normal): {}", err);
                    } else {
                        error!("Error serving connection: {}", err);
                    }
                }
            });
        }
    }

    async fn route(&self, req: Request<Incoming>) -> Response<ResponseBody> {
        let path = req.uri().path().to_string();
        debug!("Handling {} {}", req.method(), path);

        if path == self.config.ws_path {
            if ws::is_upgrade_request(&req) {
                ws::upgrade(req, self.protocol.clone())
            } else {
                status_response(StatusCode::UPGRADE_REQUIRED, "WebSocket upgrade required")
            }
        } else if path == self.config.http_path {
            self.http.handle(req).await
        } else {
            status_response(StatusCode::NOT_FOUND, "Not Found")
        }
    }

    pub async fn get_stats(&self) -> ServerStats {
        let store = self.protocol.store();
        ServerStats {
            sessions: store.session_count().await,
            storage_type: store.backend_name().to_string(),
        }
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.protocol.store().list_sessions().await
    }
}

/// Server statistics
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub sessions: usize,
    pub storage_type: String,
}
