//! In-process test server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tether_broker::{InMemoryBroker, MessageBroker};
use tether_client::{ClientConfig, JsonRpcClient, TransportFactory};
use tether_server::{ServerConfig, TetherServer};

use crate::fixtures::{DoublingHandler, TestFixtures, TestHandler};

/// Queue the broker bridge consumes
pub const SERVER_QUEUE: &str = "tether-server";

/// A tether server listening on an ephemeral port, plus a broker bridge
/// on its own in-memory broker. Stopped when dropped.
pub struct TestServer {
    server: Arc<TetherServer>,
    handler: Arc<TestHandler>,
    broker: Arc<InMemoryBroker>,
    addr: SocketAddr,
    shutdown: CancellationToken,
    serve_task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(TestFixtures::server_config()).await
    }

    pub async fn start_with(config: ServerConfig) -> Self {
        crate::init_tracing();

        // Let the OS pick the port
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener");
        let addr = listener.local_addr().expect("listener has no address");

        let handler = Arc::new(TestHandler::default());
        let server = Arc::new(
            TetherServer::builder()
                .config(config)
                .shared_handler(handler.clone())
                .build(),
        );

        let serving = Arc::clone(&server);
        let serve_task = tokio::spawn(async move {
            if let Err(e) = serving.serve(listener).await {
                debug!("Test server stopped: {}", e);
            }
        });

        // Declared up front so the first publish cannot race the bridge
        let broker = Arc::new(InMemoryBroker::new());
        broker
            .declare_queue(SERVER_QUEUE)
            .await
            .expect("failed to declare server queue");
        let shutdown = CancellationToken::new();
        let bridge = server.broker_bridge(broker.clone(), SERVER_QUEUE);
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge.run(token).await {
                debug!("Broker bridge stopped: {}", e);
            }
        });

        info!("Test server listening on {}", addr);
        Self {
            server,
            handler,
            broker,
            addr,
            shutdown,
            serve_task,
        }
    }

    pub fn server(&self) -> &TetherServer {
        &self.server
    }

    pub fn handler(&self) -> &TestHandler {
        &self.handler
    }

    pub fn broker(&self) -> Arc<InMemoryBroker> {
        Arc::clone(&self.broker)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}{}", self.addr, self.server.config().ws_path)
    }

    pub fn http_url(&self) -> String {
        format!("http://{}{}", self.addr, self.server.config().http_path)
    }

    pub async fn session_count(&self) -> usize {
        self.server.get_stats().await.sessions
    }

    /// Poll `session_count` until it equals `expected` or `within` elapses
    pub async fn wait_for_sessions(&self, expected: usize, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if self.session_count().await == expected {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Client for `url` that answers the server's `double` requests
    pub fn client(&self, url: &str, config: ClientConfig) -> JsonRpcClient {
        JsonRpcClient::builder()
            .with_url(url)
            .expect("unsupported test url")
            .with_config(config)
            .with_server_handler(Arc::new(DoublingHandler))
            .build()
            .expect("failed to build client")
    }

    pub fn ws_client(&self, config: ClientConfig) -> JsonRpcClient {
        self.client(&self.ws_url(), config)
    }

    pub fn http_client(&self, config: ClientConfig) -> JsonRpcClient {
        self.client(&self.http_url(), config)
    }

    pub fn broker_client(&self, config: ClientConfig) -> JsonRpcClient {
        let transport = TransportFactory::broker(self.broker.clone(), SERVER_QUEUE);
        JsonRpcClient::builder()
            .with_transport(transport)
            .with_config(config)
            .with_server_handler(Arc::new(DoublingHandler))
            .build()
            .expect("failed to build client")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.serve_task.abort();
    }
}
