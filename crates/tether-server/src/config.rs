//! Configuration types for tether servers

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tether_session_storage::{DEFAULT_PUSH_REQUEST_TIMEOUT, DEFAULT_RECONNECTION_TIMEOUT};

use crate::error::ServerResult;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_address: SocketAddr,

    /// Path of the HTTP long-poll endpoint
    pub http_path: String,

    /// Path that accepts WebSocket upgrades
    pub ws_path: String,

    /// Maximum request body size
    pub max_body_size: usize,

    /// Grace window a disconnected session stays reconnectable
    #[serde(with = "duration_serde")]
    pub reconnection_timeout: Duration,

    /// How long a `poll` waits for queued server requests before returning empty
    #[serde(with = "duration_serde")]
    pub long_poll_wait: Duration,

    /// How long an HTTP exchange waits for the handler's response
    #[serde(with = "duration_serde")]
    pub http_response_timeout: Duration,

    /// Timeout for requests the server pushes to clients
    #[serde(with = "duration_serde")]
    pub push_request_timeout: Duration,

    /// How often the broker bridge checks that known reply queues still exist
    #[serde(with = "duration_serde")]
    pub reply_queue_check_interval: Duration,

    /// Ping watchdog settings
    pub ping_watchdog: PingWatchdogConfig,
}

/// Ping watchdog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PingWatchdogConfig {
    /// Close transports whose pings stop arriving
    pub enabled: bool,

    /// Upper bound for the interval a client may announce
    #[serde(with = "duration_serde")]
    pub max_ping_interval: Duration,

    /// Missed intervals before the transport is closed
    pub missed_pings_to_close: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8888)),
            http_path: "/jsonrpc".to_string(),
            ws_path: "/ws".to_string(),
            max_body_size: 1024 * 1024, // 1MB
            reconnection_timeout: DEFAULT_RECONNECTION_TIMEOUT,
            long_poll_wait: Duration::from_secs(20),
            http_response_timeout: Duration::from_secs(30),
            push_request_timeout: DEFAULT_PUSH_REQUEST_TIMEOUT,
            reply_queue_check_interval: Duration::from_secs(5),
            ping_watchdog: PingWatchdogConfig::default(),
        }
    }
}

impl Default for PingWatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_ping_interval: Duration::from_secs(20),
            missed_pings_to_close: 3,
        }
    }
}

impl ServerConfig {
    /// Parse a TOML document; omitted keys keep their defaults
    pub fn from_toml_str(input: &str) -> ServerResult<Self> {
        Ok(toml::from_str(input)?)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> ServerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }

    pub fn with_reconnection_timeout(mut self, timeout: Duration) -> Self {
        self.reconnection_timeout = timeout;
        self
    }

    pub fn with_long_poll_wait(mut self, wait: Duration) -> Self {
        self.long_poll_wait = wait;
        self
    }
}

// Helper module for Duration serialization
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
