//! Configuration types for the tether client

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    /// Timeout configurations
    pub timeouts: TimeoutConfig,

    /// Resend policy for transport failures
    pub retry: RetryConfig,

    /// Liveness probing
    pub keep_alive: KeepAliveConfig,

    /// Automatic reconnection after a lost connection
    pub reconnect: ReconnectConfig,

    /// Continuation worker pool
    pub workers: WorkerConfig,

    /// Send `closeSession` before closing the transport
    pub send_close_message: bool,
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Establishing a physical connection
    #[serde(with = "duration_serde")]
    pub connect: Duration,

    /// Deadline of a single request
    #[serde(with = "duration_serde")]
    pub request: Duration,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_attempts: u32,

    /// Initial retry delay
    #[serde(with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum retry delay
    #[serde(with = "duration_serde")]
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,

    /// Whether to enable exponential backoff
    pub exponential_backoff: bool,
}

/// What a keep-alive message keeps alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepAliveMode {
    /// One `ping` for the whole session
    PerClient,
    /// One `keepAlive` per tracked object id
    PerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    pub enabled: bool,

    #[serde(with = "duration_serde")]
    pub interval: Duration,

    pub mode: KeepAliveMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,

    /// Pause between reconnection attempts
    #[serde(with = "duration_serde")]
    pub delay: Duration,

    /// Ignore `max_attempts` and keep trying
    pub try_forever: bool,

    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Continuations and server-request handlers running at once
    pub pool_size: usize,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            request: Duration::from_secs(10),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: 0.1,
            exponential_backoff: true,
        }
    }
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(10),
            mode: KeepAliveMode::PerClient,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::from_secs(1),
            try_forever: false,
            max_attempts: 5,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { pool_size: 10 }
    }
}

impl ClientConfig {
    /// Parse a TOML document; omitted keys keep their defaults
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.request = timeout;
        self
    }

    pub fn with_keep_alive(mut self, mode: KeepAliveMode, interval: Duration) -> Self {
        self.keep_alive = KeepAliveConfig {
            enabled: true,
            interval,
            mode,
        };
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

impl RetryConfig {
    /// Backoff before resend `attempt`, capped at `max_delay`. Attempt 0
    /// is the first send and never waits.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = if self.exponential_backoff {
            self.backoff_multiplier.max(1.0).powi((attempt - 1).min(1024) as i32)
        } else {
            1.0
        };
        let nanos = self.initial_delay.as_nanos() as f64 * factor;
        if nanos >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }

    /// [`base_delay`](Self::base_delay) shortened by a random share of at
    /// most `jitter`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter.is_nan() || self.jitter <= 0.0 {
            return base;
        }
        base.mul_f64(1.0 - self.jitter.min(1.0) * rand::random::<f64>())
    }

    /// Check if an attempt should be retried
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl ReconnectConfig {
    pub fn should_attempt(&self, attempt: u32) -> bool {
        self.enabled && (self.try_forever || attempt < self.max_attempts)
    }
}

// Durations are milliseconds on the wire
mod duration_serde {
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
