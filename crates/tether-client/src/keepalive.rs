//! Keep-alive manager
//!
//! Pings the server on a fixed interval, either once for the whole
//! session (`ping`) or once per tracked object (`keepAlive`). A ping that
//! fails at the transport level or goes unanswered within one interval is
//! reported to the client as a lost connection.

use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_json_rpc::{PONG, methods};

use crate::client::{JsonRpcClient, WeakClient};
use crate::config::{KeepAliveConfig, KeepAliveMode};
use crate::error::{ClientError, ClientResult};

pub struct KeepAliveManager {
    client: WeakClient,
    parent: CancellationToken,
    config: KeepAliveConfig,
    ids: Arc<Mutex<BTreeSet<String>>>,
    running: Mutex<Option<CancellationToken>>,
}

impl KeepAliveManager {
    pub fn new(client: &JsonRpcClient, config: KeepAliveConfig) -> Self {
        Self {
            client: client.downgrade(),
            parent: client.shutdown_token().clone(),
            config,
            ids: Arc::new(Mutex::new(BTreeSet::new())),
            running: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> KeepAliveMode {
        self.config.mode
    }

    /// Track an object id. Returns `false` if it was already tracked.
    pub fn add_id(&self, id: impl Into<String>) -> bool {
        self.ids.lock().insert(id.into())
    }

    pub fn remove_id(&self, id: &str) -> bool {
        self.ids.lock().remove(id)
    }

    pub fn tracked_ids(&self) -> Vec<String> {
        self.ids.lock().iter().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Start probing. Stops on [`KeepAliveManager::stop`], when the client
    /// is closed, or when it is dropped.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return;
        }
        let token = self.parent.child_token();
        *running = Some(token.clone());

        info!(mode = ?self.config.mode, interval_ms = self.config.interval.as_millis() as u64, "Keep-alive started");
        let beat = Heartbeat {
            client: self.client.clone(),
            config: self.config.clone(),
            ids: Arc::clone(&self.ids),
        };
        tokio::spawn(beat.run(token));
    }

    pub fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
            debug!("Keep-alive stopped");
        }
    }
}

impl Drop for KeepAliveManager {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Heartbeat {
    client: WeakClient,
    config: KeepAliveConfig,
    ids: Arc<Mutex<BTreeSet<String>>>,
}

impl Heartbeat {
    async fn run(self, shutdown: CancellationToken) {
        let interval = self.config.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(client) = self.client.upgrade() else {
                break;
            };
            // Reconnection is already under way
            if !client.is_connected() {
                continue;
            }

            let outcome = match self.config.mode {
                KeepAliveMode::PerClient => self.ping(&client).await,
                KeepAliveMode::PerId => self.keep_ids_alive(&client).await,
            };
            if let Err(e) = outcome {
                if shutdown.is_cancelled() {
                    break;
                }
                client
                    .report_transport_loss(&format!("keep-alive failed: {}", e))
                    .await;
            }
        }
    }

    async fn ping(&self, client: &JsonRpcClient) -> ClientResult<()> {
        let params = json!({ "interval": self.config.interval.as_millis() as u64 });
        let result = client
            .send_request_with_timeout(methods::PING, Some(params), self.config.interval)
            .await;
        match result {
            Ok(value) => {
                if value.get("value").and_then(Value::as_str) != Some(PONG) {
                    debug!(result = %value, "Unexpected ping result");
                }
                Ok(())
            }
            Err(e) => Self::classify(e),
        }
    }

    async fn keep_ids_alive(&self, client: &JsonRpcClient) -> ClientResult<()> {
        let ids: Vec<String> = self.ids.lock().iter().cloned().collect();
        for id in ids {
            let result = client
                .send_request_with_timeout(
                    methods::KEEP_ALIVE,
                    Some(json!({ "object": id })),
                    self.config.interval,
                )
                .await;
            if let Err(e) = result {
                Self::classify(e)?;
            }
        }
        Ok(())
    }

    /// Only silence and broken channels count as a lost connection
    fn classify(error: ClientError) -> ClientResult<()> {
        match error {
            ClientError::Timeout | ClientError::Transport(_) => Err(error),
            other => {
                warn!(error = %other, "Keep-alive rejected by server");
                Ok(())
            }
        }
    }
}
