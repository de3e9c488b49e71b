//! Ping watchdog: closes transports whose client stopped pinging

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::config::PingWatchdogConfig;

/// Invoked with the transport id whose pings stopped
pub type PingTimeoutCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

struct Watch {
    generation: u64,
    interval: Duration,
    handle: AbortHandle,
}

pub struct PingWatchdog {
    config: PingWatchdogConfig,
    watches: Arc<Mutex<HashMap<String, Watch>>>,
    next_generation: Mutex<u64>,
    on_timeout: PingTimeoutCallback,
}

impl PingWatchdog {
    pub fn new(config: PingWatchdogConfig, on_timeout: PingTimeoutCallback) -> Self {
        Self {
            config,
            watches: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Mutex::new(0),
            on_timeout,
        }
    }

    /// Restart the deadline for `transport_id`. The announced interval is
    /// capped by the configured maximum.
    pub fn ping_received(&self, transport_id: &str, interval: Option<Duration>) {
        if !self.config.enabled {
            return;
        }
        let interval = interval
            .unwrap_or(self.config.max_ping_interval)
            .min(self.config.max_ping_interval);
        self.arm(transport_id.to_string(), interval);
    }

    /// Carry an armed watch over to the transport a session moved to
    pub fn update_transport_id(&self, old: &str, new: &str) {
        if old == new {
            return;
        }
        let previous = self.watches.lock().remove(old);
        if let Some(watch) = previous {
            watch.handle.abort();
            debug!(from = old, to = new, "Ping watchdog follows transport");
            self.arm(new.to_string(), watch.interval);
        }
    }

    /// Stop watching a transport that closed
    pub fn stop(&self, transport_id: &str) {
        if let Some(watch) = self.watches.lock().remove(transport_id) {
            watch.handle.abort();
        }
    }

    pub fn is_watching(&self, transport_id: &str) -> bool {
        self.watches.lock().contains_key(transport_id)
    }

    fn arm(&self, transport_id: String, interval: Duration) {
        let generation = {
            let mut next = self.next_generation.lock();
            *next += 1;
            *next
        };
        let deadline = interval * self.config.missed_pings_to_close.max(1);

        // Held across the spawn so the task cannot look before the insert
        let mut guard = self.watches.lock();
        let watches = Arc::clone(&self.watches);
        let on_timeout = Arc::clone(&self.on_timeout);
        let key = transport_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let expired = {
                let mut watches = watches.lock();
                match watches.get(&key) {
                    Some(watch) if watch.generation == generation => {
                        watches.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if expired {
                info!(
                    transport_id = %key,
                    deadline_ms = deadline.as_millis() as u64,
                    "No ping received in time, closing transport"
                );
                on_timeout(key).await;
            }
        });

        let previous = guard.insert(
            transport_id,
            Watch {
                generation,
                interval,
                handle: task.abort_handle(),
            },
        );
        drop(guard);
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }
}

impl Drop for PingWatchdog {
    fn drop(&mut self) {
        for (_, watch) in self.watches.lock().drain() {
            watch.handle.abort();
        }
    }
}
