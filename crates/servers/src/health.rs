//! Health monitor — periodic probes, circuit-broken reconnection, and
//! status events.
//!
//! One supervisor owns all health state, so transitions for a given
//! server are linearizable. The monitored surface is the [`Supervised`]
//! capability rather than the connection manager itself, keeping the
//! dependency one-way.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use tb_domain::event::{HealthEvent, HealthStatus, ServerHealth};
use tb_domain::Result;

use crate::connection::ConnectionManager;

const EVENT_CAPACITY: usize = 64;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervised capability
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the monitor needs from the connection plane.
#[async_trait]
pub trait Supervised: Send + Sync {
    /// Servers currently connected and worth probing.
    async fn server_names(&self) -> Vec<String>;

    /// Capability check with a bounded deadline.
    async fn probe(&self, name: &str) -> bool;

    /// Tear down and re-establish one server's connection.
    async fn reconnect(&self, name: &str) -> Result<()>;
}

#[async_trait]
impl Supervised for ConnectionManager {
    async fn server_names(&self) -> Vec<String> {
        self.connected_names().await
    }

    async fn probe(&self, name: &str) -> bool {
        self.check_health(name).await
    }

    async fn reconnect(&self, name: &str) -> Result<()> {
        ConnectionManager::reconnect(self, name).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Monitor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub check_interval: Duration,
    /// Consecutive probe failures before scheduling reconnection.
    pub failure_threshold: u32,
    pub reconnect_delay: Duration,
    /// Reconnect attempts before parking the server in `disconnected`.
    pub max_reconnect_attempts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            failure_threshold: 3,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
        }
    }
}

/// Aggregate counts for the health endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub reconnecting: usize,
    pub disconnected: usize,
}

pub struct HealthMonitor {
    target: Arc<dyn Supervised>,
    config: HealthConfig,
    states: Mutex<HashMap<String, ServerHealth>>,
    events: broadcast::Sender<HealthEvent>,
}

impl HealthMonitor {
    pub fn new(target: Arc<dyn Supervised>, config: HealthConfig) -> Self {
        Self {
            target,
            config,
            states: Mutex::new(HashMap::new()),
            events: broadcast::channel(EVENT_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Current status of one server.
    pub fn status(&self, name: &str) -> Option<HealthStatus> {
        self.states.lock().get(name).map(|s| s.status)
    }

    /// Snapshot of all tracked servers, name-sorted.
    pub fn snapshot(&self) -> Vec<(String, ServerHealth)> {
        let mut entries: Vec<(String, ServerHealth)> = self
            .states
            .lock()
            .iter()
            .map(|(name, health)| (name.clone(), health.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn summary(&self) -> HealthSummary {
        let states = self.states.lock();
        let mut summary = HealthSummary {
            total: states.len(),
            ..Default::default()
        };
        for health in states.values() {
            match health.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Reconnecting => summary.reconnecting += 1,
                HealthStatus::Disconnected => summary.disconnected += 1,
            }
        }
        summary
    }

    /// The scheduler loop. Exits when `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        // The immediate first tick would race initialization; skip it.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_all().await,
                _ = shutdown.changed() => {
                    tracing::debug!("health monitor stopping");
                    return;
                }
            }
        }
    }

    /// Probe every supervised server once.
    pub async fn check_all(self: &Arc<Self>) {
        for name in self.target.server_names().await {
            let skip = {
                let states = self.states.lock();
                matches!(
                    states.get(&name).map(|s| s.status),
                    Some(HealthStatus::Reconnecting) | Some(HealthStatus::Disconnected)
                )
            };
            if skip {
                continue;
            }
            self.probe_one(&name).await;
        }
    }

    async fn probe_one(self: &Arc<Self>, name: &str) {
        let healthy = self.target.probe(name).await;
        let now = Utc::now();

        let schedule_reconnect = {
            let mut states = self.states.lock();
            let entry = states
                .entry(name.to_owned())
                .or_insert_with(ServerHealth::healthy);
            entry.last_check = Some(now);

            if healthy {
                entry.last_success = Some(now);
                entry.consecutive_failures = 0;
                entry.last_error = None;
                self.transition(name, entry, HealthStatus::Healthy);
                false
            } else {
                entry.consecutive_failures += 1;
                entry.last_error = Some("health probe failed".into());
                if entry.consecutive_failures >= self.config.failure_threshold {
                    self.transition(name, entry, HealthStatus::Reconnecting);
                    true
                } else {
                    self.transition(name, entry, HealthStatus::Unhealthy);
                    false
                }
            }
        };

        if schedule_reconnect {
            self.spawn_reconnect(name.to_owned());
        }
    }

    /// Re-enter the reconnect loop for a parked or failed server.
    pub fn force_reconnect(self: &Arc<Self>, name: &str) {
        {
            let mut states = self.states.lock();
            let entry = states
                .entry(name.to_owned())
                .or_insert_with(ServerHealth::healthy);
            if entry.status == HealthStatus::Reconnecting {
                return; // a reconnect loop is already running
            }
            entry.consecutive_failures = 0;
            self.transition(name, entry, HealthStatus::Reconnecting);
        }
        self.spawn_reconnect(name.to_owned());
    }

    fn spawn_reconnect(self: &Arc<Self>, name: String) {
        let monitor = self.clone();
        tokio::spawn(async move {
            monitor.reconnect_loop(&name).await;
        });
    }

    /// Bounded reconnection: at most `max_reconnect_attempts`, spaced by
    /// `reconnect_delay`; exhaustion parks the server in `disconnected`
    /// until `force_reconnect` or a configuration change.
    async fn reconnect_loop(self: Arc<Self>, name: &str) {
        for attempt in 1..=self.config.max_reconnect_attempts {
            tokio::time::sleep(self.config.reconnect_delay).await;
            match self.target.reconnect(name).await {
                Ok(()) => {
                    let mut states = self.states.lock();
                    if let Some(entry) = states.get_mut(name) {
                        let now = Utc::now();
                        entry.last_check = Some(now);
                        entry.last_success = Some(now);
                        entry.consecutive_failures = 0;
                        entry.last_error = None;
                        self.transition(name, entry, HealthStatus::Healthy);
                    }
                    tracing::info!(server = %name, attempt, "tool server reconnected");
                    return;
                }
                Err(err) => {
                    tracing::warn!(server = %name, attempt, error = %err, "reconnect attempt failed");
                    let mut states = self.states.lock();
                    if let Some(entry) = states.get_mut(name) {
                        entry.consecutive_failures += 1;
                        entry.last_error = Some(err.to_string());
                    }
                }
            }
        }

        let mut states = self.states.lock();
        if let Some(entry) = states.get_mut(name) {
            self.transition(name, entry, HealthStatus::Disconnected);
        }
        tracing::warn!(server = %name, "reconnect attempts exhausted, parking server");
    }

    /// Apply a status change, emitting an event when it actually changes.
    fn transition(&self, name: &str, entry: &mut ServerHealth, to: HealthStatus) {
        if entry.status == to {
            return;
        }
        let from = entry.status;
        entry.status = to;
        tracing::info!(server = %name, ?from, ?to, "health transition");
        let _ = self.events.send(HealthEvent {
            server: name.to_owned(),
            from,
            to,
            at: Utc::now(),
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
