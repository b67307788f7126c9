//! Bridge health publication
//!
//! A retained message on `health/knx`, republished on a fixed interval even
//! when nothing else happens, so consumers can tell a quiet bridge from a
//! dead one. The broker publishes the last-will payload if we vanish.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::link::KnxLink;
use super::messages::{BridgeStatistics, BridgeStatus, ConnectionInfo, HealthMessage};
use super::topics::Topics;
use crate::bus::{LastWill, MessageBus};
use crate::daemon::DaemonHandle;
use crate::error::Result;

pub const REASON_UNEXPECTED_DISCONNECT: &str = "unexpected_disconnect";

/// Commands and errors counted by the bridge itself
#[derive(Debug, Default)]
pub struct BridgeCounters {
    pub commands_processed: AtomicU64,
    pub commands_failed: AtomicU64,
    pub errors: AtomicU64,
}

pub struct HealthReporter {
    bridge_id: String,
    topics: Topics,
    bus: Arc<dyn MessageBus>,
    link: Arc<KnxLink>,
    daemon: Option<DaemonHandle>,
    counters: Arc<BridgeCounters>,
    devices: AtomicUsize,
    started: Instant,
}

impl HealthReporter {
    pub fn new(
        bridge_id: impl Into<String>,
        topics: Topics,
        bus: Arc<dyn MessageBus>,
        link: Arc<KnxLink>,
        daemon: Option<DaemonHandle>,
        counters: Arc<BridgeCounters>,
    ) -> Self {
        Self {
            bridge_id: bridge_id.into(),
            topics,
            bus,
            link,
            daemon,
            counters,
            devices: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    /// Will registered with the broker before connecting
    pub fn last_will(topics: &Topics, bridge_id: &str) -> LastWill {
        let message = HealthMessage {
            bridge: bridge_id.to_string(),
            timestamp: Utc::now(),
            status: BridgeStatus::Offline,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: 0,
            connection: None,
            daemon: None,
            statistics: None,
            devices_managed: 0,
            reason: Some(REASON_UNEXPECTED_DISCONNECT.to_string()),
        };
        LastWill {
            topic: topics.health(),
            payload: serde_json::to_vec(&message).unwrap_or_default(),
        }
    }

    pub fn set_device_count(&self, count: usize) {
        self.devices.store(count, Ordering::Relaxed);
    }

    /// Current status and the reason for anything short of healthy
    pub fn assess(&self) -> (BridgeStatus, Option<String>) {
        if !self.bus.is_connected() {
            return (BridgeStatus::Degraded, Some("message bus disconnected".into()));
        }
        if let Some(daemon) = &self.daemon {
            let status = daemon.status();
            if status.state.is_degraded() {
                let reason = match status.last_error {
                    Some(err) => format!("knxd {}: {}", status.state, err),
                    None => format!("knxd {}", status.state),
                };
                return (BridgeStatus::Degraded, Some(reason));
            }
        }
        if !self.link.is_connected() {
            return (BridgeStatus::Degraded, Some("knxd disconnected".into()));
        }
        (BridgeStatus::Healthy, None)
    }

    pub fn build(&self, status: BridgeStatus, reason: Option<String>) -> HealthMessage {
        let client = self.link.stats();
        let connection = ConnectionInfo {
            status: if self.link.is_connected() {
                "connected".to_string()
            } else {
                "disconnected".to_string()
            },
            address: self.link.endpoint().unwrap_or_default(),
            connected_since: client.connected_since,
        };
        let statistics = BridgeStatistics {
            messages_received: client.telegrams_received,
            messages_sent: client.telegrams_sent,
            errors: client.errors + self.counters.errors.load(Ordering::Relaxed),
            commands_processed: self.counters.commands_processed.load(Ordering::Relaxed),
            commands_failed: self.counters.commands_failed.load(Ordering::Relaxed),
        };
        HealthMessage {
            bridge: self.bridge_id.clone(),
            timestamp: Utc::now(),
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            connection: Some(connection),
            daemon: self.daemon.as_ref().map(DaemonHandle::status),
            statistics: Some(statistics),
            devices_managed: self.devices.load(Ordering::Relaxed),
            reason,
        }
    }

    pub async fn publish(&self, status: BridgeStatus, reason: Option<String>) -> Result<()> {
        let message = self.build(status, reason);
        let payload = serde_json::to_vec(&message)?;
        self.bus.publish(&self.topics.health(), &payload, true).await
    }

    pub async fn publish_current(&self) -> Result<BridgeStatus> {
        let (status, reason) = self.assess();
        self.publish(status, reason).await?;
        Ok(status)
    }

    /// Publish every `interval` until cancelled
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.publish_current().await {
                        Ok(status) => debug!("Health published: {:?}", status),
                        Err(e) => warn!("Health publish failed: {}", e),
                    }
                },
            }
        }
    }
}
