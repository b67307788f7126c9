//! The bridge's current knxd connection and its supervisor
//!
//! [`KnxLink`] holds whichever client is connected right now. The
//! [`ConnectionSupervisor`] owns the connect/reconnect cycle: it waits until
//! the daemon manager reports knxd ready, connects, forwards every inbound
//! telegram into one queue (so per-device arrival order is preserved), and
//! reconnects whenever the manager bumps its reconnect generation. Transport
//! loss is reported to the manager rather than retried here.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voltage_knx::Telegram;

use crate::config::ClientConfig;
use crate::daemon::{ClientEvent, ClientStats, DaemonHandle, DaemonStatus, KnxdClient, TelegramSender};
use crate::error::{KnxSrvError, Result};

/// Slot for the live connection
#[derive(Default)]
pub struct KnxLink {
    sender: RwLock<Option<Arc<dyn TelegramSender>>>,
}

impl KnxLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, sender: Arc<dyn TelegramSender>) {
        *self.sender.write() = Some(sender);
    }

    pub fn clear(&self) {
        *self.sender.write() = None;
    }

    pub fn current(&self) -> Option<Arc<dyn TelegramSender>> {
        self.sender.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some_and(|s| s.is_connected())
    }

    pub fn stats(&self) -> ClientStats {
        self.current().map(|s| s.stats()).unwrap_or_default()
    }

    pub fn endpoint(&self) -> Option<String> {
        self.current().map(|s| s.endpoint())
    }

    pub async fn send(&self, telegram: Telegram) -> Result<()> {
        let sender = self.current().ok_or(KnxSrvError::NotConnected)?;
        sender.send(telegram).await
    }
}

/// What the supervisor feeds the bridge
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Connected,
    Telegram(Telegram),
    Disconnected(String),
}

pub struct ConnectionSupervisor {
    url: String,
    config: ClientConfig,
    link: Arc<KnxLink>,
    daemon: Option<DaemonHandle>,
    events: mpsc::Sender<LinkEvent>,
    retry_delay: Duration,
}

impl ConnectionSupervisor {
    pub fn new(
        url: impl Into<String>,
        config: ClientConfig,
        link: Arc<KnxLink>,
        daemon: Option<DaemonHandle>,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        Self {
            url: url.into(),
            config,
            link,
            daemon,
            events,
            retry_delay: Duration::from_secs(2),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Connect/reconnect loop; returns on cancellation
    pub async fn run(self, cancel: CancellationToken) {
        let mut status = self.daemon.as_ref().map(DaemonHandle::subscribe);

        loop {
            let generation = match status.as_mut() {
                Some(rx) => match wait_until_ready(rx, &cancel).await {
                    Some(generation) => generation,
                    None => break,
                },
                None => 0,
            };

            let (client, mut rx) = match KnxdClient::connect(&self.url, &self.config).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("knxd connect to {} failed: {}", self.url, e);
                    if let Some(daemon) = &self.daemon {
                        daemon.request_check();
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_delay) => continue,
                    }
                },
            };

            self.link.set(client.clone());
            let _ = self.events.send(LinkEvent::Connected).await;

            let reason = tokio::select! {
                _ = cancel.cancelled() => None,
                reason = self.pump(&mut rx, status.as_mut(), generation) => Some(reason),
            };

            self.link.clear();
            client.close().await;
            match reason {
                None => break,
                Some(reason) => {
                    let _ = self.events.send(LinkEvent::Disconnected(reason)).await;
                },
            }
        }
        debug!("Connection supervisor stopped");
    }

    /// Forward events until the connection ends; returns the reason
    async fn pump(
        &self,
        rx: &mut mpsc::Receiver<ClientEvent>,
        mut status: Option<&mut watch::Receiver<DaemonStatus>>,
        generation: u64,
    ) -> String {
        loop {
            let changed = async {
                match status.as_mut() {
                    Some(status) => status.changed().await.is_ok(),
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                event = rx.recv() => match event {
                    Some(ClientEvent::Telegram(telegram)) => {
                        if self.events.send(LinkEvent::Telegram(telegram)).await.is_err() {
                            return "bridge stopped".to_string();
                        }
                    },
                    Some(ClientEvent::Disconnected(reason)) => {
                        warn!("[FAIL] knxd connection lost: {}", reason);
                        if let Some(daemon) = &self.daemon {
                            daemon.report_disconnect(reason.clone());
                        }
                        return reason;
                    },
                    None => return "client closed".to_string(),
                },
                alive = changed => {
                    if !alive {
                        return "daemon manager stopped".to_string();
                    }
                    let Some(status) = status.as_mut() else { continue };
                    let current = status.borrow().clone();
                    if current.reconnect_generation != generation {
                        info!("knxd restarted, reconnecting");
                        return "daemon restarted".to_string();
                    }
                    if !current.state.accepts_clients() {
                        return format!("daemon {}", current.state);
                    }
                },
            }
        }
    }
}

/// Block until knxd accepts clients; `None` on cancellation
async fn wait_until_ready(
    status: &mut watch::Receiver<DaemonStatus>,
    cancel: &CancellationToken,
) -> Option<u64> {
    loop {
        {
            let current = status.borrow_and_update();
            if current.state.accepts_clients() {
                return Some(current.reconnect_generation);
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return None,
            changed = status.changed() => {
                if changed.is_err() {
                    // Manager gone; nothing will ever become ready
                    cancel.cancelled().await;
                    return None;
                }
            },
        }
    }
}
