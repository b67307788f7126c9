//! Passive bus monitor connection
//!
//! A second knxd connection in virtual bus monitor mode. knxd forwards every
//! L_Data frame on the bus, individually addressed traffic included, which
//! the group socket never sees. Decoded frames go to a [`BusObserver`].
//!
//! Like the group client, the monitor waits for the daemon manager to report
//! knxd ready and reconnects after a delay when the connection ends.

use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voltage_knx::frame::EIB_VBUSMONITOR_PACKET;
use voltage_knx::{KnxdFrame, LDataFrame};

use super::client::{open_connection, Endpoint, KnxdStream};
use super::manager::DaemonHandle;
use super::state::DaemonStatus;
use crate::config::ClientConfig;
use crate::error::Result;

/// Receives every frame the monitor decodes
pub trait BusObserver: Send + Sync {
    fn observe(&self, frame: &LDataFrame);
}

pub struct BusMonitor {
    url: String,
    config: ClientConfig,
    observer: Arc<dyn BusObserver>,
    daemon: Option<DaemonHandle>,
    retry_delay: Duration,
    frames: AtomicU64,
    errors: AtomicU64,
}

impl BusMonitor {
    pub fn new(
        url: impl Into<String>,
        config: ClientConfig,
        observer: Arc<dyn BusObserver>,
        daemon: Option<DaemonHandle>,
    ) -> Self {
        Self {
            url: url.into(),
            config,
            observer,
            daemon,
            retry_delay: Duration::from_secs(10),
            frames: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Frames decoded and handed to the observer
    pub fn frames_seen(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Connect/reconnect loop; returns on cancellation
    pub async fn run(self, cancel: CancellationToken) {
        let mut status = self.daemon.as_ref().map(DaemonHandle::subscribe);

        loop {
            if let Some(rx) = status.as_mut() {
                if !wait_until_ready(rx, &cancel).await {
                    break;
                }
            }

            let result = match Endpoint::parse(&self.url) {
                Ok(endpoint) => match endpoint.connect(self.config.connect_timeout()).await {
                    Ok(stream) => self.watch(stream, &cancel).await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            match result {
                Ok(()) if cancel.is_cancelled() => break,
                Ok(()) => warn!("Bus monitor connection closed by knxd"),
                Err(e) => warn!("Bus monitor on {} failed: {}", self.url, e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.retry_delay) => {},
            }
        }
        debug!(
            "Bus monitor stopped after {} frames ({} undecodable)",
            self.frames_seen(),
            self.decode_errors()
        );
    }

    /// Open monitor mode on `stream` and feed frames to the observer until
    /// knxd closes it or `cancel` fires
    pub async fn watch<S>(&self, stream: S, cancel: &CancellationToken) -> Result<()>
    where
        S: KnxdStream,
    {
        let mut framed = open_connection(
            stream,
            KnxdFrame::open_vbusmonitor(),
            self.config.connect_timeout(),
        )
        .await?;
        info!("[OK] Bus monitor opened on {}", self.url);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = framed.next() => next,
            };
            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            };
            if frame.msg_type != EIB_VBUSMONITOR_PACKET {
                debug!("Bus monitor ignoring message type 0x{:04X}", frame.msg_type);
                continue;
            }
            match LDataFrame::decode(&frame.payload) {
                Ok(ldata) => {
                    self.frames.fetch_add(1, Ordering::Relaxed);
                    self.observer.observe(&ldata);
                },
                Err(e) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    debug!("Dropped monitor frame {:02X?}: {}", frame.payload, e);
                },
            }
        }
    }
}

/// Block until knxd accepts clients; false on cancellation
async fn wait_until_ready(
    status: &mut watch::Receiver<DaemonStatus>,
    cancel: &CancellationToken,
) -> bool {
    loop {
        if status.borrow_and_update().state.accepts_clients() {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            changed = status.changed() => {
                if changed.is_err() {
                    cancel.cancelled().await;
                    return false;
                }
            },
        }
    }
}
