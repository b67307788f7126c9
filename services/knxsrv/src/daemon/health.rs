//! Layered knxd health probes
//!
//! The process layer lives with the process controller; this module covers the
//! network-facing layers. Each probe opens its own short-lived connection so a
//! hung bridge connection can't mask a healthy daemon (or the reverse).

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::debug;
use voltage_knx::frame::{EIB_APDU_PACKET, EIB_OPEN_T_GROUP};
use voltage_knx::{GroupAddress, KnxdFrame};

use super::client::{open_group_socket, Endpoint};
use super::codec::KnxdCodec;
use super::state::HealthLayer;

/// Group addresses tried per bus check
pub const BUS_CHECK_CANDIDATES: usize = 5;

/// Frames inspected while waiting for a read response
const MAX_BUS_CHECK_FRAMES: usize = 100;

/// Pause between opening the group transport and sending the read
const T_GROUP_SETTLE: Duration = Duration::from_millis(200);

/// A failed health layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthFailure {
    pub layer: HealthLayer,
    /// `false` when restarting knxd cannot help (interface unplugged)
    pub recoverable: bool,
    pub message: String,
}

impl HealthFailure {
    pub fn new(layer: HealthLayer, message: impl Into<String>) -> Self {
        Self {
            layer,
            recoverable: true,
            message: message.into(),
        }
    }

    pub fn unrecoverable(layer: HealthLayer, message: impl Into<String>) -> Self {
        Self {
            layer,
            recoverable: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for HealthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.layer, self.message)
    }
}

impl std::error::Error for HealthFailure {}

pub type CheckResult = std::result::Result<(), HealthFailure>;

/// Supplies group addresses known to answer reads
pub trait GroupAddressProvider: Send + Sync {
    /// Best candidates first
    fn health_check_addresses(&self, limit: usize) -> Vec<GroupAddress>;

    /// Rotate `ga` to the back of the candidate order
    fn mark_health_check_used(&self, ga: GroupAddress);
}

/// Transport, handshake and bus layers
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check_transport(&self) -> CheckResult;

    async fn check_handshake(&self) -> CheckResult;

    async fn check_bus(&self) -> CheckResult;

    /// Run the three layers in order, stopping at the first failure
    async fn check_all(&self) -> CheckResult {
        self.check_transport().await?;
        self.check_handshake().await?;
        self.check_bus().await
    }
}

/// Probe against a real knxd listener
pub struct KnxdProbe {
    endpoint: Endpoint,
    timeout: Duration,
    pinned: Option<GroupAddress>,
    provider: RwLock<Option<Arc<dyn GroupAddressProvider>>>,
}

impl KnxdProbe {
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Self {
        Self {
            endpoint,
            timeout,
            pinned: None,
            provider: RwLock::new(None),
        }
    }

    /// Always try `ga` first
    pub fn with_pinned_address(mut self, ga: Option<GroupAddress>) -> Self {
        self.pinned = ga;
        self
    }

    pub fn set_address_provider(&self, provider: Arc<dyn GroupAddressProvider>) {
        *self.provider.write() = Some(provider);
    }

    fn candidates(&self) -> Vec<GroupAddress> {
        let mut out: Vec<GroupAddress> = self.pinned.into_iter().collect();
        let provider = self.provider.read().clone();
        if let Some(provider) = provider {
            for ga in provider.health_check_addresses(BUS_CHECK_CANDIDATES) {
                if !out.contains(&ga) {
                    out.push(ga);
                }
            }
        }
        out.truncate(BUS_CHECK_CANDIDATES);
        out
    }

    /// One group read over a dedicated T_Group connection
    async fn read_group_address(&self, ga: GroupAddress) -> Result<(), String> {
        let deadline = Instant::now() + self.timeout;
        let stream = self
            .endpoint
            .connect(self.timeout)
            .await
            .map_err(|e| format!("connect failed: {}", e))?;
        let mut framed = Framed::new(stream, KnxdCodec);

        framed
            .send(KnxdFrame::open_t_group(ga))
            .await
            .map_err(|e| format!("write T_Group open failed: {}", e))?;
        match tokio::time::timeout_at(deadline, framed.next()).await {
            Ok(Some(Ok(frame))) if frame.msg_type == EIB_OPEN_T_GROUP => {},
            Ok(Some(Ok(frame))) => {
                return Err(format!(
                    "unexpected T_Group reply 0x{:04X}",
                    frame.msg_type
                ))
            },
            Ok(Some(Err(e))) => return Err(format!("read T_Group reply failed: {}", e)),
            Ok(None) => return Err("connection closed during T_Group open".to_string()),
            Err(_) => return Err(format!("timeout opening T_Group for {}", ga)),
        }

        tokio::time::sleep(T_GROUP_SETTLE).await;
        framed
            .send(KnxdFrame::apdu_group_read())
            .await
            .map_err(|e| format!("write group read failed: {}", e))?;
        debug!("Bus check: read sent to {}", ga);

        for _ in 0..MAX_BUS_CHECK_FRAMES {
            let frame = match tokio::time::timeout_at(deadline, framed.next()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => return Err(format!("read response failed: {}", e)),
                Ok(None) => return Err("connection closed while waiting".to_string()),
                Err(_) => {
                    return Err(format!(
                        "no response from {} within {:?}",
                        ga, self.timeout
                    ))
                },
            };
            // T_Group APDU: src(2) + apdu(2+); response APCI in the 4th byte
            if frame.msg_type == EIB_APDU_PACKET
                && frame.payload.len() >= 4
                && frame.payload[3] & 0xC0 == 0x40
            {
                debug!("Bus check: {} answered", ga);
                return Ok(());
            }
        }
        Err(format!(
            "no response from {} after {} packets",
            ga, MAX_BUS_CHECK_FRAMES
        ))
    }
}

#[async_trait]
impl HealthProbe for KnxdProbe {
    async fn check_transport(&self) -> CheckResult {
        self.endpoint
            .connect(self.timeout)
            .await
            .map(|_| ())
            .map_err(|e| HealthFailure::new(HealthLayer::Transport, e.to_string()))
    }

    async fn check_handshake(&self) -> CheckResult {
        let stream = self
            .endpoint
            .connect(self.timeout)
            .await
            .map_err(|e| HealthFailure::new(HealthLayer::Transport, e.to_string()))?;
        let mut framed = open_group_socket(stream, self.timeout)
            .await
            .map_err(|e| HealthFailure::new(HealthLayer::Handshake, e.to_string()))?;
        let _ = framed.send(KnxdFrame::close()).await;
        Ok(())
    }

    async fn check_bus(&self) -> CheckResult {
        let candidates = self.candidates();
        if candidates.is_empty() {
            // Nothing learned yet; the bus layer can't be judged
            debug!("Bus check skipped: no candidate group addresses");
            return Ok(());
        }

        let mut last_error = String::new();
        for ga in &candidates {
            match self.read_group_address(*ga).await {
                Ok(()) => {
                    if let Some(provider) = self.provider.read().clone() {
                        provider.mark_health_check_used(*ga);
                    }
                    return Ok(());
                },
                Err(e) => {
                    debug!("Bus check via {} failed: {}", ga, e);
                    last_error = e;
                },
            }
        }
        Err(HealthFailure::new(
            HealthLayer::Bus,
            format!(
                "all {} group addresses unresponsive: {}",
                candidates.len(),
                last_error
            ),
        ))
    }
}
