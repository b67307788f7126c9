//! Service configuration
//!
//! Loaded from `config/knxsrv.yaml` merged with `KNXSRV_`-prefixed environment
//! variables. Every field has a default, so an empty file is a valid config.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::daemon::args;
use crate::error::{KnxSrvError, Result};
use voltage_knx::GroupAddress;

/// Environment variable prefix (`KNXSRV_KNXD__TCP_PORT=6721`)
pub const ENV_PREFIX: &str = "KNXSRV_";

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "config/knxsrv.yaml";

/// Default knxd TCP port
pub const DEFAULT_KNXD_PORT: u16 = 6720;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KnxSrvConfig {
    pub service: ServiceConfig,
    pub knxd: KnxdConfig,
    pub client: ClientConfig,
    pub bus: BusConfig,
    pub storage: StorageConfig,
}

impl KnxSrvConfig {
    /// Load from file + environment
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = common::load_config(path, ENV_PREFIX)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.service.validate()?;
        self.knxd.validate()?;
        self.client.validate()?;
        self.bus.validate()?;
        if self.storage.sqlite_path.trim().is_empty() {
            return Err(KnxSrvError::config("storage.sqlite_path must not be empty"));
        }
        Ok(())
    }

    /// URL the bridge connects to; follows the managed daemon's listener
    pub fn connection_url(&self) -> String {
        if self.knxd.managed {
            self.knxd.connection_url()
        } else {
            self.client.url.clone()
        }
    }
}

// ============================================================================
// Service
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Identifier reported in health messages
    pub bridge_id: String,
    /// Optional prefix prepended to every bus topic (`graylogic` → `graylogic/state/knx/...`)
    pub topic_prefix: String,
    /// Health publish interval in seconds
    pub health_interval_secs: u64,
    /// Discovery publish interval in seconds (0 disables periodic publish)
    pub discovery_interval_secs: u64,
    /// Read all readable addresses after the first knxd connection
    pub read_on_startup: bool,
    /// Delay between consecutive group reads in milliseconds
    pub read_spacing_ms: u64,
    /// Open a second knxd connection in bus monitor mode for device discovery
    pub bus_monitor: bool,
    pub log_dir: String,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bridge_id: "knx-bridge".to_string(),
            topic_prefix: String::new(),
            health_interval_secs: 30,
            discovery_interval_secs: 300,
            read_on_startup: true,
            read_spacing_ms: 50,
            bus_monitor: true,
            log_dir: "logs".to_string(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl ServiceConfig {
    fn validate(&self) -> Result<()> {
        if self.bridge_id.trim().is_empty() {
            return Err(KnxSrvError::config("service.bridge_id must not be empty"));
        }
        if self.health_interval_secs == 0 {
            return Err(KnxSrvError::config("service.health_interval_secs must be > 0"));
        }
        if self.topic_prefix.contains(['+', '#']) {
            return Err(KnxSrvError::config(
                "service.topic_prefix must not contain MQTT wildcards",
            ));
        }
        Ok(())
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn read_spacing(&self) -> Duration {
        Duration::from_millis(self.read_spacing_ms)
    }
}

// ============================================================================
// knxd daemon
// ============================================================================

/// How knxd reaches the KNX bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// USB interface
    #[default]
    Usb,
    /// KNX/IP tunnelling to a gateway
    #[serde(alias = "ipt")]
    IpTunnel,
    /// KNX/IP routing (multicast)
    #[serde(alias = "ip")]
    IpRouting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnxdConfig {
    /// Spawn and supervise knxd; when false an external knxd is expected
    pub managed: bool,
    pub binary: String,
    /// knxd's own individual address (`-e`)
    pub physical_address: String,
    /// Client address pool `area.line.device:count` (`-E`)
    pub client_addresses: String,
    pub backend: BackendKind,
    /// USB device path (optional, knxd auto-detects otherwise)
    pub usb_device: Option<String>,
    /// 4-digit hex vendor id, used for presence checks and resets
    pub usb_vendor_id: Option<String>,
    pub usb_product_id: Option<String>,
    /// IP tunnel gateway host
    pub tunnel_host: Option<String>,
    pub tunnel_port: u16,
    pub multicast_address: String,
    pub multicast_interface: Option<String>,
    pub tcp_port: u16,
    pub unix_socket: Option<String>,
    /// Initial restart delay in seconds; doubles per attempt up to `max_restart_delay_secs`
    pub restart_delay_secs: u64,
    pub max_restart_delay_secs: u64,
    /// Restarts before the daemon is declared permanently degraded (0 = unlimited)
    pub max_restart_attempts: u32,
    pub graceful_timeout_secs: u64,
    pub health_interval_secs: u64,
    pub health_timeout_secs: u64,
    /// Consecutive handshake/bus failures before escalating to a restart
    pub escalate_after: u32,
    pub ready_timeout_secs: u64,
    pub usb_reset_on_retry: bool,
    pub usb_reset_on_bus_failure: bool,
    /// knxd group cache (`-c`)
    pub group_cache: bool,
    /// knxd error level 0-9 (`-f`)
    pub log_level: u8,
    /// knxd trace mask (`-t`)
    pub trace_flags: u32,
    pub pid_file: Option<String>,
}

impl Default for KnxdConfig {
    fn default() -> Self {
        Self {
            managed: true,
            binary: "/usr/bin/knxd".to_string(),
            physical_address: "0.0.1".to_string(),
            client_addresses: "0.0.2:8".to_string(),
            backend: BackendKind::Usb,
            usb_device: None,
            usb_vendor_id: None,
            usb_product_id: None,
            tunnel_host: None,
            tunnel_port: 3671,
            multicast_address: "224.0.23.12".to_string(),
            multicast_interface: None,
            tcp_port: DEFAULT_KNXD_PORT,
            unix_socket: Some("/tmp/eib".to_string()),
            restart_delay_secs: 5,
            max_restart_delay_secs: 300,
            max_restart_attempts: 10,
            graceful_timeout_secs: 10,
            health_interval_secs: 30,
            health_timeout_secs: 3,
            escalate_after: 3,
            ready_timeout_secs: 30,
            usb_reset_on_retry: false,
            usb_reset_on_bus_failure: false,
            group_cache: false,
            log_level: 0,
            trace_flags: 0,
            pid_file: None,
        }
    }
}

impl KnxdConfig {
    pub fn validate(&self) -> Result<()> {
        if self.binary.trim().is_empty() {
            return Err(KnxSrvError::config("knxd.binary is required"));
        }
        args::validate_individual_address(&self.physical_address)
            .map_err(|e| KnxSrvError::config(format!("knxd.physical_address: {}", e)))?;
        args::validate_client_addresses(&self.client_addresses)
            .map_err(|e| KnxSrvError::config(format!("knxd.client_addresses: {}", e)))?;
        if self.tcp_port == 0 {
            return Err(KnxSrvError::config("knxd.tcp_port must be between 1 and 65535"));
        }
        if self.log_level > 9 {
            return Err(KnxSrvError::config("knxd.log_level must be between 0 and 9"));
        }
        if self.health_interval_secs == 0 || self.health_timeout_secs == 0 {
            return Err(KnxSrvError::config(
                "knxd health interval and timeout must be > 0",
            ));
        }
        if let Some(socket) = &self.unix_socket {
            args::validate_safe_path(socket, "knxd.unix_socket")?;
        }

        match self.backend {
            BackendKind::Usb => {
                if let Some(device) = &self.usb_device {
                    args::validate_safe_path(device, "knxd.usb_device")?;
                }
                for (value, field) in [
                    (&self.usb_vendor_id, "knxd.usb_vendor_id"),
                    (&self.usb_product_id, "knxd.usb_product_id"),
                ] {
                    if let Some(id) = value {
                        args::validate_usb_id(id, field)?;
                    }
                }
                let has_ids = self.usb_vendor_id.is_some() && self.usb_product_id.is_some();
                if (self.usb_reset_on_retry || self.usb_reset_on_bus_failure) && !has_ids {
                    return Err(KnxSrvError::config(
                        "USB reset options require knxd.usb_vendor_id and knxd.usb_product_id",
                    ));
                }
            },
            BackendKind::IpTunnel => {
                let host = self.tunnel_host.as_deref().unwrap_or("");
                if host.trim().is_empty() {
                    return Err(KnxSrvError::config(
                        "knxd.tunnel_host is required for ip_tunnel backend",
                    ));
                }
                args::validate_safe_path(host, "knxd.tunnel_host")?;
            },
            BackendKind::IpRouting => {
                let ip: std::net::Ipv4Addr = self.multicast_address.parse().map_err(|_| {
                    KnxSrvError::config(format!(
                        "knxd.multicast_address '{}' is not an IPv4 address",
                        self.multicast_address
                    ))
                })?;
                if !ip.is_multicast() {
                    return Err(KnxSrvError::config(format!(
                        "knxd.multicast_address '{}' is not a multicast address",
                        self.multicast_address
                    )));
                }
                if let Some(iface) = &self.multicast_interface {
                    args::validate_safe_path(iface, "knxd.multicast_interface")?;
                }
            },
        }
        Ok(())
    }

    pub fn connection_url(&self) -> String {
        format!("tcp://localhost:{}", self.tcp_port)
    }

    pub fn usb_id(&self) -> Option<String> {
        match (&self.usb_vendor_id, &self.usb_product_id) {
            (Some(vendor), Some(product)) if self.backend == BackendKind::Usb => {
                Some(format!("{}:{}", vendor, product))
            },
            _ => None,
        }
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn max_restart_delay(&self) -> Duration {
        Duration::from_secs(self.max_restart_delay_secs.max(self.restart_delay_secs))
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

// ============================================================================
// knxd client
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `tcp://host:port` or `unix:///path`; used when knxd is not managed
    pub url: String,
    pub connect_timeout_secs: u64,
    /// Timeout for individual sends
    pub send_timeout_secs: u64,
    /// Capacity of the inbound telegram queue
    pub queue_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: format!("tcp://localhost:{}", DEFAULT_KNXD_PORT),
            connect_timeout_secs: 10,
            send_timeout_secs: 5,
            queue_size: 1024,
        }
    }
}

impl ClientConfig {
    fn validate(&self) -> Result<()> {
        crate::daemon::client::Endpoint::parse(&self.url)?;
        if self.queue_size == 0 {
            return Err(KnxSrvError::config("client.queue_size must be > 0"));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

// ============================================================================
// Message bus
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    #[default]
    Mqtt,
    Redis,
    /// In-process bus, no external broker
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub kind: BusKind,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub qos: u8,
    pub redis_url: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::Mqtt,
            host: "localhost".to_string(),
            port: 1883,
            client_id: "knxsrv".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            qos: 1,
            redis_url: "redis://localhost:6379".to_string(),
        }
    }
}

impl BusConfig {
    fn validate(&self) -> Result<()> {
        if self.qos > 2 {
            return Err(KnxSrvError::config("bus.qos must be 0, 1 or 2"));
        }
        if self.kind == BusKind::Mqtt {
            if self.host.trim().is_empty() || self.port == 0 {
                return Err(KnxSrvError::config("bus.host and bus.port are required for mqtt"));
            }
            if self.keep_alive_secs < 5 {
                return Err(KnxSrvError::config("bus.keep_alive_secs must be >= 5"));
            }
        }
        if self.kind == BusKind::Redis && !self.redis_url.starts_with("redis://") {
            return Err(KnxSrvError::config("bus.redis_url must start with redis://"));
        }
        Ok(())
    }
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub sqlite_path: String,
    /// Group address that must answer reads; pinned ahead of discovered addresses
    pub health_check_address: Option<GroupAddress>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "data/knxsrv.db".to_string(),
            health_check_address: None,
        }
    }
}
