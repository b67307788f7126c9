//! Error handling for the KNX bridge service

use errors::{ErrorCategory, VoltageError, VoltageErrorTrait};
use thiserror::Error;
use voltage_knx::{AddressError, DptError, FrameError};

/// KNX bridge service error type
#[derive(Error, Debug, Clone)]
pub enum KnxSrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    Io(String),

    /// knxd protocol and telegram framing errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection establishment and maintenance errors
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not connected to knxd")]
    NotConnected,

    /// Data handling errors (serialization, DPT conversion, parsing)
    #[error("Data error: {0}")]
    Data(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Device repository errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device already exists: {0}")]
    DeviceExists(String),

    /// Unknown command or request action
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Command targets a function whose flags do not permit writing
    #[error("Write rejected: function '{function}' on device '{device}' is not writable")]
    WriteRejected { device: String, function: String },

    /// Device has no address for the requested function
    #[error("Function '{function}' not configured on device '{device}'")]
    NotConfigured { device: String, function: String },

    /// Daemon lifecycle state machine refused a transition
    #[error("Invalid daemon state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Message bus errors
    #[error("Message bus error: {0}")]
    Bus(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for the KNX bridge service
pub type Result<T> = std::result::Result<T, KnxSrvError>;

impl KnxSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        KnxSrvError::Config(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        KnxSrvError::Protocol(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        KnxSrvError::Connection(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        KnxSrvError::Data(msg.into())
    }

    pub fn invalid_command(msg: impl Into<String>) -> Self {
        KnxSrvError::InvalidCommand(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        KnxSrvError::Storage(msg.into())
    }

    pub fn bus(msg: impl Into<String>) -> Self {
        KnxSrvError::Bus(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        KnxSrvError::Internal(msg.into())
    }

    pub fn device_not_found(id: impl std::fmt::Display) -> Self {
        KnxSrvError::DeviceNotFound(id.to_string())
    }

    pub fn write_rejected(device: impl Into<String>, function: impl Into<String>) -> Self {
        KnxSrvError::WriteRejected {
            device: device.into(),
            function: function.into(),
        }
    }

    pub fn not_configured(device: impl Into<String>, function: impl Into<String>) -> Self {
        KnxSrvError::NotConfigured {
            device: device.into(),
            function: function.into(),
        }
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for KnxSrvError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => KnxSrvError::Connection(err.to_string()),
            std::io::ErrorKind::TimedOut => KnxSrvError::Timeout(err.to_string()),
            _ => KnxSrvError::Io(err.to_string()),
        }
    }
}

impl From<FrameError> for KnxSrvError {
    fn from(err: FrameError) -> Self {
        KnxSrvError::Protocol(err.to_string())
    }
}

impl From<DptError> for KnxSrvError {
    fn from(err: DptError) -> Self {
        KnxSrvError::Data(err.to_string())
    }
}

impl From<AddressError> for KnxSrvError {
    fn from(err: AddressError) -> Self {
        KnxSrvError::Data(err.to_string())
    }
}

impl From<serde_json::Error> for KnxSrvError {
    fn from(err: serde_json::Error) -> Self {
        KnxSrvError::Data(format!("JSON: {err}"))
    }
}

impl From<serde_yaml::Error> for KnxSrvError {
    fn from(err: serde_yaml::Error) -> Self {
        KnxSrvError::Config(format!("YAML: {err}"))
    }
}

impl From<figment::Error> for KnxSrvError {
    fn from(err: figment::Error) -> Self {
        KnxSrvError::Config(err.to_string())
    }
}

impl From<sqlx::Error> for KnxSrvError {
    fn from(err: sqlx::Error) -> Self {
        KnxSrvError::Storage(err.to_string())
    }
}

impl From<redis::RedisError> for KnxSrvError {
    fn from(err: redis::RedisError) -> Self {
        KnxSrvError::Bus(format!("Redis: {err}"))
    }
}

impl From<rumqttc::ClientError> for KnxSrvError {
    fn from(err: rumqttc::ClientError) -> Self {
        KnxSrvError::Bus(format!("MQTT: {err}"))
    }
}

impl From<anyhow::Error> for KnxSrvError {
    fn from(err: anyhow::Error) -> Self {
        KnxSrvError::Internal(format!("{err:#}"))
    }
}

impl From<tokio::time::error::Elapsed> for KnxSrvError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        KnxSrvError::Timeout(err.to_string())
    }
}

// ============================================================================
// Extension trait for adding context to errors
// ============================================================================

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    fn connection_error(self, msg: &str) -> Result<T>;
    fn data_error(self, msg: &str) -> Result<T>;
    fn storage_error(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn connection_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| KnxSrvError::Connection(format!("{msg}: {e}")))
    }

    fn data_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| KnxSrvError::Data(format!("{msg}: {e}")))
    }

    fn storage_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| KnxSrvError::Storage(format!("{msg}: {e}")))
    }
}

// ============================================================================
// Conversion from KnxSrvError to VoltageError for the binary boundary
// ============================================================================

impl From<KnxSrvError> for VoltageError {
    fn from(err: KnxSrvError) -> Self {
        match err {
            KnxSrvError::Config(msg) => VoltageError::Configuration(msg),
            KnxSrvError::Io(msg) => VoltageError::Io(std::io::Error::other(msg)),
            KnxSrvError::Protocol(msg) => VoltageError::Protocol {
                protocol: "knx".to_string(),
                message: msg,
            },
            KnxSrvError::Connection(msg) => VoltageError::Communication(msg),
            KnxSrvError::NotConnected => VoltageError::Communication("knxd not connected".into()),
            KnxSrvError::Data(msg) => VoltageError::Validation(msg),
            KnxSrvError::Timeout(msg) => VoltageError::Timeout(msg),
            KnxSrvError::Storage(msg) => VoltageError::Database(msg),
            KnxSrvError::DeviceNotFound(id) => VoltageError::NotFound {
                resource: format!("Device: {}", id),
            },
            KnxSrvError::DeviceExists(id) => VoltageError::AlreadyExists(format!("Device: {}", id)),
            KnxSrvError::InvalidCommand(msg) => VoltageError::Validation(msg),
            e @ KnxSrvError::WriteRejected { .. } => VoltageError::Forbidden(e.to_string()),
            e @ KnxSrvError::NotConfigured { .. } => VoltageError::NotFound {
                resource: e.to_string(),
            },
            e @ KnxSrvError::InvalidTransition { .. } => VoltageError::Internal(e.to_string()),
            KnxSrvError::Bus(msg) => VoltageError::MessageBus(msg),
            KnxSrvError::Internal(msg) => VoltageError::Internal(msg),
        }
    }
}

impl VoltageErrorTrait for KnxSrvError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "KNXSRV_CONFIG_ERROR",
            Self::Io(_) => "KNXSRV_IO_ERROR",
            Self::Protocol(_) => "KNXSRV_PROTOCOL_ERROR",
            Self::Connection(_) => "KNXSRV_CONNECTION_ERROR",
            Self::NotConnected => "KNXSRV_NOT_CONNECTED",
            Self::Data(_) => "KNXSRV_DATA_ERROR",
            Self::Timeout(_) => "KNXSRV_TIMEOUT",
            Self::Storage(_) => "KNXSRV_STORAGE_ERROR",
            Self::DeviceNotFound(_) => "KNXSRV_DEVICE_NOT_FOUND",
            Self::DeviceExists(_) => "KNXSRV_DEVICE_EXISTS",
            Self::InvalidCommand(_) => "KNXSRV_INVALID_COMMAND",
            Self::WriteRejected { .. } => "KNXSRV_WRITE_REJECTED",
            Self::NotConfigured { .. } => "KNXSRV_NOT_CONFIGURED",
            Self::InvalidTransition { .. } => "KNXSRV_INVALID_TRANSITION",
            Self::Bus(_) => "KNXSRV_BUS_ERROR",
            Self::Internal(_) => "KNXSRV_INTERNAL_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Io(_) => ErrorCategory::Internal,
            Self::Protocol(_) => ErrorCategory::Protocol,
            Self::Connection(_) | Self::NotConnected => ErrorCategory::Connection,
            Self::Data(_) | Self::InvalidCommand(_) => ErrorCategory::Validation,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Storage(_) => ErrorCategory::Database,
            Self::DeviceNotFound(_) | Self::NotConfigured { .. } => ErrorCategory::NotFound,
            Self::WriteRejected { .. } => ErrorCategory::Permission,
            Self::DeviceExists(_) | Self::InvalidTransition { .. } => ErrorCategory::Conflict,
            Self::Bus(_) => ErrorCategory::Network,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }
}
