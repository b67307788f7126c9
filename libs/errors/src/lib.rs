//! Shared error types for the bridge workspace
//!
//! Library code keeps its own error enum per service. [`VoltageError`] is the
//! coarse form those enums collapse into when they reach `main`, and
//! [`VoltageErrorTrait`] gives both levels one classification scheme.

use thiserror::Error;

/// Process-level error returned by service binaries
#[derive(Debug, Error)]
pub enum VoltageError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Protocol error: {protocol}: {message}")]
    Protocol { protocol: String, message: String },

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Message bus error: {0}")]
    MessageBus(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Permission denied: {0}")]
    Forbidden(String),

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type VoltageResult<T> = Result<T, VoltageError>;

impl VoltageError {
    /// Exit status for `main`; 2 marks a bad configuration, 1 anything else
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Configuration | ErrorCategory::Validation => 2,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for VoltageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("Malformed JSON: {}", err))
    }
}

impl From<serde_yaml::Error> for VoltageError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration(format!("Malformed YAML: {}", err))
    }
}

#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::VoltageError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::VoltageError::Configuration(format!($fmt, $($arg)*))
    };
}

impl VoltageErrorTrait for VoltageError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Communication(_) => "COMMUNICATION_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::MessageBus(_) => "MESSAGE_BUS_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::Io(_) => "IO_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Other(_) => "OTHER_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Database(_) => ErrorCategory::Database,
            Self::Protocol { .. } => ErrorCategory::Protocol,
            Self::Communication(_) => ErrorCategory::Connection,
            Self::MessageBus(_) => ErrorCategory::Network,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Forbidden(_) => ErrorCategory::Permission,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::AlreadyExists(_) => ErrorCategory::Conflict,
            Self::Io(_) | Self::Internal(_) => ErrorCategory::Internal,
            Self::Other(_) => ErrorCategory::Unknown,
        }
    }
}

/// Coarse error classification used for retry decisions and log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Database,
    Network,
    Timeout,
    Validation,
    NotFound,
    Conflict,
    Permission,
    /// Malformed frames or payloads from the field bus
    Protocol,
    /// Field bus link down or unreachable
    Connection,
    Internal,
    Unknown,
}

/// Classification interface shared by every service error type
pub trait VoltageErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Stable machine-readable code
    fn error_code(&self) -> &'static str;

    fn category(&self) -> ErrorCategory;

    /// Transient failures worth another attempt
    fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::Connection
        )
    }

    fn log_level(&self) -> tracing::Level {
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::Database => tracing::Level::ERROR,
            ErrorCategory::Validation | ErrorCategory::NotFound => tracing::Level::INFO,
            _ => tracing::Level::WARN,
        }
    }
}
