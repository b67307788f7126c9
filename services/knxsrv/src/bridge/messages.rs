//! Bus message payloads (JSON)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::daemon::DaemonStatus;
use crate::error::KnxSrvError;
use crate::registry::{DeviceState, PROTOCOL_KNX};

// ============================================================================
// Error codes carried by acks and responses
// ============================================================================

pub const DEVICE_UNREACHABLE: &str = "DEVICE_UNREACHABLE";
pub const INVALID_COMMAND: &str = "INVALID_COMMAND";
pub const INVALID_PARAMETERS: &str = "INVALID_PARAMETERS";
pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
pub const TIMEOUT: &str = "TIMEOUT";
pub const NOT_CONFIGURED: &str = "NOT_CONFIGURED";
pub const BRIDGE_ERROR: &str = "BRIDGE_ERROR";

/// Bus error code for a service error
pub fn error_code(err: &KnxSrvError) -> &'static str {
    match err {
        KnxSrvError::InvalidCommand(_) | KnxSrvError::WriteRejected { .. } => INVALID_COMMAND,
        KnxSrvError::Data(_) => INVALID_PARAMETERS,
        KnxSrvError::DeviceNotFound(_) | KnxSrvError::NotConfigured { .. } => NOT_CONFIGURED,
        KnxSrvError::Timeout(_) => TIMEOUT,
        KnxSrvError::NotConnected | KnxSrvError::Connection(_) | KnxSrvError::Io(_) => {
            DEVICE_UNREACHABLE
        },
        KnxSrvError::Protocol(_) => PROTOCOL_ERROR,
        _ => BRIDGE_ERROR,
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Inbound command on `command/knx/{ga}`
///
/// Either a named `command` (`on`, `dim`, ...) with `parameters`, or a raw
/// `function` + `value` write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub device_id: String,
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl CommandMessage {
    /// Named command
    pub fn named(device_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            command: command.into(),
            ..Default::default()
        }
    }

    /// Raw function write
    pub fn write(device_id: impl Into<String>, function: impl Into<String>, value: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            function: Some(function.into()),
            value: Some(value),
            ..Default::default()
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Accepted,
    Queued,
    Failed,
    Timeout,
}

/// Whether the bus will report back the effect of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confirmation {
    /// A status address exists; a state message follows when the device reports
    Pending,
    /// Delivered to the bus but nothing will confirm it
    Unverified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

/// Published on `ack/knx/{ga}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckMessage {
    pub command_id: String,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub status: AckStatus,
    pub protocol: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<Confirmation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AckError>,
}

impl AckMessage {
    pub fn accepted(cmd: &CommandMessage, address: String, confirmation: Confirmation) -> Self {
        Self {
            command_id: cmd.id.clone(),
            timestamp: Utc::now(),
            device_id: cmd.device_id.clone(),
            status: AckStatus::Accepted,
            protocol: PROTOCOL_KNX.to_string(),
            address,
            confirmation: Some(confirmation),
            error: None,
        }
    }

    /// Failure ack; a `TIMEOUT` code reports status `timeout`
    pub fn failed(
        cmd: &CommandMessage,
        address: String,
        code: &str,
        message: impl Into<String>,
    ) -> Self {
        let status = if code == TIMEOUT {
            AckStatus::Timeout
        } else {
            AckStatus::Failed
        };
        Self {
            command_id: cmd.id.clone(),
            timestamp: Utc::now(),
            device_id: cmd.device_id.clone(),
            status,
            protocol: PROTOCOL_KNX.to_string(),
            address,
            confirmation: None,
            error: Some(AckError {
                code: code.to_string(),
                message: message.into(),
                retries: None,
            }),
        }
    }
}

// ============================================================================
// State
// ============================================================================

/// Published retained on `state/knx/{ga}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub state: DeviceState,
    pub protocol: String,
    pub address: String,
}

impl StateMessage {
    pub fn new(device_id: impl Into<String>, address: String, state: DeviceState) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: Utc::now(),
            state,
            protocol: PROTOCOL_KNX.to_string(),
            address,
        }
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
    Starting,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub status: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeStatistics {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub errors: u64,
    pub commands_processed: u64,
    pub commands_failed: u64,
}

/// Published retained on `health/knx`
#[derive(Debug, Clone, Serialize)]
pub struct HealthMessage {
    pub bridge: String,
    pub timestamp: DateTime<Utc>,
    pub status: BridgeStatus,
    pub version: String,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daemon: Option<DaemonStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<BridgeStatistics>,
    pub devices_managed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ============================================================================
// Requests
// ============================================================================

/// Inbound request on `request/knx/{id}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Published on `response/knx/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl ResponseMessage {
    pub fn ok(request_id: &str, data: Map<String, Value>) -> Self {
        Self {
            request_id: request_id.to_string(),
            timestamp: Utc::now(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(request_id: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            timestamp: Utc::now(),
            success: false,
            data: None,
            error: Some(ResponseError {
                code: code.to_string(),
                message: message.into(),
                details: None,
            }),
        }
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// A group address seen on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedAddress {
    pub address: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub message_count: u64,
    /// Some device answered a read on this address
    pub has_read_response: bool,
    pub sources: Vec<String>,
    /// Already mapped to a registry device
    pub modeled: bool,
}

/// A physical device seen sending telegrams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedDevice {
    pub individual_address: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub message_count: u64,
    pub group_addresses: Vec<String>,
}

/// Published retained on `discovery/knx`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    pub bridge: String,
    pub timestamp: DateTime<Utc>,
    pub group_addresses: Vec<ObservedAddress>,
    pub devices: Vec<ObservedDevice>,
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_message_parses_both_forms() {
        let named: CommandMessage = serde_json::from_value(json!({
            "id": "c1",
            "device_id": "light-1",
            "command": "dim",
            "parameters": {"level": 40},
            "source": "ui"
        }))
        .unwrap();
        assert_eq!(named.command, "dim");
        assert_eq!(named.parameters["level"], json!(40));
        assert!(named.function.is_none());

        let raw: CommandMessage = serde_json::from_value(json!({
            "id": "c2",
            "device_id": "light-1",
            "function": "brightness",
            "value": 75
        }))
        .unwrap();
        assert_eq!(raw.command, "");
        assert_eq!(raw.function.as_deref(), Some("brightness"));
        assert_eq!(raw.value, Some(json!(75)));
    }

    #[test]
    fn test_failed_ack_timeout_status() {
        let cmd = CommandMessage::named("blind-1", "stop");
        let ack = AckMessage::failed(&cmd, String::new(), TIMEOUT, "no answer");
        assert_eq!(ack.status, AckStatus::Timeout);

        let ack = AckMessage::failed(&cmd, "1/0/1".into(), NOT_CONFIGURED, "nope");
        assert_eq!(ack.status, AckStatus::Failed);
        let value = serde_json::to_value(&ack).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["protocol"], "knx");
        assert_eq!(value["error"]["code"], "NOT_CONFIGURED");
        assert!(value.get("confirmation").is_none());
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            error_code(&KnxSrvError::write_rejected("d", "f")),
            INVALID_COMMAND
        );
        assert_eq!(error_code(&KnxSrvError::data("level")), INVALID_PARAMETERS);
        assert_eq!(error_code(&KnxSrvError::device_not_found("d")), NOT_CONFIGURED);
        assert_eq!(error_code(&KnxSrvError::NotConnected), DEVICE_UNREACHABLE);
        assert_eq!(error_code(&KnxSrvError::Timeout("t".into())), TIMEOUT);
        assert_eq!(error_code(&KnxSrvError::bus("down")), BRIDGE_ERROR);
    }

    #[test]
    fn test_response_serialization() {
        let mut data = Map::new();
        data.insert("reads_sent".into(), json!(3));
        let value = serde_json::to_value(ResponseMessage::ok("r1", data)).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["data"]["reads_sent"], 3);
        assert!(value.get("error").is_none());
    }
}
