//! Device model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use voltage_knx::{infer_dpt, infer_flags, Dpt, FunctionFlags, GroupAddress};

pub const PROTOCOL_KNX: &str = "knx";

/// Device state snapshot: state field → value
pub type DeviceState = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Lighting,
    Climate,
    Blinds,
    Audio,
    Video,
    Security,
    Access,
    Energy,
    Plant,
    Irrigation,
    Safety,
    Sensor,
    /// Power supplies, couplers, interfaces; never polled
    Infrastructure,
}

impl Domain {
    pub const fn as_str(self) -> &'static str {
        match self {
            Domain::Lighting => "lighting",
            Domain::Climate => "climate",
            Domain::Blinds => "blinds",
            Domain::Audio => "audio",
            Domain::Video => "video",
            Domain::Security => "security",
            Domain::Access => "access",
            Domain::Energy => "energy",
            Domain::Plant => "plant",
            Domain::Irrigation => "irrigation",
            Domain::Safety => "safety",
            Domain::Sensor => "sensor",
            Domain::Infrastructure => "infrastructure",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown domain '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Online,
    Offline,
    Degraded,
    #[default]
    Unknown,
}

impl HealthStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Online => "online",
            HealthStatus::Offline => "offline",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown health status '{}'", s))
    }
}

/// One entry of a device's address map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionAddress {
    pub ga: GroupAddress,
    /// Missing on legacy imports; filled from the function registry at load
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpt: Option<Dpt>,
    #[serde(default)]
    pub flags: FunctionFlags,
}

impl FunctionAddress {
    pub fn new(ga: GroupAddress, dpt: Dpt, flags: FunctionFlags) -> Self {
        Self {
            ga,
            dpt: Some(dpt),
            flags,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.flags.write
    }

    pub fn is_readable(&self) -> bool {
        self.flags.read
    }
}

/// Protocol-specific address map
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceAddress {
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionAddress>,
}

impl DeviceAddress {
    /// Fill missing DPTs and empty flags from the function registry
    ///
    /// Returns true when anything changed. Entries whose DPT can't be
    /// inferred are left as they are.
    pub fn migrate(&mut self) -> bool {
        let mut changed = false;
        for (name, entry) in self.functions.iter_mut() {
            if entry.dpt.is_none() {
                if let Some(dpt) = infer_dpt(name) {
                    entry.dpt = Some(dpt);
                    changed = true;
                }
            }
            if entry.flags.is_empty() {
                entry.flags = infer_flags(name);
                changed = true;
            }
        }
        changed
    }

    /// Functions whose DPT is still unknown after migration
    pub fn unresolved(&self) -> Vec<&str> {
        self.functions
            .iter()
            .filter(|(_, entry)| entry.dpt.is_none())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<String>,
    #[serde(rename = "type")]
    pub device_type: String,
    pub domain: Domain,
    pub protocol: String,
    #[serde(default)]
    pub address: DeviceAddress,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub state: DeviceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub health_status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_last_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// New KNX device with empty address map and state
    pub fn new(id: impl Into<String>, name: impl Into<String>, domain: Domain) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            id: id.into(),
            slug: slugify(&name),
            name,
            room_id: None,
            area_id: None,
            device_type: "generic".to_string(),
            domain,
            protocol: PROTOCOL_KNX.to_string(),
            address: DeviceAddress::default(),
            capabilities: Vec::new(),
            config: Map::new(),
            state: Map::new(),
            state_updated_at: None,
            health_status: HealthStatus::Unknown,
            health_last_seen: None,
            manufacturer: None,
            model: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = device_type.into();
        self
    }

    pub fn with_function(mut self, name: impl Into<String>, address: FunctionAddress) -> Self {
        self.address.functions.insert(name.into(), address);
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn function(&self, name: &str) -> Option<&FunctionAddress> {
        self.address.functions.get(name)
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    pub fn is_knx(&self) -> bool {
        self.protocol == PROTOCOL_KNX
    }

    /// Merge `delta` into the state; existing fields not in `delta` are kept
    pub fn merge_state(&mut self, delta: &DeviceState, at: DateTime<Utc>) {
        for (key, value) in delta {
            self.state.insert(key.clone(), value.clone());
        }
        self.state_updated_at = Some(at);
    }
}

/// Lowercase, ASCII alphanumerics joined by single dashes
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if dash && !slug.is_empty() {
                slug.push('-');
            }
            dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            dash = true;
        }
    }
    slug
}

/// Trim, lowercase, drop empties, dedupe and sort
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = tags
        .into_iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Living Room  Ceiling-Light"), "living-room-ceiling-light");
        assert_eq!(slugify("  Dimmer #2 "), "dimmer-2");
    }

    #[test]
    fn test_normalize_tags() {
        let tags = normalize_tags([" Accent", "escape_lighting", "accent", "", "  "]);
        assert_eq!(tags, vec!["accent", "escape_lighting"]);
    }

    #[test]
    fn test_merge_state_keeps_existing_fields() {
        let mut device = Device::new("d1", "Dimmer", Domain::Lighting);
        let mut first = DeviceState::new();
        first.insert("switch_status".into(), json!(true));
        device.merge_state(&first, Utc::now());

        let mut second = DeviceState::new();
        second.insert("brightness_status".into(), json!(50));
        device.merge_state(&second, Utc::now());

        assert_eq!(device.state["switch_status"], json!(true));
        assert_eq!(device.state["brightness_status"], json!(50));
    }

    #[test]
    fn test_legacy_address_migration() {
        let json = json!({
            "functions": {
                "switch": {"ga": "1/0/1"},
                "brightness_status": {"ga": "1/0/4", "dpt": "5.001", "flags": ["read", "transmit"]},
                "mystery": {"ga": "1/0/9"}
            }
        });
        let mut address: DeviceAddress = serde_json::from_value(json).unwrap();
        assert!(address.migrate());

        let switch = &address.functions["switch"];
        assert_eq!(switch.dpt, Some(Dpt::SWITCH));
        assert!(switch.is_writable());
        assert!(!address.functions["brightness_status"].is_writable());
        assert_eq!(address.unresolved(), vec!["mystery"]);

        // Second pass only retries what is still unresolved
        assert!(!address.migrate());
    }

    #[test]
    fn test_device_json_shape() {
        let ga: GroupAddress = "1/0/1".parse().unwrap();
        let device = Device::new("d1", "Hall Light", Domain::Lighting)
            .with_type("light_switch")
            .with_function("switch", FunctionAddress::new(ga, Dpt::SWITCH, FunctionFlags::WRITE));
        let value = serde_json::to_value(&device).unwrap();
        assert_eq!(value["type"], "light_switch");
        assert_eq!(value["domain"], "lighting");
        assert_eq!(value["protocol"], "knx");
        assert_eq!(value["slug"], "hall-light");
        assert_eq!(value["address"]["functions"]["switch"]["ga"], "1/0/1");

        let back: Device = serde_json::from_value(value).unwrap();
        assert_eq!(back, device);
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("infrastructure".parse::<Domain>().unwrap(), Domain::Infrastructure);
        assert!("garden".parse::<Domain>().is_err());
        assert_eq!("online".parse::<HealthStatus>().unwrap(), HealthStatus::Online);
    }
}
