//! KNX addressing
//!
//! Group addresses identify a shared function on the bus (multicast), individual
//! addresses identify a single physical device. Both pack into 16 bits on the wire.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Address parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Invalid group address '{0}': expected main/middle/sub or main/sub")]
    InvalidGroupFormat(String),

    #[error("Invalid individual address '{0}': expected area.line.device")]
    InvalidIndividualFormat(String),

    #[error("Address component {component} out of range in '{input}' (max {max})")]
    OutOfRange {
        input: String,
        component: &'static str,
        max: u16,
    },
}

/// Parse one address component, accepting ASCII digits only.
///
/// `u16::from_str` accepts a leading `+`, which is not valid address syntax.
fn parse_component(
    part: &str,
    input: &str,
    component: &'static str,
    max: u16,
    format_err: fn(String) -> AddressError,
) -> Result<u16, AddressError> {
    if part.is_empty() || part.len() > 5 || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format_err(input.to_string()));
    }
    let value: u32 = part.parse().map_err(|_| format_err(input.to_string()))?;
    if value > u32::from(max) {
        return Err(AddressError::OutOfRange {
            input: input.to_string(),
            component,
            max,
        });
    }
    Ok(value as u16)
}

// ============================================================================
// GroupAddress
// ============================================================================

/// KNX group address (`main/middle/sub`, packed as `main<<11 | middle<<8 | sub`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupAddress(u16);

impl GroupAddress {
    pub const MAX_MAIN: u16 = 31;
    pub const MAX_MIDDLE: u16 = 7;
    pub const MAX_SUB: u16 = 255;
    pub const MAX_SUB_TWO_LEVEL: u16 = 2047;

    /// Build from three-level components
    pub fn new(main: u16, middle: u16, sub: u16) -> Result<Self, AddressError> {
        let input = format!("{}/{}/{}", main, middle, sub);
        Self::check("main", main, Self::MAX_MAIN, &input)?;
        Self::check("middle", middle, Self::MAX_MIDDLE, &input)?;
        Self::check("sub", sub, Self::MAX_SUB, &input)?;
        Ok(Self((main << 11) | (middle << 8) | sub))
    }

    /// Build from two-level components (`main/sub`, sub 0-2047)
    pub fn new_two_level(main: u16, sub: u16) -> Result<Self, AddressError> {
        let input = format!("{}/{}", main, sub);
        Self::check("main", main, Self::MAX_MAIN, &input)?;
        Self::check("sub", sub, Self::MAX_SUB_TWO_LEVEL, &input)?;
        Ok(Self((main << 11) | sub))
    }

    fn check(component: &'static str, value: u16, max: u16, input: &str) -> Result<(), AddressError> {
        if value > max {
            return Err(AddressError::OutOfRange {
                input: input.to_string(),
                component,
                max,
            });
        }
        Ok(())
    }

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub const fn from_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }

    pub const fn main(self) -> u16 {
        (self.0 >> 11) & 0x1F
    }

    pub const fn middle(self) -> u16 {
        (self.0 >> 8) & 0x07
    }

    pub const fn sub(self) -> u16 {
        self.0 & 0xFF
    }

    /// Two-level representation (`main/sub`)
    pub fn to_two_level_string(self) -> String {
        format!("{}/{}", self.main(), self.0 & 0x07FF)
    }

    /// Topic-safe form: `/` is not allowed inside a single topic level
    pub fn to_topic(self) -> String {
        self.to_string().replace('/', "%2F")
    }

    /// Inverse of [`GroupAddress::to_topic`]
    pub fn from_topic(segment: &str) -> Result<Self, AddressError> {
        segment.replace("%2F", "/").replace("%2f", "/").parse()
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.main(), self.middle(), self.sub())
    }
}

impl FromStr for GroupAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let fmt_err = AddressError::InvalidGroupFormat;
        match parts.as_slice() {
            [main, middle, sub] => {
                let main = parse_component(main, s, "main", Self::MAX_MAIN, fmt_err)?;
                let middle = parse_component(middle, s, "middle", Self::MAX_MIDDLE, fmt_err)?;
                let sub = parse_component(sub, s, "sub", Self::MAX_SUB, fmt_err)?;
                Ok(Self((main << 11) | (middle << 8) | sub))
            },
            [main, sub] => {
                let main = parse_component(main, s, "main", Self::MAX_MAIN, fmt_err)?;
                let sub = parse_component(sub, s, "sub", Self::MAX_SUB_TWO_LEVEL, fmt_err)?;
                Ok(Self((main << 11) | sub))
            },
            _ => Err(AddressError::InvalidGroupFormat(s.to_string())),
        }
    }
}

impl Serialize for GroupAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GroupAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// ============================================================================
// IndividualAddress
// ============================================================================

/// KNX individual (physical) address (`area.line.device`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct IndividualAddress(u16);

impl IndividualAddress {
    pub const MAX_AREA: u16 = 15;
    pub const MAX_LINE: u16 = 15;
    pub const MAX_DEVICE: u16 = 255;

    pub fn new(area: u16, line: u16, device: u16) -> Result<Self, AddressError> {
        format!("{}.{}.{}", area, line, device).parse()
    }

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub const fn from_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }

    pub const fn area(self) -> u16 {
        (self.0 >> 12) & 0x0F
    }

    pub const fn line(self) -> u16 {
        (self.0 >> 8) & 0x0F
    }

    pub const fn device(self) -> u16 {
        self.0 & 0xFF
    }

    /// `0.0.0` is used by knxd for locally generated telegrams
    pub const fn is_unspecified(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for IndividualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.area(), self.line(), self.device())
    }
}

impl FromStr for IndividualAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fmt_err = AddressError::InvalidIndividualFormat;
        match s.split('.').collect::<Vec<_>>().as_slice() {
            [area, line, device] => {
                let area = parse_component(area, s, "area", Self::MAX_AREA, fmt_err)?;
                let line = parse_component(line, s, "line", Self::MAX_LINE, fmt_err)?;
                let device = parse_component(device, s, "device", Self::MAX_DEVICE, fmt_err)?;
                Ok(Self((area << 12) | (line << 8) | device))
            },
            _ => Err(AddressError::InvalidIndividualFormat(s.to_string())),
        }
    }
}

impl Serialize for IndividualAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IndividualAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
