//! Datapoint type (DPT) codecs
//!
//! Each supported type validates its fixed payload length, applies its scaling and
//! maps reserved bit patterns to [`DptValue::Invalid`] instead of a number.
//!
//! | DPT | Payload | Value |
//! |-----|---------|-------|
//! | 1.x | 1 bit | bool |
//! | 3.007 / 3.008 | 4 bit | direction + step code |
//! | 5.001 | 1 byte | 0-100 % |
//! | 5.003 | 1 byte | 0-360 ° |
//! | 5.x | 1 byte | 0-255 |
//! | 7.x | 2 bytes | 0-65535 |
//! | 9.x | 2 bytes | 2-byte float, `0x7FFF` invalid |
//! | 13.x | 4 bytes | i32 |
//! | 14.x | 4 bytes | IEEE 754 f32 |
//! | 17.001 | 1 byte | scene 0-63 |
//! | 18.001 | 1 byte | scene 0-63 + learn bit |
//! | 20.102 | 1 byte | HVAC mode |
//! | 232.600 | 3 bytes | RGB |
//! | 251.600 | 6 bytes | RGBW |

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Datapoint codec errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DptError {
    #[error("Invalid DPT identifier: {0}")]
    InvalidId(String),

    #[error("Unsupported DPT: {0}")]
    Unsupported(Dpt),

    #[error("DPT {dpt} expects {expected} byte(s), got {actual}")]
    Length {
        dpt: Dpt,
        expected: usize,
        actual: usize,
    },

    #[error("Value out of range for DPT {dpt}: {reason}")]
    OutOfRange { dpt: Dpt, reason: String },

    #[error("Value for DPT {dpt} must be {expected}")]
    TypeMismatch { dpt: Dpt, expected: &'static str },
}

// ============================================================================
// DPT identifier
// ============================================================================

/// Datapoint type identifier (`main.sub`, e.g. `9.001`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dpt {
    pub main: u16,
    pub sub: u16,
}

impl Dpt {
    pub const SWITCH: Dpt = Dpt::new(1, 1);
    pub const ENABLE: Dpt = Dpt::new(1, 3);
    pub const ALARM: Dpt = Dpt::new(1, 5);
    pub const STEP: Dpt = Dpt::new(1, 7);
    pub const UP_DOWN: Dpt = Dpt::new(1, 8);
    pub const OPEN_CLOSE: Dpt = Dpt::new(1, 9);
    pub const START: Dpt = Dpt::new(1, 10);
    pub const TRIGGER: Dpt = Dpt::new(1, 17);
    pub const OCCUPANCY: Dpt = Dpt::new(1, 18);
    pub const CONTROL_DIMMING: Dpt = Dpt::new(3, 7);
    pub const CONTROL_BLINDS: Dpt = Dpt::new(3, 8);
    pub const SCALING: Dpt = Dpt::new(5, 1);
    pub const ANGLE: Dpt = Dpt::new(5, 3);
    pub const PERCENT_U8: Dpt = Dpt::new(5, 4);
    pub const COLOUR_TEMPERATURE: Dpt = Dpt::new(7, 600);
    pub const TEMPERATURE: Dpt = Dpt::new(9, 1);
    pub const TEMPERATURE_DIFFERENCE: Dpt = Dpt::new(9, 2);
    pub const LUX: Dpt = Dpt::new(9, 4);
    pub const WIND_SPEED: Dpt = Dpt::new(9, 5);
    pub const HUMIDITY: Dpt = Dpt::new(9, 7);
    pub const PPM: Dpt = Dpt::new(9, 8);
    pub const ACTIVE_ENERGY: Dpt = Dpt::new(13, 10);
    pub const ELECTRIC_CURRENT: Dpt = Dpt::new(14, 19);
    pub const ELECTRIC_POTENTIAL: Dpt = Dpt::new(14, 27);
    pub const POWER: Dpt = Dpt::new(14, 56);
    pub const SCENE_NUMBER: Dpt = Dpt::new(17, 1);
    pub const SCENE_CONTROL: Dpt = Dpt::new(18, 1);
    pub const HVAC_MODE: Dpt = Dpt::new(20, 102);
    pub const RGB: Dpt = Dpt::new(232, 600);
    pub const RGBW: Dpt = Dpt::new(251, 600);

    pub const fn new(main: u16, sub: u16) -> Self {
        Self { main, sub }
    }

    /// 1-6 bit types travel in the short field of the APCI byte
    pub const fn uses_short_frame(self) -> bool {
        matches!(self.main, 1..=3)
    }

    fn codec(self) -> Option<Codec> {
        let codec = match (self.main, self.sub) {
            (1, _) => Codec::Boolean,
            (3, _) => Codec::Control,
            (5, 1) => Codec::Scaled(100.0),
            (5, 3) => Codec::Scaled(360.0),
            (5, _) => Codec::Unsigned8,
            (7, _) => Codec::Unsigned16,
            (9, _) => Codec::Float16,
            (13, _) => Codec::Signed32,
            (14, _) => Codec::Float32,
            (17, _) => Codec::Scene,
            (18, _) => Codec::SceneControl,
            (20, 102) => Codec::HvacMode,
            (232, 600) => Codec::Rgb,
            (251, 600) => Codec::Rgbw,
            _ => return None,
        };
        Some(codec)
    }

    /// Fixed payload length, if the type is supported
    pub fn payload_len(self) -> Option<usize> {
        self.codec().map(Codec::payload_len)
    }

    pub fn is_supported(self) -> bool {
        self.codec().is_some()
    }
}

impl fmt::Display for Dpt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}", self.main, self.sub)
    }
}

impl FromStr for Dpt {
    type Err = DptError;

    /// Accepts `9.001`, `9.1`, `9`, `DPT9.001`, `DPT-9` and ETS style `DPST-9-1`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DptError::InvalidId(s.to_string());
        let trimmed = s.trim();
        let upper = trimmed.to_ascii_uppercase();

        let (main, sub) = if let Some(rest) = upper.strip_prefix("DPST-") {
            rest.split_once('-').ok_or_else(invalid)?
        } else {
            let rest = upper
                .strip_prefix("DPT")
                .map(|r| r.trim_start_matches(['-', ' ']))
                .unwrap_or(&upper);
            rest.split_once('.').unwrap_or((rest, "0"))
        };

        let parse = |part: &str| -> Result<u16, DptError> {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse().map_err(|_| invalid())
        };
        Ok(Dpt::new(parse(main)?, parse(sub)?))
    }
}

impl Serialize for Dpt {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Dpt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// ============================================================================
// Values
// ============================================================================

/// HVAC operating mode (DPT 20.102)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacMode {
    Auto,
    Comfort,
    Standby,
    Economy,
    BuildingProtection,
}

impl HvacMode {
    pub const fn code(self) -> u8 {
        match self {
            HvacMode::Auto => 0,
            HvacMode::Comfort => 1,
            HvacMode::Standby => 2,
            HvacMode::Economy => 3,
            HvacMode::BuildingProtection => 4,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(HvacMode::Auto),
            1 => Some(HvacMode::Comfort),
            2 => Some(HvacMode::Standby),
            3 => Some(HvacMode::Economy),
            4 => Some(HvacMode::BuildingProtection),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            HvacMode::Auto => "auto",
            HvacMode::Comfort => "comfort",
            HvacMode::Standby => "standby",
            HvacMode::Economy => "economy",
            HvacMode::BuildingProtection => "building_protection",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        [
            HvacMode::Auto,
            HvacMode::Comfort,
            HvacMode::Standby,
            HvacMode::Economy,
            HvacMode::BuildingProtection,
        ]
        .into_iter()
        .find(|m| m.as_str().eq_ignore_ascii_case(name))
    }
}

/// A decoded datapoint value
#[derive(Debug, Clone, PartialEq)]
pub enum DptValue {
    Bool(bool),
    /// Relative control: direction plus step code (0 = stop, 1-7 = interval)
    Control { increase: bool, step: u8 },
    Unsigned(u32),
    Signed(i32),
    Float(f64),
    SceneControl { scene: u8, learn: bool },
    Hvac(HvacMode),
    Rgb { red: u8, green: u8, blue: u8 },
    Rgbw { red: u8, green: u8, blue: u8, white: u8 },
    /// Reserved/out-of-range bit pattern reported by the device
    Invalid,
}

impl DptValue {
    pub fn is_invalid(&self) -> bool {
        matches!(self, DptValue::Invalid)
    }

    /// JSON form published on the message bus
    pub fn to_json(&self) -> Value {
        match self {
            DptValue::Bool(b) => Value::Bool(*b),
            DptValue::Control { increase, step } => json!({"increase": increase, "step": step}),
            DptValue::Unsigned(v) => json!(v),
            DptValue::Signed(v) => json!(v),
            DptValue::Float(v) => json!(v),
            DptValue::SceneControl { scene, learn } => json!({"scene": scene, "learn": learn}),
            DptValue::Hvac(mode) => Value::String(mode.as_str().to_string()),
            DptValue::Rgb { red, green, blue } => json!({"r": red, "g": green, "b": blue}),
            DptValue::Rgbw {
                red,
                green,
                blue,
                white,
            } => json!({"r": red, "g": green, "b": blue, "w": white}),
            DptValue::Invalid => Value::Null,
        }
    }

    /// Interpret a JSON command value for the given type
    pub fn from_json(dpt: Dpt, value: &Value) -> Result<Self, DptError> {
        let codec = dpt.codec().ok_or(DptError::Unsupported(dpt))?;
        codec.value_from_json(dpt, value)
    }
}

impl fmt::Display for DptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

// ============================================================================
// Codecs
// ============================================================================

const DPT9_INVALID: u16 = 0x7FFF;
const DPT9_MIN: f64 = -671_088.64;
const DPT9_MAX: f64 = 670_760.96;
const DPT9_MAX_EXPONENT: u32 = 15;
const SCENE_MAX: u8 = 63;

#[derive(Debug, Clone, Copy)]
enum Codec {
    Boolean,
    Control,
    Scaled(f64),
    Unsigned8,
    Unsigned16,
    Float16,
    Signed32,
    Float32,
    Scene,
    SceneControl,
    HvacMode,
    Rgb,
    Rgbw,
}

impl Codec {
    fn payload_len(self) -> usize {
        match self {
            Codec::Boolean
            | Codec::Control
            | Codec::Scaled(_)
            | Codec::Unsigned8
            | Codec::Scene
            | Codec::SceneControl
            | Codec::HvacMode => 1,
            Codec::Unsigned16 | Codec::Float16 => 2,
            Codec::Rgb => 3,
            Codec::Signed32 | Codec::Float32 => 4,
            Codec::Rgbw => 6,
        }
    }

    fn decode(self, dpt: Dpt, data: &[u8]) -> Result<DptValue, DptError> {
        let expected = self.payload_len();
        if data.len() != expected {
            return Err(DptError::Length {
                dpt,
                expected,
                actual: data.len(),
            });
        }

        let value = match self {
            Codec::Boolean => DptValue::Bool(data[0] & 0x01 != 0),
            Codec::Control => DptValue::Control {
                increase: data[0] & 0x08 != 0,
                step: data[0] & 0x07,
            },
            Codec::Scaled(max) => DptValue::Float(f64::from(data[0]) * max / 255.0),
            Codec::Unsigned8 => DptValue::Unsigned(u32::from(data[0])),
            Codec::Unsigned16 => DptValue::Unsigned(u32::from(u16::from_be_bytes([data[0], data[1]]))),
            Codec::Float16 => decode_float16(u16::from_be_bytes([data[0], data[1]])),
            Codec::Signed32 => DptValue::Signed(i32::from_be_bytes([data[0], data[1], data[2], data[3]])),
            Codec::Float32 => {
                let v = f32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                if v.is_finite() {
                    DptValue::Float(f64::from(v))
                } else {
                    DptValue::Invalid
                }
            },
            Codec::Scene => DptValue::Unsigned(u32::from(data[0] & 0x3F)),
            Codec::SceneControl => DptValue::SceneControl {
                scene: data[0] & 0x3F,
                learn: data[0] & 0x80 != 0,
            },
            Codec::HvacMode => HvacMode::from_code(data[0])
                .map(DptValue::Hvac)
                .unwrap_or(DptValue::Invalid),
            Codec::Rgb => DptValue::Rgb {
                red: data[0],
                green: data[1],
                blue: data[2],
            },
            Codec::Rgbw => DptValue::Rgbw {
                red: data[0],
                green: data[1],
                blue: data[2],
                white: data[3],
            },
        };
        Ok(value)
    }

    fn encode(self, dpt: Dpt, value: &DptValue) -> Result<Vec<u8>, DptError> {
        let mismatch = |expected| DptError::TypeMismatch { dpt, expected };
        let out_of_range = |reason: String| DptError::OutOfRange { dpt, reason };

        match (self, value) {
            (Codec::Boolean, DptValue::Bool(b)) => Ok(vec![u8::from(*b)]),
            (Codec::Boolean, _) => Err(mismatch("a boolean")),

            (Codec::Control, DptValue::Control { increase, step }) => {
                if *step > 7 {
                    return Err(out_of_range(format!("step code {} exceeds 7", step)));
                }
                Ok(vec![(u8::from(*increase) << 3) | step])
            },
            (Codec::Control, _) => Err(mismatch("a control value")),

            (Codec::Scaled(max), DptValue::Float(v)) => {
                if !v.is_finite() || *v < 0.0 || *v > max {
                    return Err(out_of_range(format!("{} not in 0-{}", v, max)));
                }
                Ok(vec![(v * 255.0 / max).round() as u8])
            },
            (Codec::Scaled(max), DptValue::Unsigned(v)) => {
                Codec::Scaled(max).encode(dpt, &DptValue::Float(f64::from(*v)))
            },
            (Codec::Scaled(_), _) => Err(mismatch("a number")),

            (Codec::Unsigned8, DptValue::Unsigned(v)) => u8::try_from(*v)
                .map(|b| vec![b])
                .map_err(|_| out_of_range(format!("{} exceeds 255", v))),
            (Codec::Unsigned8, _) => Err(mismatch("an integer 0-255")),

            (Codec::Unsigned16, DptValue::Unsigned(v)) => u16::try_from(*v)
                .map(|w| w.to_be_bytes().to_vec())
                .map_err(|_| out_of_range(format!("{} exceeds 65535", v))),
            (Codec::Unsigned16, _) => Err(mismatch("an integer 0-65535")),

            (Codec::Float16, DptValue::Float(v)) => encode_float16(*v)
                .map(|raw| raw.to_be_bytes().to_vec())
                .ok_or_else(|| {
                    out_of_range(format!("{} not in {}..{}", v, DPT9_MIN, DPT9_MAX))
                }),
            (Codec::Float16, DptValue::Invalid) => Ok(DPT9_INVALID.to_be_bytes().to_vec()),
            (Codec::Float16, _) => Err(mismatch("a number")),

            (Codec::Signed32, DptValue::Signed(v)) => Ok(v.to_be_bytes().to_vec()),
            (Codec::Signed32, _) => Err(mismatch("a 32-bit integer")),

            (Codec::Float32, DptValue::Float(v)) => {
                let narrowed = *v as f32;
                if !narrowed.is_finite() {
                    return Err(out_of_range(format!("{} does not fit in f32", v)));
                }
                Ok(narrowed.to_be_bytes().to_vec())
            },
            (Codec::Float32, _) => Err(mismatch("a number")),

            (Codec::Scene, DptValue::Unsigned(v)) => {
                if *v > u32::from(SCENE_MAX) {
                    return Err(out_of_range(format!("scene {} exceeds {}", v, SCENE_MAX)));
                }
                Ok(vec![*v as u8])
            },
            (Codec::Scene, _) => Err(mismatch("a scene number 0-63")),

            (Codec::SceneControl, DptValue::SceneControl { scene, learn }) => {
                if *scene > SCENE_MAX {
                    return Err(out_of_range(format!("scene {} exceeds {}", scene, SCENE_MAX)));
                }
                Ok(vec![(u8::from(*learn) << 7) | scene])
            },
            (Codec::SceneControl, _) => Err(mismatch("a scene control value")),

            (Codec::HvacMode, DptValue::Hvac(mode)) => Ok(vec![mode.code()]),
            (Codec::HvacMode, _) => Err(mismatch("an HVAC mode")),

            (Codec::Rgb, DptValue::Rgb { red, green, blue }) => Ok(vec![*red, *green, *blue]),
            (Codec::Rgb, _) => Err(mismatch("an RGB colour")),

            (
                Codec::Rgbw,
                DptValue::Rgbw {
                    red,
                    green,
                    blue,
                    white,
                },
            ) => Ok(vec![*red, *green, *blue, *white, 0x00, 0x0F]),
            (Codec::Rgbw, _) => Err(mismatch("an RGBW colour")),
        }
    }

    fn value_from_json(self, dpt: Dpt, value: &Value) -> Result<DptValue, DptError> {
        let mismatch = |expected| DptError::TypeMismatch { dpt, expected };

        match self {
            Codec::Boolean => json_bool(value)
                .map(DptValue::Bool)
                .ok_or(mismatch("a boolean")),
            Codec::Control => match value {
                Value::Number(n) => {
                    let steps = n.as_i64().ok_or(mismatch("an integer -7..7"))?;
                    if !(-7..=7).contains(&steps) {
                        return Err(DptError::OutOfRange {
                            dpt,
                            reason: format!("step {} not in -7..7", steps),
                        });
                    }
                    Ok(DptValue::Control {
                        increase: steps > 0,
                        step: steps.unsigned_abs() as u8,
                    })
                },
                Value::Object(map) => {
                    let increase = map
                        .get("increase")
                        .and_then(json_bool)
                        .ok_or(mismatch("an object with 'increase' and 'step'"))?;
                    let step = map
                        .get("step")
                        .and_then(Value::as_u64)
                        .ok_or(mismatch("an object with 'increase' and 'step'"))?;
                    Ok(DptValue::Control {
                        increase,
                        step: step.min(u64::from(u8::MAX)) as u8,
                    })
                },
                _ => Err(mismatch("a step count or control object")),
            },
            Codec::Scaled(_) | Codec::Float16 | Codec::Float32 => json_f64(value)
                .map(DptValue::Float)
                .ok_or(mismatch("a number")),
            Codec::Unsigned8 | Codec::Unsigned16 | Codec::Scene => json_u64(value)
                .map(|v| DptValue::Unsigned(v.min(u64::from(u32::MAX)) as u32))
                .ok_or(mismatch("a non-negative integer")),
            Codec::Signed32 => json_i64(value)
                .and_then(|v| i32::try_from(v).ok())
                .map(DptValue::Signed)
                .ok_or(mismatch("a 32-bit integer")),
            Codec::SceneControl => match value {
                Value::Object(map) => {
                    let scene = map
                        .get("scene")
                        .and_then(Value::as_u64)
                        .ok_or(mismatch("an object with 'scene'"))?;
                    let learn = map.get("learn").and_then(json_bool).unwrap_or(false);
                    Ok(DptValue::SceneControl {
                        scene: scene.min(u64::from(u8::MAX)) as u8,
                        learn,
                    })
                },
                other => json_u64(other)
                    .map(|scene| DptValue::SceneControl {
                        scene: scene.min(u64::from(u8::MAX)) as u8,
                        learn: false,
                    })
                    .ok_or(mismatch("a scene number or scene control object")),
            },
            Codec::HvacMode => match value {
                Value::String(name) => HvacMode::from_name(name)
                    .map(DptValue::Hvac)
                    .ok_or(mismatch("auto, comfort, standby, economy or building_protection")),
                other => json_u64(other)
                    .and_then(|c| u8::try_from(c).ok())
                    .and_then(HvacMode::from_code)
                    .map(DptValue::Hvac)
                    .ok_or(mismatch("an HVAC mode name or code 0-4")),
            },
            Codec::Rgb => {
                let [red, green, blue] = json_channels::<3>(value, ["r", "g", "b"])
                    .ok_or(mismatch("an RGB object, [r, g, b] array or #RRGGBB"))?;
                Ok(DptValue::Rgb { red, green, blue })
            },
            Codec::Rgbw => {
                let [red, green, blue, white] = json_channels::<4>(value, ["r", "g", "b", "w"])
                    .ok_or(mismatch("an RGBW object or [r, g, b, w] array"))?;
                Ok(DptValue::Rgbw {
                    red,
                    green,
                    blue,
                    white,
                })
            },
        }
    }
}

/// DPT 9 decode: `value = 0.01 * m * 2^e`, 12-bit two's complement mantissa
fn decode_float16(raw: u16) -> DptValue {
    if raw == DPT9_INVALID {
        return DptValue::Invalid;
    }
    let exponent = u32::from((raw >> 11) & 0x0F);
    let mut mantissa = i32::from(raw & 0x07FF);
    if raw & 0x8000 != 0 {
        mantissa -= 2048;
    }
    // Integer scaling first so 2100 -> 21.0 without binary rounding noise
    DptValue::Float(f64::from(mantissa * (1 << exponent)) / 100.0)
}

/// DPT 9 encode, rounding the mantissa half away from zero
fn encode_float16(value: f64) -> Option<u16> {
    if !value.is_finite() || !(DPT9_MIN..=DPT9_MAX).contains(&value) {
        return None;
    }
    let mut exponent = 0u32;
    let mut mantissa = (value * 100.0).round();
    while !(-2048.0..=2047.0).contains(&mantissa) {
        exponent += 1;
        if exponent > DPT9_MAX_EXPONENT {
            return None;
        }
        mantissa = (value * 100.0 / f64::from(1u32 << exponent)).round();
    }
    let m = mantissa as i32;
    let sign: u16 = if m < 0 { 0x8000 } else { 0 };
    let raw = sign | ((exponent as u16) << 11) | ((m as u16) & 0x07FF);
    if raw == DPT9_INVALID {
        return None;
    }
    Some(raw)
}

fn json_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_u64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "on" | "true" | "1" => Some(true),
            "off" | "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn json_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_channels<const N: usize>(value: &Value, keys: [&str; N]) -> Option<[u8; N]> {
    let mut out = [0u8; N];
    match value {
        Value::Object(map) => {
            for (slot, key) in out.iter_mut().zip(keys) {
                *slot = u8::try_from(map.get(key)?.as_u64()?).ok()?;
            }
        },
        Value::Array(items) if items.len() == N => {
            for (slot, item) in out.iter_mut().zip(items) {
                *slot = u8::try_from(item.as_u64()?).ok()?;
            }
        },
        Value::String(hex) if N == 3 => {
            let digits = hex.strip_prefix('#')?;
            if digits.len() != 6 {
                return None;
            }
            for (i, slot) in out.iter_mut().enumerate() {
                *slot = u8::from_str_radix(digits.get(i * 2..i * 2 + 2)?, 16).ok()?;
            }
        },
        _ => return None,
    }
    Some(out)
}

/// Decode payload bytes for a datapoint type
pub fn decode_value(dpt: Dpt, data: &[u8]) -> Result<DptValue, DptError> {
    dpt.codec()
        .ok_or(DptError::Unsupported(dpt))?
        .decode(dpt, data)
}

/// Encode a value for a datapoint type
pub fn encode_value(dpt: Dpt, value: &DptValue) -> Result<Vec<u8>, DptError> {
    dpt.codec()
        .ok_or(DptError::Unsupported(dpt))?
        .encode(dpt, value)
}
