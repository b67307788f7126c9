//! Canonical function registry
//!
//! A closed table of the application-level function names a KNX device can
//! expose, each with its default DPT, default communication flags, the state
//! field it reports into and the aliases that normalise to it. Multi-channel
//! actuators prefix function names with a channel tag (`ch_a_switch`,
//! `channel_b_valve_status`); those resolve to the prefix plus the base function.

use crate::dpt::Dpt;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

// ============================================================================
// Flags
// ============================================================================

/// Communication flags of a group object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FunctionFlags {
    pub read: bool,
    pub write: bool,
    pub transmit: bool,
}

impl FunctionFlags {
    pub const NONE: FunctionFlags = FunctionFlags::new(false, false, false);
    pub const WRITE: FunctionFlags = FunctionFlags::new(false, true, false);
    pub const READ_TRANSMIT: FunctionFlags = FunctionFlags::new(true, false, true);
    pub const WRITE_TRANSMIT: FunctionFlags = FunctionFlags::new(false, true, true);
    pub const READ_WRITE: FunctionFlags = FunctionFlags::new(true, true, false);

    pub const fn new(read: bool, write: bool, transmit: bool) -> Self {
        Self {
            read,
            write,
            transmit,
        }
    }

    pub const fn is_empty(self) -> bool {
        !self.read && !self.write && !self.transmit
    }

    pub fn names(self) -> Vec<&'static str> {
        let mut names = Vec::with_capacity(3);
        if self.read {
            names.push("read");
        }
        if self.write {
            names.push("write");
        }
        if self.transmit {
            names.push("transmit");
        }
        names
    }

    /// Parse a flag list, ignoring unknown entries
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut flags = FunctionFlags::NONE;
        for name in names {
            match name.trim().to_ascii_lowercase().as_str() {
                "read" => flags.read = true,
                "write" => flags.write = true,
                "transmit" => flags.transmit = true,
                _ => {},
            }
        }
        flags
    }
}

impl fmt::Display for FunctionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.names().join(","))
    }
}

impl Serialize for FunctionFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.names().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FunctionFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        Ok(FunctionFlags::from_names(names.iter().map(String::as_str)))
    }
}

// ============================================================================
// Canonical table
// ============================================================================

macro_rules! canonical_functions {
    ($(
        $variant:ident => $name:literal, state $state:literal, $dpt:expr, $flags:expr, [$($alias:literal),* $(,)?];
    )*) => {
        /// A recognised KNX function
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum CanonicalFunction {
            $($variant),*
        }

        impl CanonicalFunction {
            pub const ALL: &'static [CanonicalFunction] = &[$(CanonicalFunction::$variant),*];

            pub const fn as_str(self) -> &'static str {
                match self {
                    $(CanonicalFunction::$variant => $name),*
                }
            }

            /// Device state field this function reports into
            ///
            /// Command/status pairs share the status name, so `switch` and
            /// `switch_status` both land in `switch_status`.
            pub const fn state_key(self) -> &'static str {
                match self {
                    $(CanonicalFunction::$variant => $state),*
                }
            }

            pub const fn default_dpt(self) -> Dpt {
                match self {
                    $(CanonicalFunction::$variant => $dpt),*
                }
            }

            pub const fn default_flags(self) -> FunctionFlags {
                match self {
                    $(CanonicalFunction::$variant => $flags),*
                }
            }

            pub const fn aliases(self) -> &'static [&'static str] {
                match self {
                    $(CanonicalFunction::$variant => &[$($alias),*]),*
                }
            }
        }
    };
}

canonical_functions! {
    // Lighting
    Switch => "switch", state "switch_status", Dpt::SWITCH, FunctionFlags::WRITE, ["on_off", "switching"];
    SwitchStatus => "switch_status", state "switch_status", Dpt::SWITCH, FunctionFlags::READ_TRANSMIT, ["switch_feedback"];
    Brightness => "brightness", state "brightness_status", Dpt::SCALING, FunctionFlags::WRITE, ["dim", "dimming", "level"];
    BrightnessStatus => "brightness_status", state "brightness_status", Dpt::SCALING, FunctionFlags::READ_TRANSMIT, ["dim_status", "dim_feedback"];
    ColorTemperature => "color_temperature", state "color_temperature_status", Dpt::COLOUR_TEMPERATURE, FunctionFlags::WRITE,
        ["ct", "colour_temperature", "colour_temp", "color_temp"];
    ColorTemperatureStatus => "color_temperature_status", state "color_temperature_status", Dpt::COLOUR_TEMPERATURE, FunctionFlags::READ_TRANSMIT,
        ["colour_temperature_status", "colour_temp_status", "color_temp_status"];
    Rgb => "rgb", state "rgb_status", Dpt::RGB, FunctionFlags::WRITE, ["colour", "color"];
    RgbStatus => "rgb_status", state "rgb_status", Dpt::RGB, FunctionFlags::READ_TRANSMIT, [];
    Rgbw => "rgbw", state "rgbw", Dpt::RGBW, FunctionFlags::WRITE, [];
    DimmingControl => "dimming_control", state "dimming_control", Dpt::CONTROL_DIMMING, FunctionFlags::WRITE, ["relative_dimming"];

    // Blinds and shutters
    Position => "position", state "position_status", Dpt::SCALING, FunctionFlags::WRITE, ["blind_position", "height"];
    PositionStatus => "position_status", state "position_status", Dpt::SCALING, FunctionFlags::READ_TRANSMIT, ["position_feedback"];
    Slat => "slat", state "slat_status", Dpt::SCALING, FunctionFlags::WRITE, ["tilt", "lamelle", "angle"];
    SlatStatus => "slat_status", state "slat_status", Dpt::SCALING, FunctionFlags::READ_TRANSMIT, ["tilt_status", "tilt_feedback"];
    Move => "move", state "move", Dpt::UP_DOWN, FunctionFlags::WRITE, ["up_down"];
    Stop => "stop", state "stop", Dpt::STEP, FunctionFlags::WRITE, ["step", "step_stop"];
    BlindControl => "blind_control", state "blind_control", Dpt::CONTROL_BLINDS, FunctionFlags::WRITE, ["relative_position"];

    // Climate
    Temperature => "temperature", state "temperature", Dpt::TEMPERATURE, FunctionFlags::READ_TRANSMIT,
        ["actual_temperature", "current_temperature", "temp", "room_temperature"];
    Setpoint => "setpoint", state "setpoint_status", Dpt::TEMPERATURE, FunctionFlags::READ_WRITE, ["target_temperature", "set_temp"];
    SetpointStatus => "setpoint_status", state "setpoint_status", Dpt::TEMPERATURE, FunctionFlags::READ_TRANSMIT, ["setpoint_feedback"];
    HeatingOutput => "heating_output", state "heating_output", Dpt::SCALING, FunctionFlags::WRITE, ["heating_valve"];
    Heating => "heating", state "heating", Dpt::SWITCH, FunctionFlags::READ_TRANSMIT, ["heat_demand"];
    Cooling => "cooling", state "cooling", Dpt::SWITCH, FunctionFlags::READ_TRANSMIT, ["cool_demand"];
    HvacMode => "hvac_mode", state "hvac_mode_status", Dpt::HVAC_MODE, FunctionFlags::WRITE, ["mode"];
    HvacModeStatus => "hvac_mode_status", state "hvac_mode_status", Dpt::HVAC_MODE, FunctionFlags::READ_TRANSMIT, ["mode_status"];
    Valve => "valve", state "valve_status", Dpt::SCALING, FunctionFlags::WRITE, ["valve_cmd", "valve_position"];
    ValveStatus => "valve_status", state "valve_status", Dpt::SCALING, FunctionFlags::READ_TRANSMIT, ["valve_feedback"];
    Humidity => "humidity", state "humidity", Dpt::HUMIDITY, FunctionFlags::READ_TRANSMIT, ["rh", "relative_humidity"];

    // Sensors
    Presence => "presence", state "presence", Dpt::OCCUPANCY, FunctionFlags::READ_TRANSMIT, ["motion", "occupancy", "occupied"];
    Lux => "lux", state "lux", Dpt::LUX, FunctionFlags::READ_TRANSMIT, ["light_level", "illuminance", "brightness_sensor"];
    Co2 => "co2", state "co2", Dpt::PPM, FunctionFlags::READ_TRANSMIT, ["carbon_dioxide"];
    WindSpeed => "wind_speed", state "wind_speed", Dpt::WIND_SPEED, FunctionFlags::READ_TRANSMIT, ["wind"];
    Rain => "rain", state "rain", Dpt::ALARM, FunctionFlags::READ_TRANSMIT, ["rain_alarm"];
    TemperatureDifference => "temperature_difference", state "temperature_difference", Dpt::TEMPERATURE_DIFFERENCE,
        FunctionFlags::READ_TRANSMIT, [];

    // Energy and metering
    Power => "power", state "power", Dpt::POWER, FunctionFlags::READ_TRANSMIT, ["active_power"];
    Voltage => "voltage", state "voltage", Dpt::ELECTRIC_POTENTIAL, FunctionFlags::READ_TRANSMIT, [];
    Current => "current", state "current", Dpt::ELECTRIC_CURRENT, FunctionFlags::READ_TRANSMIT, ["electric_current"];
    ActiveEnergy => "active_energy", state "active_energy", Dpt::ACTIVE_ENERGY, FunctionFlags::READ_TRANSMIT,
        ["active_energy_kwh", "energy_kwh"];

    // Scenes
    SceneNumber => "scene_number", state "scene_number", Dpt::SCENE_NUMBER, FunctionFlags::WRITE_TRANSMIT, ["scene"];
    SceneControl => "scene_control", state "scene_control", Dpt::SCENE_CONTROL, FunctionFlags::WRITE, [];

    // Push buttons
    Button1 => "button_1", state "button_1", Dpt::SWITCH, FunctionFlags::WRITE_TRANSMIT, [];
    Button1Led => "button_1_led", state "button_1_led", Dpt::SWITCH, FunctionFlags::WRITE, [];
    Button2 => "button_2", state "button_2", Dpt::SWITCH, FunctionFlags::WRITE_TRANSMIT, [];
    Button2Led => "button_2_led", state "button_2_led", Dpt::SWITCH, FunctionFlags::WRITE, [];
    Button3 => "button_3", state "button_3", Dpt::SWITCH, FunctionFlags::WRITE_TRANSMIT, [];
    Button3Led => "button_3_led", state "button_3_led", Dpt::SWITCH, FunctionFlags::WRITE, [];
    Button4 => "button_4", state "button_4", Dpt::SWITCH, FunctionFlags::WRITE_TRANSMIT, [];
    Button4Led => "button_4_led", state "button_4_led", Dpt::SWITCH, FunctionFlags::WRITE, [];
    Button5 => "button_5", state "button_5", Dpt::SWITCH, FunctionFlags::WRITE_TRANSMIT, [];
    Button5Led => "button_5_led", state "button_5_led", Dpt::SWITCH, FunctionFlags::WRITE, [];
    Button6 => "button_6", state "button_6", Dpt::SWITCH, FunctionFlags::WRITE_TRANSMIT, [];
    Button6Led => "button_6_led", state "button_6_led", Dpt::SWITCH, FunctionFlags::WRITE, [];
    Button7 => "button_7", state "button_7", Dpt::SWITCH, FunctionFlags::WRITE_TRANSMIT, [];
    Button7Led => "button_7_led", state "button_7_led", Dpt::SWITCH, FunctionFlags::WRITE, [];
    Button8 => "button_8", state "button_8", Dpt::SWITCH, FunctionFlags::WRITE_TRANSMIT, [];
    Button8Led => "button_8_led", state "button_8_led", Dpt::SWITCH, FunctionFlags::WRITE, [];

    // Boolean control
    Enable => "enable", state "enable", Dpt::ENABLE, FunctionFlags::WRITE, [];
    Alarm => "alarm", state "alarm", Dpt::ALARM, FunctionFlags::READ_TRANSMIT, ["fault"];
    OpenClose => "open_close", state "open_close", Dpt::OPEN_CLOSE, FunctionFlags::WRITE, ["contact"];
    StartStop => "start_stop", state "start_stop", Dpt::START, FunctionFlags::WRITE, [];
    Trigger => "trigger", state "trigger", Dpt::TRIGGER, FunctionFlags::WRITE, [];

    // Generic
    Binary => "binary", state "binary", Dpt::new(1, 2), FunctionFlags::READ_TRANSMIT, ["binary_input"];
    Percentage => "percentage", state "percentage", Dpt::PERCENT_U8, FunctionFlags::WRITE, ["percent"];
}

fn lookup_table() -> &'static HashMap<&'static str, CanonicalFunction> {
    static TABLE: OnceLock<HashMap<&'static str, CanonicalFunction>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = HashMap::with_capacity(CanonicalFunction::ALL.len() * 3);
        for &function in CanonicalFunction::ALL {
            table.insert(function.as_str(), function);
            for alias in function.aliases() {
                table.entry(*alias).or_insert(function);
            }
        }
        table
    })
}

impl fmt::Display for CanonicalFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for names that resolve to no canonical function
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown function: {0}")]
pub struct UnknownFunction(pub String);

impl FromStr for CanonicalFunction {
    type Err = UnknownFunction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        normalize_function(s).ok_or_else(|| UnknownFunction(s.to_string()))
    }
}

impl Serialize for CanonicalFunction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CanonicalFunction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// ============================================================================
// Normalisation
// ============================================================================

/// Recognised multi-channel prefixes
pub const CHANNEL_PREFIXES: &[&str] = &[
    "ch_a_", "ch_b_", "ch_c_", "ch_d_", "ch_e_", "ch_f_", "ch_g_", "ch_h_", "ch_i_", "ch_j_",
    "ch_k_", "ch_l_", "channel_a_", "channel_b_", "channel_c_", "channel_d_", "channel_e_",
    "channel_f_", "channel_g_", "channel_h_",
];

/// Resolve a canonical name or alias (case-insensitive)
pub fn normalize_function(name: &str) -> Option<CanonicalFunction> {
    let key = name.trim().to_ascii_lowercase();
    lookup_table().get(key.as_str()).copied()
}

/// A function name split into its channel prefix and canonical base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFunction {
    pub prefix: Option<&'static str>,
    pub function: CanonicalFunction,
}

impl ChannelFunction {
    pub fn state_key(&self) -> String {
        match self.prefix {
            Some(prefix) => format!("{}{}", prefix, self.function.state_key()),
            None => self.function.state_key().to_string(),
        }
    }
}

/// Resolve a possibly channel-prefixed name (`ch_a_switch` → `ch_a_` + `switch`)
///
/// Unprefixed names resolve with `prefix: None`. Returns `None` when the base
/// name is not a known function.
pub fn normalize_channel_function(name: &str) -> Option<ChannelFunction> {
    if let Some(function) = normalize_function(name) {
        return Some(ChannelFunction {
            prefix: None,
            function,
        });
    }
    let lower = name.trim().to_ascii_lowercase();
    CHANNEL_PREFIXES.iter().copied().find_map(|prefix| {
        let base = lower.strip_prefix(prefix)?;
        normalize_function(base).map(|function| ChannelFunction {
            prefix: Some(prefix),
            function,
        })
    })
}

/// State field for a function name, falling back to the name itself
pub fn state_key_for_function(name: &str) -> String {
    normalize_channel_function(name)
        .map(|cf| cf.state_key())
        .unwrap_or_else(|| name.to_string())
}

/// Default DPT for a function name
///
/// Used for address entries stored without an explicit DPT. Unknown names fall
/// back to fragment matching; `None` means the type cannot be inferred.
pub fn infer_dpt(name: &str) -> Option<Dpt> {
    if let Some(cf) = normalize_channel_function(name) {
        return Some(cf.function.default_dpt());
    }

    let lower = name.to_ascii_lowercase();
    let has = |fragments: &[&str]| fragments.iter().any(|f| lower.contains(f));
    if has(&["temperature", "setpoint"]) {
        Some(Dpt::TEMPERATURE)
    } else if has(&["humidity"]) {
        Some(Dpt::HUMIDITY)
    } else if has(&["lux"]) {
        Some(Dpt::LUX)
    } else if has(&["brightness", "position", "valve", "slat"]) {
        Some(Dpt::SCALING)
    } else if has(&["switch", "button"]) {
        Some(Dpt::SWITCH)
    } else {
        None
    }
}

/// Default flags for a function name; unknown status/feedback names are read-only
pub fn infer_flags(name: &str) -> FunctionFlags {
    if let Some(cf) = normalize_channel_function(name) {
        return cf.function.default_flags();
    }
    let lower = name.to_ascii_lowercase();
    if lower.contains("status") || lower.contains("feedback") {
        FunctionFlags::READ_TRANSMIT
    } else {
        FunctionFlags::WRITE
    }
}
