//! Command translation
//!
//! Turns a [`CommandMessage`] into a single group write. Everything here is
//! synchronous and does no I/O: a rejected command never reaches the bus.

use serde_json::Value;
use voltage_knx::{encode_value, infer_dpt, state_key_for_function, Dpt, DptValue, GroupAddress, Telegram};

use super::index::DeviceFunctions;
use super::messages::{CommandMessage, Confirmation};
use crate::error::{KnxSrvError, Result};

/// A validated, encoded write ready to send
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedWrite {
    pub device_id: String,
    pub function: String,
    pub ga: GroupAddress,
    pub dpt: Dpt,
    pub value: DptValue,
    pub data: Vec<u8>,
    pub confirmation: Confirmation,
}

impl PlannedWrite {
    pub fn telegram(&self) -> Telegram {
        Telegram::write(self.ga, &self.data, self.dpt.uses_short_frame())
    }
}

fn percent_parameter(cmd: &CommandMessage, name: &str) -> Result<f64> {
    let value = cmd
        .parameters
        .get(name)
        .ok_or_else(|| KnxSrvError::data(format!("{} command requires '{}'", cmd.command, name)))?;
    let number = value
        .as_f64()
        .ok_or_else(|| KnxSrvError::data(format!("'{}' must be a number", name)))?;
    if !(0.0..=100.0).contains(&number) {
        return Err(KnxSrvError::data(format!(
            "'{}' must be 0-100, got {}",
            name, number
        )));
    }
    Ok(number)
}

/// Candidate (function, value) pairs, most specific first
fn candidates(cmd: &CommandMessage) -> Result<Vec<(String, Value)>> {
    let raw_write = cmd.command.is_empty() || cmd.command == "write";
    if raw_write {
        let function = cmd
            .function
            .clone()
            .or_else(|| {
                cmd.parameters
                    .get("function")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .ok_or_else(|| KnxSrvError::data("write requires 'function'"))?;
        let value = cmd
            .value
            .clone()
            .or_else(|| cmd.parameters.get("value").cloned())
            .ok_or_else(|| KnxSrvError::data("write requires 'value'"))?;
        return Ok(vec![(function, value)]);
    }

    let pairs = match cmd.command.as_str() {
        "on" => vec![("switch".to_string(), Value::Bool(true))],
        "off" => vec![("switch".to_string(), Value::Bool(false))],
        "dim" => {
            let level = percent_parameter(cmd, "level")?;
            vec![
                ("brightness".to_string(), Value::from(level)),
                ("switch".to_string(), Value::Bool(level > 0.0)),
            ]
        },
        "set_position" => {
            let position = percent_parameter(cmd, "position")?;
            vec![("position".to_string(), Value::from(position))]
        },
        "stop" => vec![
            ("stop".to_string(), Value::Bool(true)),
            ("move".to_string(), Value::Bool(true)),
        ],
        other => {
            return Err(KnxSrvError::invalid_command(format!(
                "unknown command '{}'",
                other
            )))
        },
    };
    Ok(pairs)
}

/// Validate and encode `cmd` against a device's address map
pub fn plan_write(cmd: &CommandMessage, device: &DeviceFunctions) -> Result<PlannedWrite> {
    let pairs = candidates(cmd)?;
    let (function, address, json) = pairs
        .iter()
        .find_map(|(name, value)| {
            device
                .resolve(name)
                .map(|(key, address)| (key.to_string(), address.clone(), value))
        })
        .ok_or_else(|| {
            let wanted = pairs.first().map(|(n, _)| n.as_str()).unwrap_or_default();
            KnxSrvError::not_configured(&cmd.device_id, wanted)
        })?;

    if !address.is_writable() {
        return Err(KnxSrvError::write_rejected(&cmd.device_id, function));
    }

    let dpt = address
        .dpt
        .or_else(|| infer_dpt(&function))
        .ok_or_else(|| KnxSrvError::data(format!("no DPT for function '{}'", function)))?;
    let value = DptValue::from_json(dpt, json)?;
    let data = encode_value(dpt, &value)?;

    Ok(PlannedWrite {
        device_id: cmd.device_id.clone(),
        confirmation: confirmation_for(device, &function),
        function,
        ga: address.ga,
        dpt,
        value,
        data,
    })
}

/// `Pending` when another function reports into the same state field
fn confirmation_for(device: &DeviceFunctions, function: &str) -> Confirmation {
    let key = state_key_for_function(function);
    let has_feedback = device.functions.iter().any(|(name, address)| {
        name != function
            && (address.flags.read || address.flags.transmit)
            && state_key_for_function(name) == key
    });
    if has_feedback {
        Confirmation::Pending
    } else {
        Confirmation::Unverified
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::registry::FunctionAddress;
    use serde_json::json;
    use voltage_knx::{FunctionFlags, Payload};

    fn ga(s: &str) -> GroupAddress {
        s.parse().unwrap()
    }

    fn dimmer() -> DeviceFunctions {
        let mut device = DeviceFunctions::default();
        device.functions.insert(
            "switch".into(),
            FunctionAddress::new(ga("1/0/1"), Dpt::SWITCH, FunctionFlags::WRITE),
        );
        device.functions.insert(
            "switch_status".into(),
            FunctionAddress::new(ga("1/0/2"), Dpt::SWITCH, FunctionFlags::READ_TRANSMIT),
        );
        device.functions.insert(
            "brightness".into(),
            FunctionAddress::new(ga("1/0/3"), Dpt::SCALING, FunctionFlags::WRITE),
        );
        device
    }

    #[test]
    fn test_on_off() {
        let plan = plan_write(&CommandMessage::named("light-1", "on"), &dimmer()).unwrap();
        assert_eq!(plan.function, "switch");
        assert_eq!(plan.ga, ga("1/0/1"));
        assert_eq!(plan.data, vec![1]);
        assert_eq!(plan.confirmation, Confirmation::Pending);
        assert_eq!(plan.telegram().payload, Payload::Short(1));

        let plan = plan_write(&CommandMessage::named("light-1", "off"), &dimmer()).unwrap();
        assert_eq!(plan.data, vec![0]);
    }

    #[test]
    fn test_dim_scales_percent() {
        let cmd = CommandMessage::named("light-1", "dim").with_parameter("level", json!(100));
        let plan = plan_write(&cmd, &dimmer()).unwrap();
        assert_eq!(plan.function, "brightness");
        assert_eq!(plan.data, vec![255]);
        // No brightness_status address
        assert_eq!(plan.confirmation, Confirmation::Unverified);
        assert_eq!(plan.telegram().payload, Payload::Long(vec![255]));
    }

    #[test]
    fn test_dim_falls_back_to_switch() {
        let mut device = dimmer();
        device.functions.remove("brightness");
        let cmd = CommandMessage::named("light-1", "dim").with_parameter("level", json!(30));
        let plan = plan_write(&cmd, &device).unwrap();
        assert_eq!(plan.function, "switch");
        assert_eq!(plan.value, DptValue::Bool(true));
    }

    #[test]
    fn test_dim_parameter_validation() {
        let missing = CommandMessage::named("light-1", "dim");
        assert!(matches!(plan_write(&missing, &dimmer()), Err(KnxSrvError::Data(_))));

        let high = CommandMessage::named("light-1", "dim").with_parameter("level", json!(101));
        assert!(matches!(plan_write(&high, &dimmer()), Err(KnxSrvError::Data(_))));

        let text = CommandMessage::named("light-1", "dim").with_parameter("level", json!("50"));
        assert!(matches!(plan_write(&text, &dimmer()), Err(KnxSrvError::Data(_))));
    }

    #[test]
    fn test_raw_write_to_read_only_function_is_rejected() {
        let mut device = dimmer();
        device.functions.insert(
            "brightness".into(),
            FunctionAddress::new(ga("1/0/3"), Dpt::SCALING, FunctionFlags::READ_TRANSMIT),
        );
        let cmd = CommandMessage::write("light-1", "brightness", json!(75));
        let err = plan_write(&cmd, &device).unwrap_err();
        assert!(matches!(err, KnxSrvError::WriteRejected { ref function, .. } if function == "brightness"));
    }

    #[test]
    fn test_raw_write_via_parameters() {
        let cmd = CommandMessage::named("light-1", "write")
            .with_parameter("function", json!("brightness"))
            .with_parameter("value", json!(50));
        let plan = plan_write(&cmd, &dimmer()).unwrap();
        assert_eq!(plan.ga, ga("1/0/3"));
        assert_eq!(plan.data, vec![128]);
    }

    #[test]
    fn test_stop_falls_back_to_move() {
        let mut device = DeviceFunctions::default();
        device.functions.insert(
            "move".into(),
            FunctionAddress::new(ga("2/0/1"), Dpt::UP_DOWN, FunctionFlags::WRITE),
        );
        let plan = plan_write(&CommandMessage::named("blind-1", "stop"), &device).unwrap();
        assert_eq!(plan.function, "move");
        assert_eq!(plan.data, vec![1]);
    }

    #[test]
    fn test_unknown_command_and_missing_function() {
        let err = plan_write(&CommandMessage::named("light-1", "explode"), &dimmer()).unwrap_err();
        assert!(matches!(err, KnxSrvError::InvalidCommand(_)));

        let cmd = CommandMessage::named("light-1", "set_position").with_parameter("position", json!(10));
        let err = plan_write(&cmd, &dimmer()).unwrap_err();
        assert!(matches!(err, KnxSrvError::NotConfigured { ref function, .. } if function == "position"));
    }
}
