//! Address indices
//!
//! Forward (device → function → address) and reverse (address → device,
//! function) lookups over the registry's KNX devices. Both are rebuilt
//! together and swapped under one lock, so readers never see a half-built
//! index.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use voltage_knx::{infer_dpt, normalize_channel_function, Dpt, FunctionFlags, GroupAddress};

use crate::error::{KnxSrvError, Result};
use crate::registry::{Device, Domain, FunctionAddress};

/// One function of one device bound to a group address
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub device_id: String,
    pub function: String,
    pub dpt: Option<Dpt>,
    pub flags: FunctionFlags,
}

/// A device's address map as seen by the bridge
#[derive(Debug, Clone, Default)]
pub struct DeviceFunctions {
    pub functions: BTreeMap<String, FunctionAddress>,
    pub infrastructure: bool,
}

impl DeviceFunctions {
    /// Find a function by exact name, then by canonical equivalence
    ///
    /// `dim` finds a `brightness` entry, `ch_a_on_off` a `ch_a_switch` entry.
    pub fn resolve(&self, name: &str) -> Option<(&str, &FunctionAddress)> {
        if let Some((key, address)) = self.functions.get_key_value(name) {
            return Some((key.as_str(), address));
        }
        let wanted = normalize_channel_function(name)?;
        self.functions
            .iter()
            .find(|(key, _)| normalize_channel_function(key) == Some(wanted))
            .map(|(key, address)| (key.as_str(), address))
    }
}

#[derive(Debug, Default)]
struct Indices {
    by_address: HashMap<GroupAddress, Vec<Binding>>,
    by_device: HashMap<String, DeviceFunctions>,
}

#[derive(Debug, Default)]
pub struct AddressIndex {
    inner: RwLock<Indices>,
}

impl AddressIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from `devices`; non-KNX devices are ignored
    ///
    /// Returns the number of devices indexed.
    pub fn rebuild(&self, devices: &[Device]) -> usize {
        let mut indices = Indices::default();
        for device in devices.iter().filter(|d| d.is_knx()) {
            for (function, address) in &device.address.functions {
                indices
                    .by_address
                    .entry(address.ga)
                    .or_default()
                    .push(Binding {
                        device_id: device.id.clone(),
                        function: function.clone(),
                        dpt: address.dpt.or_else(|| infer_dpt(function)),
                        flags: address.flags,
                    });
            }
            indices.by_device.insert(
                device.id.clone(),
                DeviceFunctions {
                    functions: device.address.functions.clone(),
                    infrastructure: device.domain == Domain::Infrastructure,
                },
            );
        }
        let count = indices.by_device.len();
        *self.inner.write() = indices;
        count
    }

    /// Every binding on `ga`, in device id order
    pub fn lookup(&self, ga: GroupAddress) -> Vec<Binding> {
        let mut bindings = self
            .inner
            .read()
            .by_address
            .get(&ga)
            .cloned()
            .unwrap_or_default();
        bindings.sort_by(|a, b| {
            a.device_id
                .cmp(&b.device_id)
                .then_with(|| a.function.cmp(&b.function))
        });
        bindings
    }

    pub fn is_modeled(&self, ga: GroupAddress) -> bool {
        self.inner.read().by_address.contains_key(&ga)
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceFunctions> {
        self.inner.read().by_device.get(device_id).cloned()
    }

    /// Look up the address for a device function
    pub fn resolve(&self, device_id: &str, function: &str) -> Result<(String, FunctionAddress)> {
        let inner = self.inner.read();
        let device = inner
            .by_device
            .get(device_id)
            .ok_or_else(|| KnxSrvError::device_not_found(device_id))?;
        device
            .resolve(function)
            .map(|(name, address)| (name.to_string(), address.clone()))
            .ok_or_else(|| KnxSrvError::not_configured(device_id, function))
    }

    /// Distinct readable addresses, in address order
    pub fn readable_addresses(&self, skip_infrastructure: bool) -> Vec<GroupAddress> {
        let inner = self.inner.read();
        let set: BTreeSet<GroupAddress> = inner
            .by_device
            .values()
            .filter(|d| !(skip_infrastructure && d.infrastructure))
            .flat_map(|d| d.functions.values())
            .filter(|f| f.is_readable())
            .map(|f| f.ga)
            .collect();
        set.into_iter().collect()
    }

    pub fn device_count(&self) -> usize {
        self.inner.read().by_device.len()
    }

    pub fn address_count(&self) -> usize {
        self.inner.read().by_address.len()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn ga(s: &str) -> GroupAddress {
        s.parse().unwrap()
    }

    fn devices() -> Vec<Device> {
        let light = Device::new("light-1", "Kitchen Light", Domain::Lighting)
            .with_function(
                "switch",
                FunctionAddress::new(ga("1/0/1"), Dpt::SWITCH, FunctionFlags::WRITE),
            )
            .with_function(
                "switch_status",
                FunctionAddress::new(ga("1/0/2"), Dpt::SWITCH, FunctionFlags::READ_TRANSMIT),
            )
            .with_function(
                "brightness",
                FunctionAddress::new(ga("1/0/3"), Dpt::SCALING, FunctionFlags::WRITE),
            );
        // Shares the central switch address with the kitchen light
        let hall = Device::new("light-2", "Hall Light", Domain::Lighting).with_function(
            "switch",
            FunctionAddress::new(ga("1/0/1"), Dpt::SWITCH, FunctionFlags::WRITE),
        );
        let psu = Device::new("psu-1", "Power Supply", Domain::Infrastructure).with_function(
            "alarm",
            FunctionAddress::new(ga("0/0/1"), Dpt::ALARM, FunctionFlags::READ_TRANSMIT),
        );
        let mut other = Device::new("dali-1", "DALI", Domain::Lighting);
        other.protocol = "dali".to_string();
        vec![light, hall, psu, other]
    }

    #[test]
    fn test_rebuild_and_lookup() {
        let index = AddressIndex::new();
        assert_eq!(index.rebuild(&devices()), 3);
        assert_eq!(index.device_count(), 3);
        assert_eq!(index.address_count(), 4);

        let shared = index.lookup(ga("1/0/1"));
        assert_eq!(shared.len(), 2);
        assert_eq!(shared[0].device_id, "light-1");
        assert_eq!(shared[1].device_id, "light-2");
        assert_eq!(shared[0].dpt, Some(Dpt::SWITCH));

        assert!(index.lookup(ga("9/9/9")).is_empty());
        assert!(!index.is_modeled(ga("9/9/9")));
        assert!(index.device("dali-1").is_none());
    }

    #[test]
    fn test_resolve_exact_and_alias() {
        let index = AddressIndex::new();
        index.rebuild(&devices());

        let (name, address) = index.resolve("light-1", "brightness").unwrap();
        assert_eq!(name, "brightness");
        assert_eq!(address.ga, ga("1/0/3"));

        let (name, _) = index.resolve("light-1", "dim").unwrap();
        assert_eq!(name, "brightness");

        assert!(matches!(
            index.resolve("light-1", "position"),
            Err(KnxSrvError::NotConfigured { .. })
        ));
        assert!(matches!(
            index.resolve("nope", "switch"),
            Err(KnxSrvError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_readable_addresses_skip_infrastructure() {
        let index = AddressIndex::new();
        index.rebuild(&devices());
        assert_eq!(index.readable_addresses(true), vec![ga("1/0/2")]);
        assert_eq!(index.readable_addresses(false), vec![ga("0/0/1"), ga("1/0/2")]);
    }

    #[test]
    fn test_rebuild_replaces_previous_index() {
        let index = AddressIndex::new();
        index.rebuild(&devices());
        index.rebuild(&[]);
        assert_eq!(index.device_count(), 0);
        assert!(index.lookup(ga("1/0/1")).is_empty());
    }
}
