//! Passive group address discovery
//!
//! Every telegram seen on the bus is recorded here, modeled or not, along
//! with devices the bus monitor sees talking point to point. The
//! recorder backs the `discovery/knx` publication and supplies the daemon
//! manager with addresses known to answer reads for its bus-level check.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use voltage_knx::{Apci, GroupAddress, IndividualAddress, LDataFrame, Telegram};

use super::messages::{ObservedAddress, ObservedDevice};
use crate::daemon::{BusObserver, GroupAddressProvider};

#[derive(Debug, Clone)]
struct AddressRecord {
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    message_count: u64,
    has_read_response: bool,
    last_health_check: Option<DateTime<Utc>>,
    sources: BTreeSet<IndividualAddress>,
}

#[derive(Debug, Clone)]
struct DeviceRecord {
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    message_count: u64,
    group_addresses: BTreeSet<GroupAddress>,
}

#[derive(Debug, Default)]
struct Records {
    addresses: HashMap<GroupAddress, AddressRecord>,
    devices: HashMap<IndividualAddress, DeviceRecord>,
}

impl Records {
    fn touch_device(&mut self, source: IndividualAddress, now: DateTime<Utc>) -> &mut DeviceRecord {
        let device = self.devices.entry(source).or_insert_with(|| DeviceRecord {
            first_seen: now,
            last_seen: now,
            message_count: 0,
            group_addresses: BTreeSet::new(),
        });
        device.last_seen = now;
        device.message_count += 1;
        device
    }
}

#[derive(Debug, Default)]
pub struct GroupAddressRecorder {
    records: Mutex<Records>,
}

impl GroupAddressRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, telegram: &Telegram) {
        self.record_at(telegram, Utc::now());
    }

    fn record_at(&self, telegram: &Telegram, now: DateTime<Utc>) {
        let ga = telegram.destination;
        let source = telegram.source;
        let mut records = self.records.lock();

        let entry = records.addresses.entry(ga).or_insert_with(|| AddressRecord {
            first_seen: now,
            last_seen: now,
            message_count: 0,
            has_read_response: false,
            last_health_check: None,
            sources: BTreeSet::new(),
        });
        entry.last_seen = now;
        entry.message_count += 1;
        if telegram.apci == Apci::Response {
            entry.has_read_response = true;
        }
        // Our own reads arrive with an unspecified source
        if source.is_unspecified() {
            return;
        }
        entry.sources.insert(source);
        records.touch_device(source, now).group_addresses.insert(ga);
    }

    /// Record a bus monitor frame
    ///
    /// Group value telegrams also arrive on the group socket and are counted
    /// there; every other frame only marks its source device as seen.
    pub fn record_frame(&self, frame: &LDataFrame) {
        self.record_frame_at(frame, Utc::now());
    }

    fn record_frame_at(&self, frame: &LDataFrame, now: DateTime<Utc>) {
        if frame.source.is_unspecified() || frame.telegram().is_some() {
            return;
        }
        self.records.lock().touch_device(frame.source, now);
    }

    pub fn address_count(&self) -> usize {
        self.records.lock().addresses.len()
    }

    pub fn device_count(&self) -> usize {
        self.records.lock().devices.len()
    }

    /// Observed addresses in address order; `modeled` marks indexed ones
    pub fn addresses(&self, modeled: impl Fn(GroupAddress) -> bool) -> Vec<ObservedAddress> {
        let records = self.records.lock();
        let mut out: Vec<(GroupAddress, ObservedAddress)> = records
            .addresses
            .iter()
            .map(|(ga, r)| {
                (
                    *ga,
                    ObservedAddress {
                        address: ga.to_string(),
                        first_seen: r.first_seen,
                        last_seen: r.last_seen,
                        message_count: r.message_count,
                        has_read_response: r.has_read_response,
                        sources: r.sources.iter().map(ToString::to_string).collect(),
                        modeled: modeled(*ga),
                    },
                )
            })
            .collect();
        out.sort_by_key(|(ga, _)| *ga);
        out.into_iter().map(|(_, a)| a).collect()
    }

    pub fn devices(&self) -> Vec<ObservedDevice> {
        let records = self.records.lock();
        let mut out: Vec<(IndividualAddress, ObservedDevice)> = records
            .devices
            .iter()
            .map(|(ia, r)| {
                (
                    *ia,
                    ObservedDevice {
                        individual_address: ia.to_string(),
                        first_seen: r.first_seen,
                        last_seen: r.last_seen,
                        message_count: r.message_count,
                        group_addresses: r.group_addresses.iter().map(ToString::to_string).collect(),
                    },
                )
            })
            .collect();
        out.sort_by_key(|(ia, _)| *ia);
        out.into_iter().map(|(_, d)| d).collect()
    }
}

impl BusObserver for GroupAddressRecorder {
    fn observe(&self, frame: &LDataFrame) {
        self.record_frame(frame);
    }
}

impl GroupAddressProvider for GroupAddressRecorder {
    /// Responders first, least recently checked next, most recently seen last
    fn health_check_addresses(&self, limit: usize) -> Vec<GroupAddress> {
        let records = self.records.lock();
        let mut candidates: Vec<(&GroupAddress, &AddressRecord)> =
            records.addresses.iter().collect();
        candidates.sort_by_key(|(ga, r)| {
            (
                Reverse(r.has_read_response),
                r.last_health_check,
                Reverse(r.last_seen),
                **ga,
            )
        });
        candidates
            .into_iter()
            .take(limit)
            .map(|(ga, _)| *ga)
            .collect()
    }

    fn mark_health_check_used(&self, ga: GroupAddress) {
        if let Some(record) = self.records.lock().addresses.get_mut(&ga) {
            record.last_health_check = Some(Utc::now());
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use chrono::Duration;

    fn telegram(src: &str, dst: &str, apci: Apci) -> Telegram {
        let mut t = match apci {
            Apci::Read => Telegram::read(dst.parse().unwrap()),
            Apci::Response => Telegram::response(dst.parse().unwrap(), &[1], true),
            Apci::Write => Telegram::write(dst.parse().unwrap(), &[1], true),
        };
        t.source = src.parse().unwrap();
        t
    }

    #[test]
    fn test_records_addresses_and_sources() {
        let recorder = GroupAddressRecorder::new();
        recorder.record(&telegram("1.1.5", "1/0/1", Apci::Write));
        recorder.record(&telegram("1.1.6", "1/0/1", Apci::Write));
        recorder.record(&telegram("1.1.5", "1/0/2", Apci::Response));
        recorder.record(&telegram("0.0.0", "1/0/3", Apci::Read));

        assert_eq!(recorder.address_count(), 3);
        assert_eq!(recorder.device_count(), 2);

        let addresses = recorder.addresses(|ga| ga.to_string() == "1/0/1");
        assert_eq!(addresses[0].address, "1/0/1");
        assert_eq!(addresses[0].message_count, 2);
        assert_eq!(addresses[0].sources, vec!["1.1.5", "1.1.6"]);
        assert!(addresses[0].modeled);
        assert!(addresses[1].has_read_response);
        assert!(!addresses[1].modeled);
        assert!(addresses[2].sources.is_empty());

        let devices = recorder.devices();
        assert_eq!(devices[0].individual_address, "1.1.5");
        assert_eq!(devices[0].group_addresses, vec!["1/0/1", "1/0/2"]);
    }

    #[test]
    fn test_health_check_candidate_order() {
        let recorder = GroupAddressRecorder::new();
        let t0 = Utc::now();
        recorder.record_at(&telegram("1.1.1", "1/0/1", Apci::Write), t0);
        recorder.record_at(&telegram("1.1.1", "1/0/2", Apci::Write), t0 + Duration::seconds(5));
        recorder.record_at(&telegram("1.1.1", "1/0/3", Apci::Response), t0);

        let order = recorder.health_check_addresses(10);
        let names: Vec<String> = order.iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["1/0/3", "1/0/2", "1/0/1"]);

        // A used address rotates behind the others with the same response flag
        recorder.mark_health_check_used("1/0/2".parse().unwrap());
        let names: Vec<String> = recorder
            .health_check_addresses(2)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(names, vec!["1/0/3", "1/0/1"]);
    }

    #[test]
    fn test_monitor_frames_add_point_to_point_devices() {
        let recorder = GroupAddressRecorder::new();
        recorder.record(&telegram("1.1.5", "1/0/1", Apci::Write));

        // The same write seen by the monitor is not counted twice
        let write = LDataFrame::decode(&[0xBC, 0x11, 0x05, 0x08, 0x01, 0xE1, 0x00, 0x81]).unwrap();
        recorder.observe(&write);
        // DeviceDescriptor_Read 1.1.1 -> 1.1.20 never reaches the group socket
        let p2p = LDataFrame::decode(&[0xB0, 0x11, 0x01, 0x11, 0x14, 0x61, 0x43, 0x00]).unwrap();
        recorder.observe(&p2p);
        recorder.observe(&p2p);

        assert_eq!(recorder.address_count(), 1);
        assert_eq!(recorder.addresses(|_| false)[0].message_count, 1);
        let devices = recorder.devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].individual_address, "1.1.1");
        assert_eq!(devices[0].message_count, 2);
        assert!(devices[0].group_addresses.is_empty());
        assert_eq!(devices[1].individual_address, "1.1.5");
        assert_eq!(devices[1].message_count, 1);
    }
}
