//! Device registry
//!
//! In-memory cache of every known device, backed by a [`DeviceRepository`].
//! The cache is rebuilt from the repository at startup and is authoritative
//! while the service runs. Reads return owned clones, so callers can never
//! mutate cached state by reference; every mutation takes the write lock and
//! writes through to the repository.
//!
//! Consumers that need to react to changes call [`DeviceRegistry::subscribe`].
//! The registry knows nothing about messaging.

pub mod device;
pub mod repository;
pub mod sqlite;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{KnxSrvError, Result};

pub use device::{
    normalize_tags, slugify, Device, DeviceAddress, DeviceState, Domain, FunctionAddress,
    HealthStatus, PROTOCOL_KNX,
};
pub use repository::{DeviceRepository, MemoryRepository};
pub use sqlite::SqliteDeviceRepository;

const EVENT_CAPACITY: usize = 1024;

/// Change notification; payloads are independent copies
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// Cache rebuilt from the repository
    Reloaded { count: usize },
    Added(Device),
    Updated(Device),
    Removed(String),
    /// `delta` holds only the fields of this update; `device` the merged result
    StateChanged { device: Device, delta: DeviceState },
    HealthChanged {
        device_id: String,
        status: HealthStatus,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub by_domain: BTreeMap<String, usize>,
    pub by_protocol: BTreeMap<String, usize>,
    pub by_health: BTreeMap<String, usize>,
}

pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
    repository: Arc<dyn DeviceRepository>,
    events: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    pub fn new(repository: Arc<dyn DeviceRepository>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            devices: RwLock::new(HashMap::new()),
            repository,
            events,
        }
    }

    /// Registry over a fresh in-memory repository
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRepository::new()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Reload every device from the repository
    ///
    /// Address entries without a DPT or flags are filled from the function
    /// registry and the migrated record is written back once.
    pub async fn refresh_cache(&self) -> Result<usize> {
        let devices = self.repository.list().await?;

        let mut fresh = HashMap::with_capacity(devices.len());
        let mut migrated = 0usize;
        for mut device in devices {
            if device.address.migrate() {
                migrated += 1;
                self.repository.save(&device).await?;
            }
            let unresolved = device.address.unresolved();
            if !unresolved.is_empty() {
                warn!(
                    "Device {} has functions with unknown DPT: {}",
                    device.id,
                    unresolved.join(", ")
                );
            }
            fresh.insert(device.id.clone(), device);
        }

        let count = fresh.len();
        *self.devices.write() = fresh;

        if migrated > 0 {
            info!("Migrated address maps of {} devices", migrated);
        }
        info!("Device cache refreshed: {} devices", count);
        self.emit(RegistryEvent::Reloaded { count });
        Ok(count)
    }

    pub fn get(&self, id: &str) -> Result<Device> {
        self.devices
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| KnxSrvError::device_not_found(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.read().contains_key(id)
    }

    /// All devices, ordered by id
    pub fn list(&self) -> Vec<Device> {
        self.filtered(|_| true)
    }

    fn filtered(&self, predicate: impl Fn(&Device) -> bool) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .read()
            .values()
            .filter(|d| predicate(d))
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn by_protocol(&self, protocol: &str) -> Vec<Device> {
        self.filtered(|d| d.protocol == protocol)
    }

    pub fn by_domain(&self, domain: Domain) -> Vec<Device> {
        self.filtered(|d| d.domain == domain)
    }

    pub fn by_capability(&self, capability: &str) -> Vec<Device> {
        self.filtered(|d| d.has_capability(capability))
    }

    pub fn by_health(&self, status: HealthStatus) -> Vec<Device> {
        self.filtered(|d| d.health_status == status)
    }

    pub fn by_slug(&self, slug: &str) -> Result<Device> {
        self.devices
            .read()
            .values()
            .find(|d| d.slug == slug)
            .cloned()
            .ok_or_else(|| KnxSrvError::device_not_found(format!("slug {}", slug)))
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let devices = self.devices.read();
        let mut stats = RegistryStats {
            total: devices.len(),
            ..Default::default()
        };
        for device in devices.values() {
            *stats
                .by_domain
                .entry(device.domain.to_string())
                .or_default() += 1;
            *stats
                .by_protocol
                .entry(device.protocol.clone())
                .or_default() += 1;
            *stats
                .by_health
                .entry(device.health_status.to_string())
                .or_default() += 1;
        }
        stats
    }

    fn prepare(device: &mut Device) -> Result<()> {
        if device.id.trim().is_empty() {
            return Err(KnxSrvError::data("device id must not be empty"));
        }
        if device.name.trim().is_empty() {
            return Err(KnxSrvError::data(format!("device {}: name must not be empty", device.id)));
        }
        if device.protocol.trim().is_empty() {
            return Err(KnxSrvError::data(format!("device {}: protocol must not be empty", device.id)));
        }
        if device.slug.is_empty() {
            device.slug = slugify(&device.name);
        }
        device.tags = normalize_tags(&device.tags);
        device.address.migrate();
        Ok(())
    }

    /// Commission a new device
    ///
    /// The repository insert decides between concurrent adds of one id; the
    /// loser gets `DeviceExists` and the cache keeps the winner.
    pub async fn add_device(&self, mut device: Device) -> Result<Device> {
        Self::prepare(&mut device)?;
        if self.contains(&device.id) {
            return Err(KnxSrvError::DeviceExists(device.id));
        }
        let now = Utc::now();
        device.created_at = now;
        device.updated_at = now;

        self.repository.create(&device).await?;
        {
            let mut devices = self.devices.write();
            if devices.contains_key(&device.id) {
                return Err(KnxSrvError::DeviceExists(device.id));
            }
            devices.insert(device.id.clone(), device.clone());
        }

        info!("Device added: {} ({})", device.id, device.name);
        self.emit(RegistryEvent::Added(device.clone()));
        Ok(device)
    }

    /// Replace an existing device's definition
    ///
    /// A rename regenerates the slug unless the caller changed it too.
    pub async fn update_device(&self, mut device: Device) -> Result<Device> {
        let existing = self.get(&device.id)?;
        if device.name != existing.name && device.slug == existing.slug {
            device.slug = slugify(&device.name);
        }
        Self::prepare(&mut device)?;
        device.created_at = existing.created_at;
        device.updated_at = Utc::now();

        self.repository.save(&device).await?;
        self.devices.write().insert(device.id.clone(), device.clone());

        info!("Device updated: {} ({})", device.id, device.name);
        self.emit(RegistryEvent::Updated(device.clone()));
        Ok(device)
    }

    pub async fn remove_device(&self, id: &str) -> Result<()> {
        if !self.contains(id) {
            return Err(KnxSrvError::device_not_found(id));
        }
        self.repository.delete(id).await?;
        self.devices.write().remove(id);

        info!("Device removed: {}", id);
        self.emit(RegistryEvent::Removed(id.to_string()));
        Ok(())
    }

    /// Merge `delta` into a device's state
    ///
    /// Fields not present in `delta` keep their previous values. Returns the
    /// merged device. The cache is updated first; a failed repository write
    /// is logged and does not roll the cache back.
    pub async fn update_state(&self, id: &str, delta: DeviceState) -> Result<Device> {
        let now = Utc::now();
        let device = {
            let mut devices = self.devices.write();
            let device = devices
                .get_mut(id)
                .ok_or_else(|| KnxSrvError::device_not_found(id))?;
            device.merge_state(&delta, now);
            device.clone()
        };

        if let Err(e) = self.repository.save_state(id, &device.state, now).await {
            warn!("Device {} state not persisted: {}", id, e);
        }

        debug!("Device {} state updated: {:?}", id, delta.keys().collect::<Vec<_>>());
        self.emit(RegistryEvent::StateChanged {
            device: device.clone(),
            delta,
        });
        Ok(device)
    }

    /// Record a health status; `online` also refreshes last-seen
    pub async fn set_health(&self, id: &str, status: HealthStatus) -> Result<()> {
        let now = Utc::now();
        let (changed, last_seen) = {
            let mut devices = self.devices.write();
            let device = devices
                .get_mut(id)
                .ok_or_else(|| KnxSrvError::device_not_found(id))?;
            let changed = device.health_status != status;
            device.health_status = status;
            if status == HealthStatus::Online {
                device.health_last_seen = Some(now);
            }
            (changed, device.health_last_seen)
        };

        self.repository.save_health(id, status, last_seen).await?;

        if changed {
            debug!("Device {} health: {}", id, status);
            self.emit(RegistryEvent::HealthChanged {
                device_id: id.to_string(),
                status,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde_json::json;
    use tracing_test::traced_test;
    use voltage_knx::{Dpt, FunctionFlags};

    fn dimmer(id: &str) -> Device {
        Device::new(id, format!("Dimmer {}", id), Domain::Lighting)
            .with_type("light_dimmer")
            .with_capability("dim")
            .with_function(
                "switch",
                FunctionAddress::new("1/0/1".parse().unwrap(), Dpt::SWITCH, FunctionFlags::WRITE),
            )
    }

    fn delta(pairs: &[(&str, serde_json::Value)]) -> DeviceState {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_update_state_merges() {
        let registry = DeviceRegistry::in_memory();
        registry.add_device(dimmer("d1")).await.unwrap();

        registry
            .update_state("d1", delta(&[("switch_status", json!(true))]))
            .await
            .unwrap();
        let device = registry
            .update_state("d1", delta(&[("brightness_status", json!(50))]))
            .await
            .unwrap();

        assert_eq!(device.state["switch_status"], json!(true));
        assert_eq!(device.state["brightness_status"], json!(50));
        assert!(device.state_updated_at.is_some());
    }

    #[tokio::test]
    async fn test_returned_devices_are_isolated() {
        let registry = DeviceRegistry::in_memory();
        registry.add_device(dimmer("d1")).await.unwrap();

        let mut copy = registry.get("d1").unwrap();
        copy.name = "Mutated".into();
        copy.state.insert("switch_status".into(), json!(false));
        copy.address.functions.clear();

        let again = registry.get("d1").unwrap();
        assert_eq!(again.name, "Dimmer d1");
        assert!(again.state.is_empty());
        assert!(again.function("switch").is_some());
    }

    #[tokio::test]
    async fn test_not_found() {
        let registry = DeviceRegistry::in_memory();
        assert!(matches!(
            registry.get("nope").unwrap_err(),
            KnxSrvError::DeviceNotFound(_)
        ));
        assert!(registry.update_state("nope", DeviceState::new()).await.is_err());
        assert!(registry.remove_device("nope").await.is_err());
        assert!(registry
            .set_health("nope", HealthStatus::Online)
            .await
            .is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_refresh_cache_migrates_legacy_entries() {
        let mut legacy = Device::new("old", "Legacy Lamp", Domain::Lighting);
        legacy.address = serde_json::from_value(json!({
            "functions": {
                "switch": {"ga": "2/0/1"},
                "switch_status": {"ga": "2/0/2"},
                "mystery": {"ga": "2/0/9"}
            }
        }))
        .unwrap();
        let repo = Arc::new(MemoryRepository::with_devices([legacy]));
        let registry = DeviceRegistry::new(repo.clone());

        assert_eq!(registry.refresh_cache().await.unwrap(), 1);

        let device = registry.get("old").unwrap();
        assert_eq!(device.function("switch").unwrap().dpt, Some(Dpt::SWITCH));
        assert!(device.function("switch_status").unwrap().is_readable());

        // Written back to the repository
        let stored = repo.get("old").await.unwrap().unwrap();
        assert_eq!(stored.function("switch").unwrap().dpt, Some(Dpt::SWITCH));
        assert!(logs_contain("unknown DPT: mystery"));
    }

    #[tokio::test]
    async fn test_queries_and_stats() {
        let registry = DeviceRegistry::in_memory();
        registry.add_device(dimmer("a")).await.unwrap();
        registry
            .add_device(Device::new("b", "Hall Sensor", Domain::Sensor).with_capability("motion_detect"))
            .await
            .unwrap();
        let mut dali = Device::new("c", "Spot", Domain::Lighting);
        dali.protocol = "dali".into();
        registry.add_device(dali).await.unwrap();
        registry.set_health("a", HealthStatus::Online).await.unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.by_protocol(PROTOCOL_KNX).len(), 2);
        assert_eq!(registry.by_domain(Domain::Lighting).len(), 2);
        assert_eq!(registry.by_capability("motion_detect")[0].id, "b");
        assert_eq!(registry.by_health(HealthStatus::Online)[0].id, "a");
        assert_eq!(registry.by_slug("hall-sensor").unwrap().id, "b");

        let stats = registry.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_domain["lighting"], 2);
        assert_eq!(stats.by_protocol["dali"], 1);
        assert_eq!(stats.by_health["unknown"], 2);
    }

    #[tokio::test]
    async fn test_add_update_remove() {
        let registry = DeviceRegistry::in_memory();
        let added = registry.add_device(dimmer("d1")).await.unwrap();
        assert!(registry.add_device(dimmer("d1")).await.is_err());

        let mut renamed = added.clone();
        renamed.name = "Kitchen Dimmer".into();
        let updated = registry.update_device(renamed).await.unwrap();
        assert_eq!(updated.slug, "kitchen-dimmer");
        assert_eq!(updated.created_at, added.created_at);

        registry.remove_device("d1").await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_devices() {
        let registry = DeviceRegistry::in_memory();
        let err = registry
            .add_device(Device::new("", "x", Domain::Lighting))
            .await
            .unwrap_err();
        assert!(matches!(err, KnxSrvError::Data(_)));
    }

    #[tokio::test]
    async fn test_add_refuses_existing_id() {
        let registry = DeviceRegistry::in_memory();
        registry.add_device(dimmer("d1")).await.unwrap();
        let err = registry.add_device(dimmer("d1")).await.unwrap_err();
        assert!(matches!(err, KnxSrvError::DeviceExists(id) if id == "d1"));
    }

    #[tokio::test]
    async fn test_concurrent_adds_of_one_id_keep_first() {
        let client = common::sqlite::SqliteClient::in_memory().await.unwrap();
        let repo = Arc::new(SqliteDeviceRepository::new(client).await.unwrap());
        let registry = DeviceRegistry::new(repo.clone());
        let mut events = registry.subscribe();

        let mut second = dimmer("d1");
        second.name = "Hallway Dimmer".to_string();
        let (a, b) = tokio::join!(
            registry.add_device(dimmer("d1")),
            registry.add_device(second)
        );

        let winner = match (a, b) {
            (Ok(device), Err(KnxSrvError::DeviceExists(_)))
            | (Err(KnxSrvError::DeviceExists(_)), Ok(device)) => device,
            other => panic!("expected exactly one add to succeed, got {:?}", other),
        };
        assert_eq!(registry.get("d1").unwrap().name, winner.name);
        assert_eq!(repo.get("d1").await.unwrap().unwrap().name, winner.name);
        assert!(matches!(events.try_recv(), Ok(RegistryEvent::Added(_))));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_events_carry_copies() {
        let registry = DeviceRegistry::in_memory();
        let mut events = registry.subscribe();
        registry.add_device(dimmer("d1")).await.unwrap();
        registry
            .update_state("d1", delta(&[("switch_status", json!(true))]))
            .await
            .unwrap();
        registry.set_health("d1", HealthStatus::Offline).await.unwrap();
        registry.set_health("d1", HealthStatus::Offline).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), RegistryEvent::Added(_)));
        match events.recv().await.unwrap() {
            RegistryEvent::StateChanged { mut device, delta } => {
                assert_eq!(delta.len(), 1);
                device.state.clear();
                assert!(!registry.get("d1").unwrap().state.is_empty());
            },
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::HealthChanged {
                status: HealthStatus::Offline,
                ..
            }
        ));
        // Unchanged health emits nothing
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_registry_over_sqlite() {
        let client = common::sqlite::SqliteClient::in_memory().await.unwrap();
        let repo = Arc::new(SqliteDeviceRepository::new(client).await.unwrap());
        let registry = DeviceRegistry::new(repo.clone());
        registry.add_device(dimmer("d1")).await.unwrap();
        registry
            .update_state("d1", delta(&[("switch_status", json!(true))]))
            .await
            .unwrap();

        let reloaded = DeviceRegistry::new(repo);
        reloaded.refresh_cache().await.unwrap();
        assert_eq!(reloaded.get("d1").unwrap().state["switch_status"], json!(true));
    }
}
