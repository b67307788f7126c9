//! Durable device storage behind the registry cache

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::device::{normalize_tags, Device, DeviceState, HealthStatus};
use crate::error::{KnxSrvError, Result};

/// Persistence for device records
///
/// The registry loads everything through `list` at startup and writes through
/// on every mutation. Implementations own their own synchronisation.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// All devices, tags included, ordered by id
    async fn list(&self) -> Result<Vec<Device>>;

    async fn get(&self, id: &str) -> Result<Option<Device>>;

    /// Insert a new record; an existing id fails with `DeviceExists`
    async fn create(&self, device: &Device) -> Result<()>;

    /// Insert or replace the full record
    async fn save(&self, device: &Device) -> Result<()>;

    /// Returns false when nothing was deleted
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Persist the merged state snapshot
    async fn save_state(&self, id: &str, state: &DeviceState, at: DateTime<Utc>) -> Result<()>;

    async fn save_health(
        &self,
        id: &str,
        status: HealthStatus,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

/// Non-durable repository for tests and `storage.sqlite_path: ""`
#[derive(Debug, Default)]
pub struct MemoryRepository {
    devices: RwLock<BTreeMap<String, Device>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let repo = Self::new();
        {
            let mut map = repo.devices.write();
            for mut device in devices {
                device.tags = normalize_tags(&device.tags);
                map.insert(device.id.clone(), device);
            }
        }
        repo
    }
}

#[async_trait]
impl DeviceRepository for MemoryRepository {
    async fn list(&self) -> Result<Vec<Device>> {
        Ok(self.devices.read().values().cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Device>> {
        Ok(self.devices.read().get(id).cloned())
    }

    async fn create(&self, device: &Device) -> Result<()> {
        let mut devices = self.devices.write();
        if devices.contains_key(&device.id) {
            return Err(KnxSrvError::DeviceExists(device.id.clone()));
        }
        let mut device = device.clone();
        device.tags = normalize_tags(&device.tags);
        devices.insert(device.id.clone(), device);
        Ok(())
    }

    async fn save(&self, device: &Device) -> Result<()> {
        let mut device = device.clone();
        device.tags = normalize_tags(&device.tags);
        self.devices.write().insert(device.id.clone(), device);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.devices.write().remove(id).is_some())
    }

    async fn save_state(&self, id: &str, state: &DeviceState, at: DateTime<Utc>) -> Result<()> {
        let mut devices = self.devices.write();
        let device = devices
            .get_mut(id)
            .ok_or_else(|| KnxSrvError::device_not_found(id))?;
        device.state = state.clone();
        device.state_updated_at = Some(at);
        Ok(())
    }

    async fn save_health(
        &self,
        id: &str,
        status: HealthStatus,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut devices = self.devices.write();
        let device = devices
            .get_mut(id)
            .ok_or_else(|| KnxSrvError::device_not_found(id))?;
        device.health_status = status;
        device.health_last_seen = last_seen;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::registry::device::Domain;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_repository_crud() {
        let repo = MemoryRepository::new();
        let mut device = Device::new("b", "Blind", Domain::Blinds);
        device.tags = vec!["South".into(), "south".into()];
        repo.save(&device).await.unwrap();
        repo.save(&Device::new("a", "Lamp", Domain::Lighting))
            .await
            .unwrap();

        let ids: Vec<_> = repo.list().await.unwrap().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(repo.get("b").await.unwrap().unwrap().tags, vec!["south"]);

        assert!(repo.delete("a").await.unwrap());
        assert!(!repo.delete("a").await.unwrap());
        assert!(repo.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_repository_state_and_health() {
        let repo = MemoryRepository::with_devices([Device::new("a", "Lamp", Domain::Lighting)]);
        let mut state = DeviceState::new();
        state.insert("switch_status".into(), json!(true));
        let now = Utc::now();
        repo.save_state("a", &state, now).await.unwrap();
        repo.save_health("a", HealthStatus::Online, Some(now))
            .await
            .unwrap();

        let stored = repo.get("a").await.unwrap().unwrap();
        assert_eq!(stored.state["switch_status"], json!(true));
        assert_eq!(stored.health_status, HealthStatus::Online);

        let err = repo.save_state("missing", &state, now).await.unwrap_err();
        assert!(matches!(err, KnxSrvError::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn test_memory_repository_create_refuses_existing_id() {
        let repo = MemoryRepository::new();
        repo.create(&Device::new("a", "Lamp", Domain::Lighting))
            .await
            .unwrap();
        let err = repo
            .create(&Device::new("a", "Other Lamp", Domain::Lighting))
            .await
            .unwrap_err();
        assert!(matches!(err, KnxSrvError::DeviceExists(id) if id == "a"));
        assert_eq!(repo.get("a").await.unwrap().unwrap().name, "Lamp");
    }
}
