//! SQLite device repository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::sqlite::SqliteClient;
use serde_json::{Map, Value};
use sqlx::{sqlite::SqliteRow, Row};
use std::collections::HashMap;
use tracing::debug;

use super::device::{normalize_tags, Device, DeviceAddress, DeviceState, HealthStatus};
use super::repository::DeviceRepository;
use crate::error::{ErrorExt, KnxSrvError, Result};

/// SQLite keeps the bound-parameter limit low on older builds
const TAG_QUERY_CHUNK: usize = 500;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS devices (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        slug TEXT NOT NULL,
        room_id TEXT,
        area_id TEXT,
        type TEXT NOT NULL,
        domain TEXT NOT NULL,
        protocol TEXT NOT NULL,
        address TEXT NOT NULL DEFAULT '{}',
        capabilities TEXT NOT NULL DEFAULT '[]',
        config TEXT NOT NULL DEFAULT '{}',
        state TEXT NOT NULL DEFAULT '{}',
        state_updated_at TEXT,
        health_status TEXT NOT NULL DEFAULT 'unknown',
        health_last_seen TEXT,
        manufacturer TEXT,
        model TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_devices_domain ON devices(domain)",
    "CREATE INDEX IF NOT EXISTS idx_devices_protocol ON devices(protocol)",
    r#"
    CREATE TABLE IF NOT EXISTS device_tags (
        device_id TEXT NOT NULL,
        tag TEXT NOT NULL,
        PRIMARY KEY (device_id, tag),
        FOREIGN KEY (device_id) REFERENCES devices(id) ON DELETE CASCADE
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_device_tags_tag ON device_tags(tag)",
];

const SELECT_DEVICES: &str = r#"
    SELECT id, name, slug, room_id, area_id, type, domain, protocol, address,
           capabilities, config, state, state_updated_at, health_status,
           health_last_seen, manufacturer, model, created_at, updated_at
    FROM devices
"#;

const INSERT_DEVICE: &str = r#"
    INSERT INTO devices (id, name, slug, room_id, area_id, type, domain, protocol,
                         address, capabilities, config, state, state_updated_at,
                         health_status, health_last_seen, manufacturer, model,
                         created_at, updated_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

const UPSERT_DEVICE: &str = r#"
    ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                slug = excluded.slug,
                room_id = excluded.room_id,
                area_id = excluded.area_id,
                type = excluded.type,
                domain = excluded.domain,
                protocol = excluded.protocol,
                address = excluded.address,
                capabilities = excluded.capabilities,
                config = excluded.config,
                state = excluded.state,
                state_updated_at = excluded.state_updated_at,
                health_status = excluded.health_status,
                health_last_seen = excluded.health_last_seen,
                manufacturer = excluded.manufacturer,
                model = excluded.model,
                updated_at = excluded.updated_at
"#;

pub struct SqliteDeviceRepository {
    client: SqliteClient,
}

impl SqliteDeviceRepository {
    /// Wrap an open client and create the schema if missing
    pub async fn new(client: SqliteClient) -> Result<Self> {
        let repo = Self { client };
        repo.migrate().await?;
        Ok(repo)
    }

    pub async fn open(path: &str) -> Result<Self> {
        let client = SqliteClient::new(path)
            .await
            .storage_error("Failed to open device database")?;
        Self::new(client).await
    }

    pub fn client(&self) -> &SqliteClient {
        &self.client
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(self.client.pool()).await?;
        }
        Ok(())
    }

    /// Write the device row and its tags in one transaction
    ///
    /// Without `upsert` an existing id fails with `DeviceExists`.
    async fn write(&self, device: &Device, upsert: bool) -> Result<()> {
        let address = serde_json::to_string(&device.address)?;
        let capabilities = serde_json::to_string(&device.capabilities)?;
        let config = serde_json::to_string(&device.config)?;
        let state = serde_json::to_string(&device.state)?;

        let sql = if upsert {
            format!("{}{}", INSERT_DEVICE, UPSERT_DEVICE)
        } else {
            INSERT_DEVICE.to_string()
        };

        let mut tx = self.client.pool().begin().await?;
        sqlx::query(&sql)
            .bind(&device.id)
            .bind(&device.name)
            .bind(&device.slug)
            .bind(&device.room_id)
            .bind(&device.area_id)
            .bind(&device.device_type)
            .bind(device.domain.as_str())
            .bind(&device.protocol)
            .bind(&address)
            .bind(&capabilities)
            .bind(&config)
            .bind(&state)
            .bind(device.state_updated_at.as_ref().map(to_text))
            .bind(device.health_status.as_str())
            .bind(device.health_last_seen.as_ref().map(to_text))
            .bind(&device.manufacturer)
            .bind(&device.model)
            .bind(to_text(&device.created_at))
            .bind(to_text(&device.updated_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    KnxSrvError::DeviceExists(device.id.clone())
                },
                e => e.into(),
            })?;

        sqlx::query("DELETE FROM device_tags WHERE device_id = ?")
            .bind(&device.id)
            .execute(&mut *tx)
            .await?;
        for tag in normalize_tags(&device.tags) {
            sqlx::query("INSERT INTO device_tags (device_id, tag) VALUES (?, ?)")
                .bind(&device.id)
                .bind(&tag)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Tags for many devices in one round-trip per chunk
    async fn tags_for(&self, ids: &[String]) -> Result<HashMap<String, Vec<String>>> {
        let mut tags: HashMap<String, Vec<String>> = HashMap::new();
        for chunk in ids.chunks(TAG_QUERY_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT device_id, tag FROM device_tags WHERE device_id IN ({}) ORDER BY device_id, tag",
                placeholders
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            let rows = query.fetch_all(self.client.pool()).await?;
            for row in rows {
                let device_id: String = row.try_get("device_id")?;
                let tag: String = row.try_get("tag")?;
                tags.entry(device_id).or_default().push(tag);
            }
        }
        Ok(tags)
    }
}

fn to_text(at: &DateTime<Utc>) -> String {
    at.to_rfc3339()
}

fn parse_time(column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .data_error(&format!("Invalid timestamp in column {}", column))
}

fn parse_optional_time(column: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(|v| parse_time(column, v)).transpose()
}

fn hydrate_device(row: &SqliteRow) -> Result<Device> {
    let id: String = row.try_get("id")?;
    let domain: String = row.try_get("domain")?;
    let health: String = row.try_get("health_status")?;
    let address: String = row.try_get("address")?;
    let capabilities: String = row.try_get("capabilities")?;
    let config: String = row.try_get("config")?;
    let state: String = row.try_get("state")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Device {
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        room_id: row.try_get("room_id")?,
        area_id: row.try_get("area_id")?,
        device_type: row.try_get("type")?,
        domain: domain
            .parse()
            .map_err(|e: String| KnxSrvError::data(format!("device {}: {}", id, e)))?,
        protocol: row.try_get("protocol")?,
        address: serde_json::from_str::<DeviceAddress>(&address)
            .data_error(&format!("device {}: address map", id))?,
        capabilities: serde_json::from_str(&capabilities)?,
        config: serde_json::from_str::<Map<String, Value>>(&config)?,
        state: serde_json::from_str::<DeviceState>(&state)?,
        state_updated_at: parse_optional_time("state_updated_at", row.try_get("state_updated_at")?)?,
        // Unknown health strings degrade to `unknown`
        health_status: health.parse().unwrap_or_default(),
        health_last_seen: parse_optional_time("health_last_seen", row.try_get("health_last_seen")?)?,
        manufacturer: row.try_get("manufacturer")?,
        model: row.try_get("model")?,
        tags: Vec::new(),
        created_at: parse_time("created_at", &created_at)?,
        updated_at: parse_time("updated_at", &updated_at)?,
        id,
    })
}

#[async_trait]
impl DeviceRepository for SqliteDeviceRepository {
    async fn list(&self) -> Result<Vec<Device>> {
        let sql = format!("{} ORDER BY id", SELECT_DEVICES);
        let rows = sqlx::query(&sql).fetch_all(self.client.pool()).await?;

        let mut devices = rows.iter().map(hydrate_device).collect::<Result<Vec<_>>>()?;
        let ids: Vec<String> = devices.iter().map(|d| d.id.clone()).collect();
        let mut tags = self.tags_for(&ids).await?;
        for device in &mut devices {
            device.tags = tags.remove(&device.id).unwrap_or_default();
        }
        debug!("Loaded {} devices from SQLite", devices.len());
        Ok(devices)
    }

    async fn get(&self, id: &str) -> Result<Option<Device>> {
        let sql = format!("{} WHERE id = ?", SELECT_DEVICES);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.client.pool())
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut device = hydrate_device(&row)?;
        device.tags = self
            .tags_for(std::slice::from_ref(&device.id))
            .await?
            .remove(&device.id)
            .unwrap_or_default();
        Ok(Some(device))
    }

    async fn create(&self, device: &Device) -> Result<()> {
        self.write(device, false).await
    }

    async fn save(&self, device: &Device) -> Result<()> {
        self.write(device, true).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM devices WHERE id = ?")
            .bind(id)
            .execute(self.client.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_state(&self, id: &str, state: &DeviceState, at: DateTime<Utc>) -> Result<()> {
        let state = serde_json::to_string(state)?;
        let result = sqlx::query(
            "UPDATE devices SET state = ?, state_updated_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&state)
        .bind(to_text(&at))
        .bind(to_text(&at))
        .bind(id)
        .execute(self.client.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(KnxSrvError::device_not_found(id));
        }
        Ok(())
    }

    async fn save_health(
        &self,
        id: &str,
        status: HealthStatus,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE devices SET health_status = ?, health_last_seen = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(last_seen.as_ref().map(to_text))
                .bind(id)
                .execute(self.client.pool())
                .await?;
        if result.rows_affected() == 0 {
            return Err(KnxSrvError::device_not_found(id));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::registry::device::{Domain, FunctionAddress};
    use serde_json::json;
    use voltage_knx::{Dpt, FunctionFlags};

    async fn repo() -> SqliteDeviceRepository {
        SqliteDeviceRepository::new(SqliteClient::in_memory().await.unwrap())
            .await
            .unwrap()
    }

    fn dimmer(id: &str) -> Device {
        let mut device = Device::new(id, format!("Dimmer {}", id), Domain::Lighting)
            .with_type("light_dimmer")
            .with_capability("on_off")
            .with_capability("dim")
            .with_function(
                "switch",
                FunctionAddress::new("1/0/1".parse().unwrap(), Dpt::SWITCH, FunctionFlags::WRITE),
            )
            .with_function(
                "brightness_status",
                FunctionAddress::new(
                    "1/0/4".parse().unwrap(),
                    Dpt::SCALING,
                    FunctionFlags::READ_TRANSMIT,
                ),
            );
        device.tags = vec!["Accent".into(), "dimmable".into(), "accent ".into()];
        device
    }

    #[tokio::test]
    async fn test_save_and_list_with_tags() {
        let repo = repo().await;
        repo.save(&dimmer("a")).await.unwrap();
        repo.save(&dimmer("b")).await.unwrap();

        let devices = repo.list().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, "a");
        assert_eq!(devices[0].tags, vec!["accent", "dimmable"]);
        assert_eq!(devices[1].tags, vec!["accent", "dimmable"]);

        let stored = repo.get("a").await.unwrap().unwrap();
        let original = dimmer("a");
        assert_eq!(stored.address, original.address);
        assert_eq!(stored.capabilities, vec!["on_off", "dim"]);
        assert_eq!(stored.domain, Domain::Lighting);
    }

    #[tokio::test]
    async fn test_upsert_replaces_tags() {
        let repo = repo().await;
        let mut device = dimmer("a");
        repo.save(&device).await.unwrap();
        device.tags = vec!["kitchen".into()];
        device.name = "Kitchen dimmer".into();
        repo.save(&device).await.unwrap();

        let stored = repo.get("a").await.unwrap().unwrap();
        assert_eq!(stored.tags, vec!["kitchen"]);
        assert_eq!(stored.name, "Kitchen dimmer");
    }

    #[tokio::test]
    async fn test_create_refuses_existing_id() {
        let repo = repo().await;
        let mut device = dimmer("a");
        device.tags = vec!["kitchen".into()];
        repo.create(&device).await.unwrap();

        let mut duplicate = dimmer("a");
        duplicate.name = "Impostor".into();
        duplicate.tags = vec!["hall".into()];
        let err = repo.create(&duplicate).await.unwrap_err();
        assert!(matches!(err, KnxSrvError::DeviceExists(id) if id == "a"));

        let stored = repo.get("a").await.unwrap().unwrap();
        assert_eq!(stored.name, device.name);
        assert_eq!(stored.tags, vec!["kitchen"]);
    }

    #[tokio::test]
    async fn test_state_and_health_updates() {
        let repo = repo().await;
        repo.save(&dimmer("a")).await.unwrap();

        let mut state = DeviceState::new();
        state.insert("switch_status".into(), json!(true));
        let at = Utc::now();
        repo.save_state("a", &state, at).await.unwrap();
        repo.save_health("a", HealthStatus::Online, Some(at))
            .await
            .unwrap();

        let stored = repo.get("a").await.unwrap().unwrap();
        assert_eq!(stored.state["switch_status"], json!(true));
        assert_eq!(stored.state_updated_at, Some(at));
        assert_eq!(stored.health_status, HealthStatus::Online);

        let err = repo.save_state("zzz", &state, at).await.unwrap_err();
        assert!(matches!(err, KnxSrvError::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_cascades_tags() {
        let repo = repo().await;
        repo.save(&dimmer("a")).await.unwrap();
        assert!(repo.delete("a").await.unwrap());
        assert!(!repo.delete("a").await.unwrap());

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM device_tags")
            .fetch_one(repo.client().pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.db");
        let path = path.to_str().unwrap();
        {
            let repo = SqliteDeviceRepository::open(path).await.unwrap();
            repo.save(&dimmer("a")).await.unwrap();
            repo.client().close().await;
        }
        let repo = SqliteDeviceRepository::open(path).await.unwrap();
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }
}
