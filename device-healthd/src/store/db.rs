use std::path::Path;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, params, OptionalExtension};
use shared::types::{Device, DeviceStatus};

const DEVICE_COLUMNS: &str =
    "mac_address, ip_address, name, status, last_seen, registered_at";

pub struct DeviceDb {
    conn: Connection,
}

impl DeviceDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                mac_address   TEXT PRIMARY KEY,
                ip_address    TEXT NOT NULL,
                name          TEXT,
                status        TEXT NOT NULL,
                last_seen     TEXT NOT NULL,
                registered_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_device_status ON devices(status);
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Insert a device, or refresh address and name of a known one.
    /// Status and registration time of a known device are kept.
    pub fn register_device(&self, device: &Device) -> Result<Device> {
        self.conn.execute(
            r#"
            INSERT INTO devices (mac_address, ip_address, name, status, last_seen, registered_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(mac_address) DO UPDATE SET
                ip_address = excluded.ip_address,
                name = COALESCE(excluded.name, devices.name),
                last_seen = excluded.last_seen
            "#,
            params![
                &device.mac_address,
                &device.ip_address,
                &device.name,
                device.status.as_str(),
                device.last_seen.to_rfc3339(),
                device.registered_at.to_rfc3339(),
            ],
        )
        .context("Failed to register device")?;

        self.get_device(&device.mac_address)?
            .with_context(|| format!("Device {} missing after register", device.mac_address))
    }

    /// Write status and last-seen time of an existing device. Address and
    /// name belong to registration and are left alone. Returns false if no
    /// such device exists.
    pub fn update_device(&self, device: &Device) -> Result<bool> {
        let count = self.conn.execute(
            "UPDATE devices SET status = ?1, last_seen = ?2 WHERE mac_address = ?3",
            params![
                device.status.as_str(),
                device.last_seen.to_rfc3339(),
                &device.mac_address,
            ],
        )
        .context("Failed to update device")?;

        Ok(count > 0)
    }

    pub fn get_device(&self, mac_address: &str) -> Result<Option<Device>> {
        let result = self
            .conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE mac_address = ?1", DEVICE_COLUMNS),
                params![mac_address],
                Self::row_to_device,
            )
            .optional()
            .context("Failed to query device")?;

        Ok(result)
    }

    pub fn get_all_devices(&self) -> Result<Vec<Device>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM devices ORDER BY mac_address", DEVICE_COLUMNS))
            .context("Failed to prepare query")?;

        let devices = stmt
            .query_map([], Self::row_to_device)
            .context("Failed to query devices")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect devices")?;

        Ok(devices)
    }

    fn row_to_device(row: &rusqlite::Row) -> Result<Device, rusqlite::Error> {
        let status_str: String = row.get(3)?;
        let last_seen_str: String = row.get(4)?;
        let registered_at_str: String = row.get(5)?;

        let status = status_str
            .parse::<DeviceStatus>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?;

        let last_seen = chrono::DateTime::parse_from_rfc3339(&last_seen_str)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?
            .with_timezone(&Utc);

        let registered_at = chrono::DateTime::parse_from_rfc3339(&registered_at_str)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?
            .with_timezone(&Utc);

        Ok(Device {
            mac_address: row.get(0)?,
            ip_address: row.get(1)?,
            name: row.get(2)?,
            status,
            last_seen,
            registered_at,
        })
    }
}
