use anyhow::Result;
use async_trait::async_trait;
use shared::types::Device;

/// Storage operations the health pipeline needs on devices.
/// The SQLite-backed `DeviceStoreHandle` implements this in production.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Look a device up by its normalized MAC address
    async fn find_by_mac_address(&self, mac_address: &str) -> Result<Option<Device>>;

    /// Persist the status and last-seen time of a known device
    async fn update(&self, device: Device) -> Result<()>;

    /// Insert a new device or refresh the address of a known one
    async fn register(&self, device: Device) -> Result<Device>;

    async fn list(&self) -> Result<Vec<Device>>;
}
