use std::thread;
use tokio::sync::{mpsc, oneshot};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::types::Device;
use crate::repository::DeviceRepository;
use crate::store::db::DeviceDb;

/// Commands sent to the store thread
pub enum StoreCommand {
    Register(Device, oneshot::Sender<Result<Device>>),
    Update(Device, oneshot::Sender<Result<bool>>),
    GetOne(String, oneshot::Sender<Result<Option<Device>>>),
    GetAll(oneshot::Sender<Result<Vec<Device>>>),
    Shutdown,
}

/// Handle to the device database. The connection lives on a dedicated
/// thread; every call is a message round trip.
#[derive(Clone)]
pub struct DeviceStoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl DeviceStoreHandle {
    /// Spawn a new store thread owning the given database
    pub fn spawn(db: DeviceDb) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::Register(device, reply) => {
                        let _ = reply.send(db.register_device(&device));
                    }
                    StoreCommand::Update(device, reply) => {
                        let _ = reply.send(db.update_device(&device));
                    }
                    StoreCommand::GetOne(mac_address, reply) => {
                        let _ = reply.send(db.get_device(&mac_address));
                    }
                    StoreCommand::GetAll(reply) => {
                        let _ = reply.send(db.get_all_devices());
                    }
                    StoreCommand::Shutdown => {
                        tracing::info!("Device store thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    pub async fn get_one(&self, mac_address: String) -> Result<Option<Device>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetOne(mac_address, reply)).await?;
        rx.await?
    }

    pub async fn get_all(&self) -> Result<Vec<Device>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetAll(reply)).await?;
        rx.await?
    }

    /// Shutdown the store thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(StoreCommand::Shutdown).await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceRepository for DeviceStoreHandle {
    async fn find_by_mac_address(&self, mac_address: &str) -> Result<Option<Device>> {
        self.get_one(mac_address.to_string()).await
    }

    async fn update(&self, device: Device) -> Result<()> {
        let mac_address = device.mac_address.clone();
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::Update(device, reply)).await?;

        if rx.await?? {
            Ok(())
        } else {
            Err(anyhow!("Device {} not found", mac_address))
        }
    }

    async fn register(&self, device: Device) -> Result<Device> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::Register(device, reply)).await?;
        rx.await?
    }

    async fn list(&self) -> Result<Vec<Device>> {
        self.get_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::DeviceStatus;

    fn store() -> DeviceStoreHandle {
        DeviceStoreHandle::spawn(DeviceDb::open(":memory:").unwrap())
    }

    #[tokio::test]
    async fn test_repository_round_trip() {
        let store = store();
        let repo: &dyn DeviceRepository = &store;

        let device = Device::register("AA:BB:CC:DD:EE:FF", "192.168.1.100", None).unwrap();
        repo.register(device).await.unwrap();

        let mut found = repo.find_by_mac_address("AA:BB:CC:DD:EE:FF").await.unwrap().unwrap();
        assert_eq!(found.status, DeviceStatus::Registered);

        found.set_status(DeviceStatus::Offline);
        repo.update(found).await.unwrap();

        let reloaded = repo.find_by_mac_address("AA:BB:CC:DD:EE:FF").await.unwrap().unwrap();
        assert_eq!(reloaded.status, DeviceStatus::Offline);
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_update_keeps_newer_registration() {
        let store = store();
        let repo: &dyn DeviceRepository = &store;

        repo.register(Device::register("AA:BB:CC:DD:EE:FF", "10.0.0.1", None).unwrap())
            .await
            .unwrap();
        let mut found = repo.find_by_mac_address("AA:BB:CC:DD:EE:FF").await.unwrap().unwrap();

        // The device moves before the status write lands
        repo.register(Device::register("AA:BB:CC:DD:EE:FF", "10.0.0.2", None).unwrap())
            .await
            .unwrap();

        found.set_status(DeviceStatus::Online);
        repo.update(found).await.unwrap();

        let stored = repo.find_by_mac_address("AA:BB:CC:DD:EE:FF").await.unwrap().unwrap();
        assert_eq!(stored.ip_address, "10.0.0.2");
        assert_eq!(stored.status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn test_update_unknown_device_fails() {
        let store = store();
        let repo: &dyn DeviceRepository = &store;

        let device = Device::register("AA:BB:CC:DD:EE:FF", "192.168.1.100", None).unwrap();
        assert!(repo.update(device).await.is_err());
        assert!(repo.find_by_mac_address("AA:BB:CC:DD:EE:FF").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_calls_fail_after_shutdown() {
        let store = store();
        store.shutdown().await.unwrap();

        // Give the thread a moment to drop its receiver
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(store.get_all().await.is_err());
    }
}
