use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use shared::types::{DeviceDetectedEvent, DeviceStatus, ValidationError};
use crate::config::HealthConfig;
use crate::health::checker::DeviceHealthChecker;
use crate::repository::DeviceRepository;

/// Errors returned synchronously by the front door. Everything that goes
/// wrong after the health check is scheduled is only logged.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("device detected event is missing")]
    NilEvent,
    #[error("invalid device detected event: {0}")]
    InvalidEvent(#[from] ValidationError),
    #[error("failed to schedule health check: {0}")]
    SpawnFailed(String),
}

/// Reacts to device-detected events by probing the device and recording
/// whether it is online or offline.
///
/// At most `max_concurrent` probes run at once. Callers are never blocked on
/// the network: accepted events are checked on a background task.
pub struct DeviceHealthUseCase {
    repository: Arc<dyn DeviceRepository>,
    checker: Arc<dyn DeviceHealthChecker>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    tasks: TaskTracker,
}

impl DeviceHealthUseCase {
    pub fn new(
        repository: Arc<dyn DeviceRepository>,
        checker: Arc<dyn DeviceHealthChecker>,
        config: &HealthConfig,
    ) -> Self {
        let max_concurrent = if config.max_concurrent == 0 {
            tracing::warn!(
                event = "invalid_config",
                "max_concurrent is 0, running health checks one at a time"
            );
            1
        } else {
            config.max_concurrent
        };

        Self {
            repository,
            checker,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            tasks: TaskTracker::new(),
        }
    }

    /// Validate `event` and schedule its health check.
    ///
    /// Returns before the check runs. `cancel` only matters while the task
    /// waits for a free slot; once a slot is held the probe and the status
    /// write run to completion.
    pub fn process_device_detected_event(
        &self,
        cancel: &CancellationToken,
        event: Option<DeviceDetectedEvent>,
    ) -> Result<(), HealthError> {
        let Some(event) = event else {
            tracing::warn!(event = "validation_failed", "Rejected missing device detected event");
            return Err(HealthError::NilEvent);
        };

        if let Err(e) = event.validate() {
            tracing::warn!(
                mac_address = %event.mac_address,
                event = "validation_failed",
                error = %e,
                "Rejected invalid device detected event"
            );
            return Err(e.into());
        }

        let handle = Handle::try_current().map_err(|e| {
            tracing::error!(
                mac_address = %event.mac_address,
                event = "spawn_failed",
                error = %e,
                "No runtime available for health check"
            );
            HealthError::SpawnFailed(e.to_string())
        })?;

        let job = HealthCheckJob {
            repository: self.repository.clone(),
            checker: self.checker.clone(),
            semaphore: self.semaphore.clone(),
            cancel: cancel.clone(),
            event,
        };

        self.tasks.spawn_on(job.run(), &handle);
        Ok(())
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Health checks currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    /// Wait for every scheduled health check to finish.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

fn resolve_status(alive: bool) -> DeviceStatus {
    if alive {
        DeviceStatus::Online
    } else {
        DeviceStatus::Offline
    }
}

/// One scheduled health-check-and-update sequence.
struct HealthCheckJob {
    repository: Arc<dyn DeviceRepository>,
    checker: Arc<dyn DeviceHealthChecker>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    event: DeviceDetectedEvent,
}

impl HealthCheckJob {
    async fn run(self) {
        let mac = self.event.mac_address.as_str();

        // Released on every return path below
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::info!(
                    mac_address = %mac,
                    event = "health_check_abandoned",
                    "Cancelled while waiting for a health check slot"
                );
                return;
            }
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::error!(
                        mac_address = %mac,
                        event = "health_check_abandoned",
                        error = %e,
                        "Health check semaphore closed"
                    );
                    return;
                }
            },
        };

        let alive = match self.checker.check_health(&self.event.ip_address).await {
            Ok(true) => {
                tracing::info!(
                    mac_address = %mac,
                    ip_address = %self.event.ip_address,
                    event = "health_check_passed",
                    "Device is alive"
                );
                true
            }
            Ok(false) => {
                tracing::warn!(
                    mac_address = %mac,
                    ip_address = %self.event.ip_address,
                    event = "health_check_failed",
                    "Device is not alive"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    mac_address = %mac,
                    ip_address = %self.event.ip_address,
                    event = "health_check_error",
                    error = %e,
                    "Health check did not complete"
                );
                false
            }
        };

        self.update_status(resolve_status(alive)).await;
    }

    async fn update_status(&self, status: DeviceStatus) {
        let mac = self.event.mac_address.as_str();

        let mut device = match self.repository.find_by_mac_address(mac).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                tracing::error!(
                    mac_address = %mac,
                    event = "device_not_found",
                    "Detected device is not registered"
                );
                return;
            }
            Err(e) => {
                tracing::error!(
                    mac_address = %mac,
                    event = "device_lookup_failed",
                    error = %e,
                    "Failed to load device"
                );
                return;
            }
        };

        let previous = device.status;
        device.set_status(status);

        match self.repository.update(device).await {
            Ok(()) => tracing::info!(
                mac_address = %mac,
                event = "status_updated",
                from = %previous,
                to = %status,
                "Device status updated"
            ),
            Err(e) => tracing::error!(
                mac_address = %mac,
                event = "status_update_failed",
                error = %e,
                "Failed to persist device status"
            ),
        }
    }
}
