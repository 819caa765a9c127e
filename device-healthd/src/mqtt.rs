use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use shared::types::{Device, DeviceDetectedEvent};
use crate::config::MqttConfig;
use crate::dedup::EventDeduplicator;
use crate::health::use_case::DeviceHealthUseCase;
use crate::repository::DeviceRepository;

/// Registration message published by irrigation devices
#[derive(Debug, Deserialize)]
pub struct RegistrationMessage {
    pub mac_address: String,
    pub ip_address: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Device-side send time. Redelivered messages keep it, which lets the
    /// deduplicator recognise them.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// Device stored and a health check scheduled
    Scheduled,
    /// Device stored, detection already seen
    Duplicate,
}

/// Turns registration payloads into stored devices and health checks.
pub struct RegistrationHandler {
    repository: Arc<dyn DeviceRepository>,
    dedup: Arc<EventDeduplicator>,
    health: Arc<DeviceHealthUseCase>,
}

impl RegistrationHandler {
    pub fn new(
        repository: Arc<dyn DeviceRepository>,
        dedup: Arc<EventDeduplicator>,
        health: Arc<DeviceHealthUseCase>,
    ) -> Self {
        Self { repository, dedup, health }
    }

    pub async fn handle(
        &self,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<RegistrationOutcome> {
        let message: RegistrationMessage = serde_json::from_slice(payload)
            .context("Invalid registration payload")?;

        let device = Device::register(&message.mac_address, &message.ip_address, message.name)?;
        let device = self.repository.register(device).await?;

        let detected_at = message.timestamp.unwrap_or_else(Utc::now);
        let event = DeviceDetectedEvent::with_timestamp(
            &device.mac_address,
            &device.ip_address,
            detected_at,
        )?;

        let scheduled = self.dedup.accept_with(&event, |event| {
            self.health.process_device_detected_event(cancel, Some(event.clone()))
        })?;

        if scheduled {
            Ok(RegistrationOutcome::Scheduled)
        } else {
            Ok(RegistrationOutcome::Duplicate)
        }
    }
}

/// Subscribe to the registration topic and feed every message to `handler`
/// until cancelled.
pub async fn run_listener(
    config: MqttConfig,
    handler: Arc<RegistrationHandler>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut opts = MqttOptions::new(&config.client_id, &config.host, config.port);
    opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

    let (client, mut eventloop) = AsyncClient::new(opts, 10);
    tracing::info!("Connecting to MQTT broker {}:{}", config.host, config.port);

    loop {
        tokio::select! {
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // Subscriptions do not survive a clean-session reconnect
                        client
                            .subscribe(&config.registration_topic, QoS::AtLeastOnce)
                            .await
                            .context("Failed to subscribe to registration topic")?;
                        tracing::info!("Subscribed to {}", config.registration_topic);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish)))
                        if publish.topic == config.registration_topic =>
                    {
                        match handler.handle(&publish.payload, &cancel).await {
                            Ok(RegistrationOutcome::Scheduled) => {}
                            Ok(RegistrationOutcome::Duplicate) => {
                                tracing::debug!("Ignored duplicate registration");
                            }
                            Err(e) => {
                                tracing::warn!("Dropped registration message: {:#}", e);
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("MQTT connection error: {}", e);
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                            _ = cancel.cancelled() => {}
                        }
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("MQTT listener shutting down");
                if let Err(e) = client.disconnect().await {
                    tracing::debug!("MQTT disconnect failed: {}", e);
                }
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use crate::device_store::DeviceStoreHandle;
    use crate::health::checker::MockDeviceHealthChecker;
    use crate::store::db::DeviceDb;
    use shared::types::DeviceStatus;

    struct Fixture {
        store: DeviceStoreHandle,
        dedup: Arc<EventDeduplicator>,
        health: Arc<DeviceHealthUseCase>,
        handler: RegistrationHandler,
    }

    fn fixture(alive: bool) -> Fixture {
        let store = DeviceStoreHandle::spawn(DeviceDb::open(":memory:").unwrap());
        let mut checker = MockDeviceHealthChecker::new();
        checker.expect_check_health().returning(move |_| Ok(alive));

        let dedup = Arc::new(EventDeduplicator::new(Duration::from_secs(3600)));
        let health = Arc::new(DeviceHealthUseCase::new(
            Arc::new(store.clone()),
            Arc::new(checker),
            &HealthConfig::default(),
        ));
        let handler = RegistrationHandler::new(Arc::new(store.clone()), dedup.clone(), health.clone());

        Fixture { store, dedup, health, handler }
    }

    #[tokio::test]
    async fn test_registration_schedules_health_check() {
        let f = fixture(true);
        let payload = br#"{"mac_address":"aa:bb:cc:dd:ee:ff","ip_address":"192.168.1.100","name":"valve-1"}"#;

        let outcome = f.handler.handle(payload, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RegistrationOutcome::Scheduled);

        f.health.shutdown().await;

        let device = f.store.get_one("AA:BB:CC:DD:EE:FF".to_string()).await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.name.as_deref(), Some("valve-1"));
        assert_eq!(f.dedup.event_count(), 1);
    }

    #[tokio::test]
    async fn test_redelivered_message_is_duplicate() {
        let f = fixture(false);
        let payload = br#"{"mac_address":"AA:BB:CC:DD:EE:FF","ip_address":"10.0.0.7","timestamp":"2024-05-01T10:00:00Z"}"#;
        let cancel = CancellationToken::new();

        assert_eq!(f.handler.handle(payload, &cancel).await.unwrap(), RegistrationOutcome::Scheduled);
        assert_eq!(f.handler.handle(payload, &cancel).await.unwrap(), RegistrationOutcome::Duplicate);

        f.health.shutdown().await;

        let device = f.store.get_one("AA:BB:CC:DD:EE:FF".to_string()).await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Offline);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_rejected() {
        let f = fixture(true);
        let cancel = CancellationToken::new();

        assert!(f.handler.handle(b"not json", &cancel).await.is_err());
        assert!(f
            .handler
            .handle(br#"{"mac_address":"nope","ip_address":"10.0.0.7"}"#, &cancel)
            .await
            .is_err());

        assert!(f.store.get_all().await.unwrap().is_empty());
        assert_eq!(f.dedup.event_count(), 0);
    }

    #[tokio::test]
    async fn test_listener_stops_promptly_during_broker_outage() {
        // Reserve a port and close it so every connect attempt is refused
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = MqttConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..MqttConfig::default()
        };

        let f = fixture(true);
        let cancel = CancellationToken::new();
        let listener = tokio::spawn(run_listener(config, Arc::new(f.handler), cancel.clone()));

        // Let the first connect fail and the retry back-off start
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_millis(500), listener)
            .await
            .expect("listener did not stop within the back-off");
        assert!(result.unwrap().is_ok());
    }
}
