use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use shared::types::DeviceDetectedEvent;

/// Keeps the newest accepted detection per device and drops anything that is
/// not strictly newer.
///
/// The window only bounds memory: entries older than `now - window` are
/// evicted by [`EventDeduplicator::cleanup`]. Rejection is decided purely by
/// comparing `detected_at` against the stored event.
pub struct EventDeduplicator {
    latest: Mutex<HashMap<String, DeviceDetectedEvent>>,
    window: chrono::Duration,
}

impl EventDeduplicator {
    pub fn new(window: Duration) -> Self {
        let window = chrono::Duration::from_std(window)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        Self {
            latest: Mutex::new(HashMap::new()),
            window,
        }
    }

    /// Returns true if `event` is the newest sighting of its device, recording
    /// it as such. Equal timestamps count as duplicates.
    pub fn should_process(&self, event: Option<&DeviceDetectedEvent>) -> bool {
        let Some(event) = event else {
            return false;
        };

        matches!(
            self.accept_with(event, |_| Ok::<(), std::convert::Infallible>(())),
            Ok(true)
        )
    }

    /// Like [`EventDeduplicator::should_process`], but `event` is only recorded
    /// once `schedule` succeeds. A failed `schedule` leaves the stored event
    /// untouched so a redelivery is still accepted.
    ///
    /// `schedule` runs under the dedup lock and must not block.
    pub fn accept_with<E>(
        &self,
        event: &DeviceDetectedEvent,
        schedule: impl FnOnce(&DeviceDetectedEvent) -> Result<(), E>,
    ) -> Result<bool, E> {
        let mut latest = self.latest.lock();
        if let Some(seen) = latest.get(&event.mac_address) {
            if seen.detected_at >= event.detected_at {
                tracing::debug!(
                    mac_address = %event.mac_address,
                    event_id = %event.event_id,
                    "Dropping stale device detection"
                );
                return Ok(false);
            }
        }

        schedule(event)?;
        latest.insert(event.mac_address.clone(), event.clone());
        Ok(true)
    }

    pub fn latest_event(&self, mac_address: &str) -> Option<DeviceDetectedEvent> {
        self.latest.lock().get(mac_address).cloned()
    }

    /// Evict entries detected before `now - window`. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now())
    }

    pub fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now.checked_sub_signed(self.window).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut latest = self.latest.lock();
        let before = latest.len();
        latest.retain(|_, event| event.detected_at >= cutoff);
        before - latest.len()
    }

    pub fn event_count(&self) -> usize {
        self.latest.lock().len()
    }
}

/// Periodically evicts expired dedup entries until cancelled.
pub async fn run_cleanup(
    dedup: Arc<EventDeduplicator>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = dedup.cleanup();
                if removed > 0 {
                    tracing::info!(
                        removed,
                        remaining = dedup.event_count(),
                        "Evicted expired device detections"
                    );
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Dedup cleanup shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_at(mac: &str, detected_at: DateTime<Utc>) -> DeviceDetectedEvent {
        DeviceDetectedEvent::with_timestamp(mac, "192.168.1.100", detected_at).unwrap()
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_newer_event_replaces_older() {
        let dedup = EventDeduplicator::new(Duration::from_secs(3600));
        let e1 = event_at("AA:BB:CC:DD:EE:01", ts(1));
        let e2 = event_at("AA:BB:CC:DD:EE:01", ts(2));

        assert!(dedup.should_process(Some(&e1)));
        assert!(dedup.should_process(Some(&e2)));
        assert_eq!(dedup.latest_event("AA:BB:CC:DD:EE:01"), Some(e2.clone()));

        // Replaying the older event is rejected and leaves e2 in place
        assert!(!dedup.should_process(Some(&e1)));
        assert_eq!(dedup.latest_event("AA:BB:CC:DD:EE:01"), Some(e2));
    }

    #[test]
    fn test_equal_timestamp_is_duplicate() {
        let dedup = EventDeduplicator::new(Duration::from_secs(3600));
        let first = event_at("AA:BB:CC:DD:EE:01", ts(5));
        let redelivered = event_at("AA:BB:CC:DD:EE:01", ts(5));

        assert!(dedup.should_process(Some(&first)));
        assert!(!dedup.should_process(Some(&redelivered)));
        assert_eq!(dedup.latest_event("AA:BB:CC:DD:EE:01").unwrap().event_id, first.event_id);
    }

    #[test]
    fn test_devices_are_independent() {
        let dedup = EventDeduplicator::new(Duration::from_secs(3600));

        assert!(dedup.should_process(Some(&event_at("AA:BB:CC:DD:EE:01", ts(10)))));
        assert!(dedup.should_process(Some(&event_at("AA:BB:CC:DD:EE:02", ts(1)))));
        assert!(!dedup.should_process(Some(&event_at("AA:BB:CC:DD:EE:01", ts(10)))));
        assert!(dedup.should_process(Some(&event_at("AA:BB:CC:DD:EE:02", ts(2)))));
        assert_eq!(dedup.event_count(), 2);
    }

    #[test]
    fn test_none_event_is_rejected() {
        let dedup = EventDeduplicator::new(Duration::from_secs(3600));
        assert!(!dedup.should_process(None));
        assert_eq!(dedup.event_count(), 0);
    }

    #[test]
    fn test_failed_schedule_is_not_recorded() {
        let dedup = EventDeduplicator::new(Duration::from_secs(3600));
        let e1 = event_at("AA:BB:CC:DD:EE:01", ts(1));
        let e2 = event_at("AA:BB:CC:DD:EE:01", ts(2));
        assert!(dedup.should_process(Some(&e1)));

        let result = dedup.accept_with(&e2, |_| Err("no runtime"));
        assert_eq!(result, Err("no runtime"));
        assert_eq!(dedup.latest_event("AA:BB:CC:DD:EE:01"), Some(e1));

        // The redelivery goes through once scheduling works
        let redelivered = event_at("AA:BB:CC:DD:EE:01", ts(2));
        assert_eq!(dedup.accept_with(&redelivered, |_| Ok::<(), &str>(())), Ok(true));
        assert_eq!(dedup.latest_event("AA:BB:CC:DD:EE:01"), Some(redelivered));
    }

    #[test]
    fn test_stale_event_is_not_scheduled() {
        let dedup = EventDeduplicator::new(Duration::from_secs(3600));
        assert!(dedup.should_process(Some(&event_at("AA:BB:CC:DD:EE:01", ts(5)))));

        let mut scheduled = false;
        let result = dedup.accept_with(&event_at("AA:BB:CC:DD:EE:01", ts(5)), |_| {
            scheduled = true;
            Ok::<(), &str>(())
        });
        assert_eq!(result, Ok(false));
        assert!(!scheduled);
    }

    #[test]
    fn test_latest_event_unknown_device() {
        let dedup = EventDeduplicator::new(Duration::from_secs(3600));
        assert!(dedup.latest_event("AA:BB:CC:DD:EE:01").is_none());
    }

    #[test]
    fn test_cleanup_evicts_old_entries() {
        let dedup = EventDeduplicator::new(Duration::from_secs(3600));
        let now = Utc::now();

        dedup.should_process(Some(&event_at("AA:BB:CC:DD:EE:01", now - chrono::Duration::hours(2))));
        dedup.should_process(Some(&event_at("AA:BB:CC:DD:EE:02", now - chrono::Duration::minutes(30))));
        assert_eq!(dedup.event_count(), 2);

        let removed = dedup.cleanup_at(now);
        assert_eq!(removed, 1);
        assert_eq!(dedup.event_count(), 1);
        assert!(dedup.latest_event("AA:BB:CC:DD:EE:01").is_none());
        assert!(dedup.latest_event("AA:BB:CC:DD:EE:02").is_some());
    }

    #[test]
    fn test_concurrent_replays_accept_once() {
        let dedup = Arc::new(EventDeduplicator::new(Duration::from_secs(3600)));
        let event = event_at("AA:BB:CC:DD:EE:01", ts(42));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dedup = dedup.clone();
                let event = event.clone();
                std::thread::spawn(move || dedup.should_process(Some(&event)))
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|accepted| *accepted)
            .count();

        assert_eq!(accepted, 1);
    }

    #[tokio::test]
    async fn test_run_cleanup_stops_on_cancel() {
        let dedup = Arc::new(EventDeduplicator::new(Duration::from_secs(60)));
        dedup.should_process(Some(&event_at(
            "AA:BB:CC:DD:EE:01",
            Utc::now() - chrono::Duration::hours(1),
        )));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_cleanup(dedup.clone(), Duration::from_secs(10), cancel.clone()));

        // The first tick fires immediately
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dedup.event_count(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
