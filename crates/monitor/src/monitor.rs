//! Shared pipeline state and the per-kind message handlers.
//!
//! Each event fans out into independent side effects (event log, daily
//! counters, notification). They run concurrently and each one logs its own
//! failure; none of them can cancel a sibling.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::{OffsetDateTime, UtcOffset};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::alerts::{AlertDeduplicator, AlertKind, MetricCheck, Thresholds};
use crate::db::Db;
use crate::error::{MonitorError, MonitorResult};
use crate::eventlog::{AccessRecord, ErrorRecord, FeedingRecord};
use crate::mqtt::{AccessEvent, AccessStatus, DeviceTelemetry, ErrorReport, FeedingEvent, TelemetryKind};
use crate::notify::{self, Notification, Notifier, PushDelivery};
use crate::presence::{PresenceRegistry, PresenceState};
use crate::stats::StatisticsAggregator;

pub type SharedMonitor = Arc<Monitor>;

pub struct Monitor {
    pub presence: PresenceRegistry,
    pub alerts: AlertDeduplicator,
    pub db: Db,
    pub stats: StatisticsAggregator,
    pub notifier: Notifier,
    pub thresholds: Thresholds,
    /// Reference offset for day boundaries.
    pub tz: UtcOffset,
    pub started_at: Instant,
    mqtt_connected: AtomicBool,
}

impl Monitor {
    pub fn new(db: Db, delivery: Arc<dyn PushDelivery>, thresholds: Thresholds, tz: UtcOffset) -> Self {
        Self {
            presence: PresenceRegistry::new(),
            alerts: AlertDeduplicator::new(),
            stats: StatisticsAggregator::new(Arc::new(db.clone())),
            notifier: Notifier::new(db.clone(), delivery),
            db,
            thresholds,
            tz,
            started_at: Instant::now(),
            mqtt_connected: AtomicBool::new(false),
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn mqtt_connected(&self) -> bool {
        self.mqtt_connected.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Presence
    // -----------------------------------------------------------------------

    /// Mark the device as seen. A device with an open offline alert gets it
    /// cleared and exactly one reconnect notification.
    pub async fn touch(&self, device_id: &str, snapshot: Value, now: OffsetDateTime) {
        let touched = self.presence.touch(device_id, snapshot, now, &self.alerts);
        match touched.previous {
            None => info!(device = %device_id, "first sighting"),
            Some(PresenceState::Offline) => debug!(device = %device_id, "presence restored"),
            Some(PresenceState::Online) => {}
        }

        if touched.reconnected {
            info!(device = %device_id, "device back online");
            self.notify(device_id, "reconnect", |name| {
                notify::reconnected_notification(device_id, name)
            })
            .await;
        }
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    pub async fn handle_heartbeat(&self, device_id: &str, payload: &Value, now: OffsetDateTime) -> MonitorResult<()> {
        self.handle_telemetry(TelemetryKind::Heartbeat, device_id, payload, now).await
    }

    pub async fn handle_status(&self, device_id: &str, payload: &Value, now: OffsetDateTime) -> MonitorResult<()> {
        self.handle_telemetry(TelemetryKind::Status, device_id, payload, now).await
    }

    async fn handle_telemetry(
        &self,
        kind: TelemetryKind,
        device_id: &str,
        payload: &Value,
        now: OffsetDateTime,
    ) -> MonitorResult<()> {
        let t: DeviceTelemetry = decode(kind, payload)?;
        debug!(
            device = %device_id,
            %kind,
            battery = ?t.battery_level,
            wifi = ?t.wifi_signal,
            free_memory = ?t.free_memory,
            "telemetry"
        );

        if let Err(e) = self.db.record_device_telemetry(device_id, &t, now).await {
            warn!(device = %device_id, "persisting telemetry failed: {e:#}");
        }

        for check in self.thresholds.evaluate(&t) {
            self.apply_check(device_id, check).await;
        }
        Ok(())
    }

    pub async fn handle_error(&self, device_id: &str, payload: &Value, now: OffsetDateTime) -> MonitorResult<()> {
        let report: ErrorReport = decode(TelemetryKind::Error, payload)?;
        warn!(device = %device_id, severity = %report.severity, "device error: {}", report.message);

        let record = ErrorRecord::new(device_id, &report, now);
        let (logged, _) = tokio::join!(
            self.db.append_error(&record),
            self.notify(device_id, "error", |name| {
                notify::error_notification(device_id, name, &report)
            }),
        );
        if let Err(e) = logged {
            warn!(device = %device_id, "error log append failed: {e:#}");
        }
        Ok(())
    }

    pub async fn handle_feeding(&self, device_id: &str, payload: &Value, now: OffsetDateTime) -> MonitorResult<()> {
        let ev: FeedingEvent = decode(TelemetryKind::Feeding, payload)?;
        let record = FeedingRecord::new(device_id, &ev, now, self.tz);
        info!(device = %device_id, status = ?ev.status, amount = ev.amount, day = %record.day, "feeding");

        let (logged, counted, _) = tokio::join!(
            self.db.append_feeding(&record),
            self.stats.record_feeding(device_id, &record.day, ev.status, ev.amount),
            self.notify(device_id, "feeding", |_| notify::feeding_notification(device_id, &ev)),
        );
        if let Err(e) = logged {
            warn!(device = %device_id, "feeding log append failed: {e:#}");
        }
        if let Err(e) = counted {
            warn!(device = %device_id, day = %record.day, "feeding statistics dropped: {e}");
        }

        if let Some(level) = ev.remaining_food {
            self.apply_check(device_id, self.thresholds.check_food(level)).await;
        }
        Ok(())
    }

    pub async fn handle_access(&self, device_id: &str, payload: &Value, now: OffsetDateTime) -> MonitorResult<()> {
        let ev: AccessEvent = decode(TelemetryKind::Access, payload)?;
        let record = AccessRecord::new(device_id, &ev, now, self.tz);
        info!(
            device = %device_id,
            status = ?ev.status,
            direction = ?ev.direction,
            day = %record.day,
            "access"
        );

        // Repeated denials while one is open stay quiet.
        let should_notify = match ev.status {
            AccessStatus::Denied => self.alerts.open(device_id, AlertKind::AccessDenied),
            AccessStatus::Success => {
                if self.alerts.clear(device_id, AlertKind::AccessDenied) {
                    debug!(device = %device_id, "access_denied alert cleared");
                }
                true
            }
            AccessStatus::Error | AccessStatus::Timeout => true,
        };

        let notify_access = async {
            if should_notify {
                self.notify(device_id, "access", |_| notify::access_notification(device_id, &ev))
                    .await;
            }
        };
        let (logged, counted, _) = tokio::join!(
            self.db.append_access(&record),
            self.stats.record_access(device_id, &record.day, ev.status, ev.direction),
            notify_access,
        );
        if let Err(e) = logged {
            warn!(device = %device_id, "access log append failed: {e:#}");
        }
        if let Err(e) = counted {
            warn!(device = %device_id, day = %record.day, "access statistics dropped: {e}");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Alerts
    // -----------------------------------------------------------------------

    /// Open or clear the alert for one metric reading. Notifies only when the
    /// alert was not already open.
    pub(crate) async fn apply_check(&self, device_id: &str, check: MetricCheck) {
        if check.breached {
            if self.alerts.open(device_id, check.kind) {
                info!(device = %device_id, alert = check.kind.as_str(), value = check.value, "alert opened");
                self.notify(device_id, check.kind.as_str(), |name| {
                    notify::metric_notification(device_id, name, &check)
                })
                .await;
            }
        } else if self.alerts.clear(device_id, check.kind) {
            info!(device = %device_id, alert = check.kind.as_str(), value = check.value, "alert cleared");
        }
    }

    /// Send a notification to the device's owner, logging rather than
    /// returning any failure.
    pub(crate) async fn notify(&self, device_id: &str, what: &str, build: impl FnOnce(&str) -> Notification) {
        match self.notifier.notify_device(device_id, build).await {
            Ok(outcome) => debug!(device = %device_id, ?outcome, "{what} notification"),
            Err(MonitorError::Lookup(missing)) => {
                debug!(device = %device_id, "{what} notification skipped: {missing} not found")
            }
            Err(e) => warn!(device = %device_id, "{what} notification failed: {e}"),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(kind: TelemetryKind, payload: &Value) -> MonitorResult<T> {
    serde::Deserialize::deserialize(payload).map_err(|e| MonitorError::decode(kind.as_str(), e))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DeviceRecord, UserRecord};
    use crate::notify::testing::RecordingDelivery;
    use crate::notify::Priority;
    use crate::stats::{CounterFamily, CounterKey};
    use serde_json::json;
    use time::macros::{datetime, offset};

    const T0: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

    async fn setup() -> (Monitor, Arc<RecordingDelivery>) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.upsert_user(&UserRecord {
            user_id: "u1".into(),
            name: "Alice".into(),
            push_token: Some("tok-1".into()),
        })
        .await
        .unwrap();
        for id in ["D1", "D2"] {
            db.upsert_device(&DeviceRecord {
                device_id: id.into(),
                name: format!("Device {id}"),
                owner_id: Some("u1".into()),
            })
            .await
            .unwrap();
        }
        let delivery = Arc::new(RecordingDelivery::default());
        let monitor = Monitor::new(db, delivery.clone(), Thresholds::default(), offset!(UTC));
        (monitor, delivery)
    }

    // -- thresholds ----------------------------------------------------------

    #[tokio::test]
    async fn low_battery_opens_once_clears_and_reopens() {
        let (m, delivery) = setup().await;

        for battery in [15.0, 15.0, 50.0, 10.0] {
            m.handle_heartbeat("D1", &json!({ "batteryLevel": battery }), T0)
                .await
                .unwrap();
        }

        let sent = delivery.sent();
        assert_eq!(delivery.count_kind("low_battery"), 2);
        assert!(sent.iter().all(|(_, n)| n.priority == Priority::High));
        assert!(m.alerts.is_open("D1", AlertKind::LowBattery));
    }

    #[tokio::test]
    async fn metrics_are_evaluated_independently() {
        let (m, delivery) = setup().await;
        m.handle_status("D1", &json!({ "batteryLevel": 80, "wifi_rssi": -85, "freeMemory": 2048 }), T0)
            .await
            .unwrap();

        assert_eq!(delivery.count_kind("low_battery"), 0);
        assert_eq!(delivery.count_kind("weak_wifi"), 1);
        assert_eq!(delivery.count_kind("low_memory"), 1);

        let row = m.db.device_status("D1").await.unwrap().unwrap();
        assert_eq!(row.status, "online");
        assert_eq!(row.wifi_signal, Some(-85.0));
    }

    #[tokio::test]
    async fn persisted_last_seen_is_the_receive_time() {
        let (m, _) = setup().await;
        // The device clock is not trusted for presence; this one is unsynced.
        m.handle_heartbeat("D1", &json!({ "batteryLevel": 80, "timestamp": 120 }), T0)
            .await
            .unwrap();

        let row = m.db.device_status("D1").await.unwrap().unwrap();
        assert_eq!(row.status, "online");
        assert_eq!(row.last_seen, Some(T0.unix_timestamp()));
    }

    #[tokio::test]
    async fn malformed_heartbeat_is_a_decode_error() {
        let (m, delivery) = setup().await;
        let err = m
            .handle_heartbeat("D1", &json!({ "batteryLevel": "full" }), T0)
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Decode { what: "heartbeat", .. }));
        assert!(delivery.sent().is_empty());
    }

    // -- access --------------------------------------------------------------

    #[tokio::test]
    async fn denied_access_creates_counter_row_and_high_priority_notification() {
        let (m, delivery) = setup().await;
        m.handle_access(
            "D2",
            &json!({ "direction": "entry", "method": "rfid", "status": "denied" }),
            T0,
        )
        .await
        .unwrap();

        let counter = m
            .stats
            .load(&CounterKey::new("D2", "2024-05-01", CounterFamily::Access))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counter.count("denied_count"), 1);
        assert_eq!(counter.count("total_accesses"), 1);
        assert_eq!(counter.count("success_count"), 0);
        assert_eq!(counter.count("error_count"), 0);

        let sent = delivery.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.title, "Access denied");
        assert_eq!(sent[0].1.priority, Priority::High);
        assert_eq!(m.db.count_accesses_on("2024-05-01").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn repeated_denials_notify_once_until_success() {
        let (m, delivery) = setup().await;
        let denied = json!({ "direction": "entry", "method": "rfid", "status": "denied" });
        let ok = json!({ "direction": "entry", "method": "rfid", "status": "success", "petId": "Felix" });

        m.handle_access("D2", &denied, T0).await.unwrap();
        m.handle_access("D2", &denied, T0).await.unwrap();
        m.handle_access("D2", &ok, T0).await.unwrap();
        m.handle_access("D2", &denied, T0).await.unwrap();

        let titles: Vec<String> = delivery.sent().into_iter().map(|(_, n)| n.title).collect();
        assert_eq!(titles, ["Access denied", "Pet came in", "Access denied"]);

        // Every event still counts.
        let counter = m
            .stats
            .load(&CounterKey::new("D2", "2024-05-01", CounterFamily::Access))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counter.count("total_accesses"), 4);
        assert_eq!(counter.count("denied_count"), 3);
    }

    // -- feeding -------------------------------------------------------------

    #[tokio::test]
    async fn feeding_logs_counts_and_flags_low_food() {
        let (m, delivery) = setup().await;
        let payload = json!({ "amount": 25.5, "status": "success", "remainingFood": 5 });
        m.handle_feeding("D1", &payload, T0).await.unwrap();
        m.handle_feeding("D1", &payload, T0).await.unwrap();

        let counter = m
            .stats
            .load(&CounterKey::new("D1", "2024-05-01", CounterFamily::Feeding))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counter.count("total_feedings"), 2);
        assert_eq!(counter.total_amount, 51.0);

        assert_eq!(delivery.count_kind("feeding_log"), 2);
        assert_eq!(delivery.count_kind("low_food"), 1);
        assert_eq!(m.db.count_feedings_on("2024-05-01").await.unwrap(), 2);
    }

    // -- errors --------------------------------------------------------------

    #[tokio::test]
    async fn every_error_report_is_notified() {
        let (m, delivery) = setup().await;
        let payload = json!({ "message": "motor jam", "severity": "high" });
        m.handle_error("D1", &payload, T0).await.unwrap();
        m.handle_error("D1", &payload, T0).await.unwrap();

        assert_eq!(delivery.count_kind("device_error"), 2);
        assert_eq!(m.db.error_count("D1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unowned_device_is_tracked_without_notifications() {
        let (m, delivery) = setup().await;
        m.handle_heartbeat("stray", &json!({ "batteryLevel": 3 }), T0).await.unwrap();

        assert!(delivery.sent().is_empty());
        assert!(m.alerts.is_open("stray", AlertKind::LowBattery));
        let row = m.db.device_status("stray").await.unwrap().unwrap();
        assert_eq!(row.battery_level, Some(3.0));
    }

    // -- presence ------------------------------------------------------------

    #[tokio::test]
    async fn reconnect_notifies_exactly_once() {
        let (m, delivery) = setup().await;
        m.touch("D1", json!({}), T0).await;

        let flipped = m
            .presence
            .sweep(T0 + time::Duration::minutes(6), time::Duration::minutes(5), &m.alerts);
        assert_eq!(flipped.len(), 1);
        assert!(m.alerts.is_open("D1", AlertKind::Offline));

        for i in 0..3 {
            m.touch("D1", json!({}), T0 + time::Duration::minutes(7 + i)).await;
        }

        assert_eq!(delivery.count_kind("device_reconnected"), 1);
        assert!(!m.alerts.is_open("D1", AlertKind::Offline));
        assert_eq!(m.presence.get("D1").unwrap().state, PresenceState::Online);
    }
}
