//! Notification formatting and hand-off to the push delivery collaborator.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::alerts::{AlertKind, MetricCheck};
use crate::db::Db;
use crate::error::{MonitorError, MonitorResult};
use crate::mqtt::{AccessEvent, AccessStatus, Direction, ErrorReport, FeedingEvent, FeedingStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub data: Map<String, Value>,
    pub priority: Priority,
}

impl Notification {
    fn new(kind: &str, device_id: &str, title: impl Into<String>, body: impl Into<String>, priority: Priority) -> Self {
        let mut data = Map::new();
        data.insert("type".into(), Value::from(kind));
        data.insert("deviceId".into(), Value::from(device_id));
        Self {
            title: title.into(),
            body: body.into(),
            data,
            priority,
        }
    }

    fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn kind(&self) -> Option<&str> {
        self.data.get("type").and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// Delivery seam
// ---------------------------------------------------------------------------

/// External push transport. Failures are the transport's own business; the
/// notifier only logs them.
#[async_trait]
pub trait PushDelivery: Send + Sync {
    /// Hand one notification to the transport. A transport that cannot
    /// deliver returns [`MonitorError::Delivery`].
    async fn send(&self, address: &str, notification: &Notification) -> MonitorResult<()>;
}

/// Delivery that only writes a log line. Used when no push transport is
/// wired in.
pub struct LogDelivery;

#[async_trait]
impl PushDelivery for LogDelivery {
    async fn send(&self, address: &str, n: &Notification) -> MonitorResult<()> {
        info!(
            to = %address,
            priority = n.priority.as_str(),
            kind = n.kind().unwrap_or("-"),
            "push: {} - {}",
            n.title,
            n.body
        );
        Ok(())
    }
}

/// What happened to a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    /// Delivery failed; the history record was still written.
    DeliveryFailed,
    /// Recipient has no delivery address.
    Skipped,
}

#[derive(Clone)]
pub struct Notifier {
    db: Db,
    delivery: Arc<dyn PushDelivery>,
}

impl Notifier {
    pub fn new(db: Db, delivery: Arc<dyn PushDelivery>) -> Self {
        Self { db, delivery }
    }

    /// Notify the owner of `device_id`. `build` receives the device's display
    /// name.
    pub async fn notify_device(
        &self,
        device_id: &str,
        build: impl FnOnce(&str) -> Notification,
    ) -> MonitorResult<Outcome> {
        let device = self
            .db
            .get_device(device_id)
            .await?
            .ok_or_else(|| MonitorError::Lookup(format!("device '{device_id}'")))?;
        let owner = device
            .owner_id
            .ok_or_else(|| MonitorError::Lookup(format!("owner of device '{device_id}'")))?;
        self.notify_user(&owner, build(&device.name)).await
    }

    pub async fn notify_user(&self, user_id: &str, mut n: Notification) -> MonitorResult<Outcome> {
        let Some(address) = self.db.push_address(user_id).await? else {
            debug!(user = %user_id, "no push address; skipping notification");
            return Ok(Outcome::Skipped);
        };

        let now = OffsetDateTime::now_utc();
        let millis = now.unix_timestamp_nanos() / 1_000_000;
        n.data.insert("timestamp".into(), Value::from(millis.to_string()));

        let outcome = match self.delivery.send(&address, &n).await {
            Ok(()) => Outcome::Sent,
            Err(e) => {
                warn!(user = %user_id, "notification delivery failed: {e}");
                Outcome::DeliveryFailed
            }
        };

        self.db
            .insert_notification(
                user_id,
                &n.title,
                &n.body,
                &Value::Object(n.data.clone()),
                n.priority.as_str(),
                now,
            )
            .await?;

        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Message formatting
// ---------------------------------------------------------------------------

pub fn access_notification(device_id: &str, ev: &AccessEvent) -> Notification {
    let (title, body, priority) = match ev.status {
        AccessStatus::Success => {
            let (title, verb) = match ev.direction {
                Direction::Entry => ("Pet came in", "came in"),
                Direction::Exit => ("Pet went out", "went out"),
            };
            let body = match &ev.pet_id {
                Some(pet) => format!("{pet} {verb}"),
                None => format!("Your pet {verb}"),
            };
            (title.to_string(), body, Priority::Normal)
        }
        AccessStatus::Denied => (
            "Access denied".to_string(),
            "Unauthorized access attempt detected".to_string(),
            Priority::High,
        ),
        AccessStatus::Error | AccessStatus::Timeout => (
            "Access error".to_string(),
            ev.error_message
                .clone()
                .unwrap_or_else(|| "The door could not complete the access attempt".to_string()),
            Priority::High,
        ),
    };
    Notification::new("access_log", device_id, title, body, priority)
        .with("status", crate::mqtt::wire_name(&ev.status))
}

pub fn feeding_notification(device_id: &str, ev: &FeedingEvent) -> Notification {
    let (title, body, priority) = match ev.status {
        FeedingStatus::Success => (
            "Feeding complete".to_string(),
            format!("{}g of food dispensed", ev.amount),
            Priority::Normal,
        ),
        FeedingStatus::Failed => (
            "Feeding failed".to_string(),
            ev.error_message
                .clone()
                .unwrap_or_else(|| "The feeder could not dispense food".to_string()),
            Priority::High,
        ),
        FeedingStatus::Partial => (
            "Partial feeding".to_string(),
            match ev.scheduled_amount {
                Some(planned) => format!("Only {}g dispensed of {planned}g planned", ev.amount),
                None => format!("Only {}g dispensed", ev.amount),
            },
            Priority::High,
        ),
    };
    Notification::new("feeding_log", device_id, title, body, priority)
        .with("status", crate::mqtt::wire_name(&ev.status))
}

pub fn offline_notification(device_id: &str, name: &str, silent_minutes: i64) -> Notification {
    Notification::new(
        AlertKind::Offline.as_str(),
        device_id,
        "Device offline",
        format!("{name} has not responded for more than {silent_minutes} minutes"),
        Priority::High,
    )
}

pub fn reconnected_notification(device_id: &str, name: &str) -> Notification {
    Notification::new(
        "device_reconnected",
        device_id,
        "Device back online",
        format!("{name} is back online"),
        Priority::High,
    )
}

pub fn metric_notification(device_id: &str, name: &str, check: &MetricCheck) -> Notification {
    let (title, body) = match check.kind {
        AlertKind::LowBattery => ("Low battery", format!("{name} battery is at {}%", check.value)),
        AlertKind::WeakWifi => ("Weak WiFi signal", format!("{name} WiFi signal is {} dBm", check.value)),
        AlertKind::LowMemory => ("Low memory", format!("{name} has {} bytes of free memory", check.value)),
        AlertKind::LowFood => ("Low food level", format!("{name} food level is at {}%", check.value)),
        AlertKind::Offline | AlertKind::AccessDenied => ("Device alert", format!("{name} needs attention")),
    };
    Notification::new(check.kind.as_str(), device_id, title, body, Priority::High).with("value", check.value)
}

pub fn error_notification(device_id: &str, name: &str, report: &ErrorReport) -> Notification {
    Notification::new(
        "device_error",
        device_id,
        "Device error",
        format!("Error detected on {name}: {}", report.message),
        Priority::High,
    )
    .with("severity", report.severity.clone())
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::testing::RecordingDelivery;
    use super::*;
    use crate::db::{DeviceRecord, UserRecord};
    use crate::mqtt::AccessMethod;

    async fn seeded_db(token: Option<&str>) -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.upsert_user(&UserRecord {
            user_id: "u1".into(),
            name: "Alice".into(),
            push_token: token.map(str::to_string),
        })
        .await
        .unwrap();
        db.upsert_device(&DeviceRecord {
            device_id: "d1".into(),
            name: "Kitchen feeder".into(),
            owner_id: Some("u1".into()),
        })
        .await
        .unwrap();
        db
    }

    fn access(status: AccessStatus, direction: Direction) -> AccessEvent {
        AccessEvent {
            pet_id: None,
            direction,
            method: AccessMethod::Rfid,
            status,
            error_message: None,
            rfid_tag: None,
            timestamp: None,
        }
    }

    // -- formatting ----------------------------------------------------------

    #[test]
    fn access_priorities() {
        let ok = access_notification("d1", &access(AccessStatus::Success, Direction::Entry));
        assert_eq!(ok.priority, Priority::Normal);
        assert_eq!(ok.title, "Pet came in");

        for s in [AccessStatus::Denied, AccessStatus::Error, AccessStatus::Timeout] {
            assert_eq!(access_notification("d1", &access(s, Direction::Exit)).priority, Priority::High);
        }
    }

    #[test]
    fn access_error_uses_reported_message() {
        let mut ev = access(AccessStatus::Timeout, Direction::Entry);
        ev.error_message = Some("RFID reader timeout".into());
        let n = access_notification("d1", &ev);
        assert_eq!(n.body, "RFID reader timeout");
        assert_eq!(n.data["status"], "timeout");
    }

    #[test]
    fn partial_feeding_mentions_planned_amount() {
        let ev = FeedingEvent {
            pet_id: None,
            amount: 20.0,
            scheduled_amount: Some(50.0),
            status: FeedingStatus::Partial,
            error_message: None,
            remaining_food: None,
            timestamp: None,
        };
        let n = feeding_notification("d1", &ev);
        assert_eq!(n.body, "Only 20g dispensed of 50g planned");
        assert_eq!(n.priority, Priority::High);
        assert_eq!(n.kind(), Some("feeding_log"));
    }

    #[test]
    fn offline_notification_is_high_priority() {
        let n = offline_notification("d1", "Kitchen feeder", 6);
        assert_eq!(n.priority, Priority::High);
        assert_eq!(n.kind(), Some("device_offline"));
        assert_eq!(n.data["deviceId"], "d1");
    }

    // -- delivery ------------------------------------------------------------

    #[tokio::test]
    async fn notify_device_delivers_and_records_history() {
        let db = seeded_db(Some("tok-1")).await;
        let delivery = Arc::new(RecordingDelivery::default());
        let notifier = Notifier::new(db.clone(), delivery.clone());

        let outcome = notifier
            .notify_device("d1", |name| offline_notification("d1", name, 6))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Sent);

        let sent = delivery.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "tok-1");
        assert!(sent[0].1.body.starts_with("Kitchen feeder"));
        assert!(sent[0].1.data.contains_key("timestamp"));

        let history = db.notifications_for("u1", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].1, "high");
    }

    #[tokio::test]
    async fn missing_address_skips_silently() {
        let db = seeded_db(None).await;
        let delivery = Arc::new(RecordingDelivery::default());
        let notifier = Notifier::new(db.clone(), delivery.clone());

        let outcome = notifier
            .notify_device("d1", |name| reconnected_notification("d1", name))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Skipped);
        assert!(delivery.sent().is_empty());
        assert!(db.notifications_for("u1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_device_is_a_lookup_error() {
        let db = seeded_db(Some("tok-1")).await;
        let notifier = Notifier::new(db, Arc::new(RecordingDelivery::default()));
        let err = notifier
            .notify_device("ghost", |name| reconnected_notification("ghost", name))
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Lookup(_)));
    }

    #[tokio::test]
    async fn failed_delivery_still_records_history() {
        let db = seeded_db(Some("tok-1")).await;
        let notifier = Notifier::new(db.clone(), Arc::new(RecordingDelivery::failing()));

        let outcome = notifier
            .notify_device("d1", |name| reconnected_notification("d1", name))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::DeliveryFailed);
        assert_eq!(db.notifications_for("u1", 10).await.unwrap().len(), 1);
    }
}
