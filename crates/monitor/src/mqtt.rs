use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// The fixed vocabulary of topic suffixes the monitor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum TelemetryKind {
    Heartbeat,
    Status,
    Error,
    Feeding,
    Access,
}

impl TelemetryKind {
    pub(crate) const ALL: [TelemetryKind; 5] = [
        TelemetryKind::Heartbeat,
        TelemetryKind::Status,
        TelemetryKind::Error,
        TelemetryKind::Feeding,
        TelemetryKind::Access,
    ];

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Status => "status",
            Self::Error => "error",
            Self::Feeding => "feeding",
            Self::Access => "access",
        }
    }

    fn from_suffix(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

/// Heartbeat and status payloads. Every metric is optional; devices send
/// what their hardware can measure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeviceTelemetry {
    #[serde(alias = "battery_level")]
    pub(crate) battery_level: Option<f64>,
    #[serde(alias = "wifi_rssi", alias = "wifi_signal")]
    pub(crate) wifi_signal: Option<f64>,
    #[serde(alias = "free_heap", alias = "free_memory")]
    pub(crate) free_memory: Option<i64>,
    #[serde(alias = "uptime_ms")]
    pub(crate) uptime: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorReport {
    pub(crate) message: String,
    #[serde(default = "default_severity")]
    pub(crate) severity: String,
    pub(crate) timestamp: Option<i64>,
}

fn default_severity() -> String {
    "medium".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum FeedingStatus {
    Success,
    Failed,
    Partial,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FeedingEvent {
    pub(crate) pet_id: Option<String>,
    pub(crate) amount: f64,
    pub(crate) scheduled_amount: Option<f64>,
    pub(crate) status: FeedingStatus,
    pub(crate) error_message: Option<String>,
    pub(crate) remaining_food: Option<f64>,
    pub(crate) timestamp: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Direction {
    Entry,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum AccessMethod {
    Rfid,
    Ble,
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum AccessStatus {
    Success,
    Denied,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AccessEvent {
    pub(crate) pet_id: Option<String>,
    pub(crate) direction: Direction,
    pub(crate) method: AccessMethod,
    pub(crate) status: AccessStatus,
    pub(crate) error_message: Option<String>,
    pub(crate) rfid_tag: Option<String>,
    pub(crate) timestamp: Option<i64>,
}

/// Lowercase wire name of a unit-variant enum, used for DB columns.
pub(crate) fn wire_name<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

/// Subscription filters, one per kind: "<root>/+/<kind>".
pub(crate) fn subscriptions(topic_root: &str) -> Vec<String> {
    TelemetryKind::ALL
        .iter()
        .map(|k| format!("{topic_root}/+/{}", k.as_str()))
        .collect()
}

/// Queue a subscribe for every filter. Run on each ConnAck: the session is
/// clean, so the broker drops subscriptions whenever the connection does.
/// Returns how many filters were queued.
pub(crate) async fn subscribe_all(client: &AsyncClient, filters: &[String]) -> usize {
    let mut queued = 0;
    for filter in filters {
        match client.subscribe(filter.as_str(), QoS::AtLeastOnce).await {
            Ok(()) => queued += 1,
            Err(e) => warn!(%filter, "subscribe failed: {e}"),
        }
    }
    queued
}

/// Extract device_id from "<root>/<device_id>/<kind>" (the second segment).
pub(crate) fn extract_device_id(topic: &str) -> Option<&str> {
    topic.split('/').nth(1).filter(|id| !id.trim().is_empty())
}

/// Classify a topic by its last segment.
pub(crate) fn classify(topic: &str) -> Option<TelemetryKind> {
    topic.rsplit('/').next().and_then(TelemetryKind::from_suffix)
}

// ===========================================================================
// Tests
// ===========================================================================
