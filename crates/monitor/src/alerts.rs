//! Open-alert bookkeeping and the per-metric threshold policy.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::mqtt::DeviceTelemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowBattery,
    WeakWifi,
    LowMemory,
    LowFood,
    #[serde(rename = "device_offline")]
    Offline,
    AccessDenied,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LowBattery => "low_battery",
            Self::WeakWifi => "weak_wifi",
            Self::LowMemory => "low_memory",
            Self::LowFood => "low_food",
            Self::Offline => "device_offline",
            Self::AccessDenied => "access_denied",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenAlert {
    pub device_id: String,
    pub kind: AlertKind,
    #[serde(with = "time::serde::rfc3339")]
    pub opened_at: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Deduplicator
// ---------------------------------------------------------------------------

/// At most one open alert per (device, kind). Opening an already-open alert
/// is refused so the caller knows not to notify again.
#[derive(Default)]
pub struct AlertDeduplicator {
    open: DashMap<(String, AlertKind), OffsetDateTime>,
}

impl AlertDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an open alert. Returns `false` if one was already open.
    pub fn open(&self, device_id: &str, kind: AlertKind) -> bool {
        match self.open.entry((device_id.to_string(), kind)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(OffsetDateTime::now_utc());
                true
            }
        }
    }

    /// Remove the alert if present. Returns whether one was removed.
    pub fn clear(&self, device_id: &str, kind: AlertKind) -> bool {
        self.open.remove(&(device_id.to_string(), kind)).is_some()
    }

    pub fn is_open(&self, device_id: &str, kind: AlertKind) -> bool {
        self.open.contains_key(&(device_id.to_string(), kind))
    }

    pub fn open_alerts(&self) -> Vec<OpenAlert> {
        let mut all: Vec<OpenAlert> = self
            .open
            .iter()
            .map(|e| OpenAlert {
                device_id: e.key().0.clone(),
                kind: e.key().1,
                opened_at: *e.value(),
            })
            .collect();
        all.sort_by(|a, b| {
            (a.device_id.as_str(), a.kind.as_str()).cmp(&(b.device_id.as_str(), b.kind.as_str()))
        });
        all
    }
}

// ---------------------------------------------------------------------------
// Threshold policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Battery percentage below which `low_battery` opens.
    pub low_battery_pct: f64,
    /// Signal strength (dBm) below which `weak_wifi` opens.
    pub weak_wifi_dbm: f64,
    pub low_memory_bytes: i64,
    /// Remaining food percentage below which `low_food` opens.
    pub low_food_pct: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low_battery_pct: 20.0,
            weak_wifi_dbm: -70.0,
            low_memory_bytes: 10_000,
            low_food_pct: 10.0,
        }
    }
}

/// Outcome of checking one metric reading against its threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricCheck {
    pub kind: AlertKind,
    pub value: f64,
    pub breached: bool,
}

impl Thresholds {
    /// Check each metric present in the telemetry, independently.
    pub fn evaluate(&self, t: &DeviceTelemetry) -> Vec<MetricCheck> {
        let mut checks = Vec::with_capacity(3);
        if let Some(v) = t.battery_level {
            checks.push(MetricCheck {
                kind: AlertKind::LowBattery,
                value: v,
                breached: v < self.low_battery_pct,
            });
        }
        if let Some(v) = t.wifi_signal {
            checks.push(MetricCheck {
                kind: AlertKind::WeakWifi,
                value: v,
                breached: v < self.weak_wifi_dbm,
            });
        }
        if let Some(v) = t.free_memory {
            checks.push(MetricCheck {
                kind: AlertKind::LowMemory,
                value: v as f64,
                breached: v < self.low_memory_bytes,
            });
        }
        checks
    }

    pub fn check_food(&self, remaining_pct: f64) -> MetricCheck {
        MetricCheck {
            kind: AlertKind::LowFood,
            value: remaining_pct,
            breached: remaining_pct < self.low_food_pct,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- open / clear --------------------------------------------------------

    #[test]
    fn open_twice_returns_true_then_false() {
        let d = AlertDeduplicator::new();
        assert!(d.open("d1", AlertKind::LowBattery));
        assert!(!d.open("d1", AlertKind::LowBattery));
    }

    #[test]
    fn open_after_clear_returns_true_again() {
        let d = AlertDeduplicator::new();
        assert!(d.open("d1", AlertKind::LowBattery));
        assert!(d.clear("d1", AlertKind::LowBattery));
        assert!(d.open("d1", AlertKind::LowBattery));
    }

    #[test]
    fn clear_is_idempotent() {
        let d = AlertDeduplicator::new();
        assert!(!d.clear("d1", AlertKind::Offline));
        d.open("d1", AlertKind::Offline);
        assert!(d.clear("d1", AlertKind::Offline));
        assert!(!d.clear("d1", AlertKind::Offline));
    }

    #[test]
    fn kinds_and_devices_are_independent() {
        let d = AlertDeduplicator::new();
        assert!(d.open("d1", AlertKind::LowBattery));
        assert!(d.open("d1", AlertKind::WeakWifi));
        assert!(d.open("d2", AlertKind::LowBattery));
        assert_eq!(d.open_alerts().len(), 3);
        assert!(d.is_open("d2", AlertKind::LowBattery));
        assert!(!d.is_open("d2", AlertKind::WeakWifi));
    }

    #[test]
    fn concurrent_open_admits_exactly_one() {
        let d = std::sync::Arc::new(AlertDeduplicator::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let d = std::sync::Arc::clone(&d);
                std::thread::spawn(move || d.open("d1", AlertKind::Offline))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|opened| *opened)
            .count();
        assert_eq!(winners, 1);
    }

    // -- thresholds ----------------------------------------------------------

    fn telemetry(battery: Option<f64>, wifi: Option<f64>, mem: Option<i64>) -> DeviceTelemetry {
        DeviceTelemetry {
            battery_level: battery,
            wifi_signal: wifi,
            free_memory: mem,
            ..DeviceTelemetry::default()
        }
    }

    #[test]
    fn evaluate_skips_absent_metrics() {
        let t = Thresholds::default();
        assert!(t.evaluate(&telemetry(None, None, None)).is_empty());
    }

    #[test]
    fn evaluate_flags_each_breach() {
        let t = Thresholds::default();
        let checks = t.evaluate(&telemetry(Some(15.0), Some(-80.0), Some(5_000)));
        assert_eq!(checks.len(), 3);
        assert!(checks.iter().all(|c| c.breached));
    }

    #[test]
    fn evaluate_healthy_values() {
        let t = Thresholds::default();
        let checks = t.evaluate(&telemetry(Some(50.0), Some(-55.0), Some(50_000)));
        assert!(checks.iter().all(|c| !c.breached));
    }

    #[test]
    fn thresholds_are_strict() {
        let t = Thresholds::default();
        let checks = t.evaluate(&telemetry(Some(20.0), Some(-70.0), Some(10_000)));
        assert!(checks.iter().all(|c| !c.breached));
    }

    #[test]
    fn zero_battery_is_a_breach() {
        let t = Thresholds::default();
        let checks = t.evaluate(&telemetry(Some(0.0), None, None));
        assert_eq!(checks[0].kind, AlertKind::LowBattery);
        assert!(checks[0].breached);
    }

    #[test]
    fn food_check() {
        let t = Thresholds::default();
        assert!(t.check_food(5.0).breached);
        assert!(!t.check_food(40.0).breached);
    }
}
