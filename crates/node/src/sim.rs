//! Stateful pet-care device simulator for local development.
//!
//! Models a battery-powered feeder/door combo:
//! - Battery drains a little every tick and faster while the motor runs
//! - WiFi RSSI random-walks around a per-device mean
//! - Free heap fluctuates and slowly leaks
//! - Food hopper empties with each feeding and is refilled when near empty
//! - Feeding, access and error events fire at random with per-scenario odds

use serde::Serialize;
use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Full battery, good signal, rare errors.
    Healthy,
    /// Starts near the low-battery threshold and drains fast.
    Draining,
    /// Weak, noisy signal and frequent errors and denials.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "draining" => Self::Draining,
            "flaky" => Self::Flaky,
            _ => Self::Healthy,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Draining => write!(f, "draining"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub battery_level: f64,
    pub wifi_signal: f64,
    pub free_memory: i64,
    pub uptime: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Feeding {
    pub pet_id: String,
    pub amount: f64,
    pub scheduled_amount: f64,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub remaining_food: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Access {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pet_id: Option<String>,
    pub direction: &'static str,
    pub method: &'static str,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rfid_tag: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub message: String,
    pub severity: &'static str,
    pub timestamp: i64,
}

/// One randomly generated device event.
#[derive(Debug, Clone)]
pub enum SimEvent {
    Feeding(Feeding),
    Access(Access),
    Error(ErrorReport),
}

impl SimEvent {
    /// Topic suffix for this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Feeding(_) => "feeding",
            Self::Access(_) => "access",
            Self::Error(_) => "error",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Self::Feeding(f) => serde_json::to_vec(f),
            Self::Access(a) => serde_json::to_vec(a),
            Self::Error(e) => serde_json::to_vec(e),
        }
    }
}

const PETS: &[(&str, &str)] = &[("felix", "04A2B9"), ("luna", "04C3D1")];
const PORTION_G: f64 = 40.0;

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

pub struct DeviceSim {
    battery: f64,
    drain_per_tick: f64,
    rssi_mean: f64,
    rssi: f64,
    rssi_sigma: f64,
    heap: f64,
    food_pct: f64,
    uptime_s: i64,

    // Per-tick event odds
    feeding_prob: f64,
    access_prob: f64,
    error_prob: f64,
    denied_prob: f64,
}

impl DeviceSim {
    pub fn new(scenario: Scenario) -> Self {
        let (battery, drain, rssi_mean, rssi_sigma, error_prob, denied_prob) = match scenario {
            Scenario::Healthy => (95.0, 0.02, -55.0, 2.0, 0.005, 0.05),
            Scenario::Draining => (24.0, 0.3, -60.0, 3.0, 0.01, 0.05),
            Scenario::Flaky => (80.0, 0.05, -74.0, 6.0, 0.08, 0.3),
        };
        Self {
            battery,
            drain_per_tick: drain,
            rssi_mean,
            rssi: rssi_mean,
            rssi_sigma,
            heap: 48_000.0,
            food_pct: 60.0,
            uptime_s: 0,
            feeding_prob: 0.05,
            access_prob: 0.1,
            error_prob,
            denied_prob,
        }
    }

    /// Advance the device by `elapsed_s` seconds.
    pub fn tick(&mut self, elapsed_s: i64) {
        self.uptime_s += elapsed_s;
        self.battery = (self.battery - self.drain_per_tick).max(0.0);

        // Mean-reverting walk, clamped to what a radio can report.
        let pull = 0.2 * (self.rssi_mean - self.rssi);
        self.rssi = (self.rssi + pull + gaussian(0.0, self.rssi_sigma)).clamp(-100.0, -30.0);

        // Slow leak plus jitter; a "reboot" restores the heap.
        self.heap = (self.heap - 15.0 + gaussian(0.0, 400.0)).clamp(4_000.0, 64_000.0);
        if self.heap <= 6_000.0 {
            self.heap = 48_000.0;
            self.uptime_s = 0;
        }
    }

    pub fn telemetry(&self, timestamp: i64) -> Telemetry {
        Telemetry {
            battery_level: (self.battery * 10.0).round() / 10.0,
            wifi_signal: self.rssi.round(),
            free_memory: self.heap as i64,
            uptime: self.uptime_s,
            timestamp,
        }
    }

    /// Roll the dice for this tick's events.
    pub fn events(&mut self, timestamp: i64) -> Vec<SimEvent> {
        let mut out = Vec::new();
        if fastrand::f64() < self.feeding_prob {
            out.push(SimEvent::Feeding(self.feed(timestamp)));
        }
        if fastrand::f64() < self.access_prob {
            out.push(SimEvent::Access(self.access(timestamp)));
        }
        if fastrand::f64() < self.error_prob {
            out.push(SimEvent::Error(ErrorReport {
                message: "food dispenser motor stalled".into(),
                severity: if fastrand::bool() { "high" } else { "medium" },
                timestamp,
            }));
        }
        out
    }

    fn feed(&mut self, timestamp: i64) -> Feeding {
        let (pet, _) = PETS[fastrand::usize(..PETS.len())];
        let available = self.food_pct * 2.0; // 200 g hopper
        let (amount, status, error_message) = if available <= 0.5 {
            (0.0, "failed", Some("food hopper is empty".to_string()))
        } else if available < PORTION_G {
            (available.floor(), "partial", None)
        } else {
            (PORTION_G, "success", None)
        };
        self.food_pct = (self.food_pct - amount / 2.0).max(0.0);
        self.battery = (self.battery - 0.5).max(0.0);

        let feeding = Feeding {
            pet_id: pet.to_string(),
            amount,
            scheduled_amount: PORTION_G,
            status,
            error_message,
            remaining_food: self.food_pct.round(),
            timestamp,
        };
        if self.food_pct < 3.0 {
            self.food_pct = 100.0; // owner refilled the hopper
        }
        feeding
    }

    fn access(&mut self, timestamp: i64) -> Access {
        let direction = if fastrand::bool() { "entry" } else { "exit" };
        if fastrand::f64() < self.denied_prob {
            return Access {
                pet_id: None,
                direction,
                method: "rfid",
                status: "denied",
                error_message: None,
                rfid_tag: Some(format!("{:06X}", fastrand::u32(..0xFF_FFFF))),
                timestamp,
            };
        }
        let (pet, tag) = PETS[fastrand::usize(..PETS.len())];
        let timed_out = fastrand::f64() < self.error_prob;
        Access {
            pet_id: Some(pet.to_string()),
            direction,
            method: "rfid",
            status: if timed_out { "timeout" } else { "success" },
            error_message: timed_out.then(|| "RFID reader timeout".to_string()),
            rfid_tag: Some(tag.to_string()),
            timestamp,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_drains_and_never_goes_negative() {
        let mut sim = DeviceSim::new(Scenario::Draining);
        let start = sim.telemetry(0).battery_level;
        for _ in 0..500 {
            sim.tick(30);
        }
        let end = sim.telemetry(0).battery_level;
        assert!(end < start);
        assert!(end >= 0.0);
    }

    #[test]
    fn rssi_stays_in_radio_range() {
        let mut sim = DeviceSim::new(Scenario::Flaky);
        for _ in 0..1000 {
            sim.tick(30);
            let rssi = sim.telemetry(0).wifi_signal;
            assert!((-100.0..=-30.0).contains(&rssi), "rssi out of range: {rssi}");
        }
    }

    #[test]
    fn heap_stays_positive() {
        let mut sim = DeviceSim::new(Scenario::Healthy);
        for _ in 0..2000 {
            sim.tick(30);
            assert!(sim.telemetry(0).free_memory >= 4_000);
        }
    }

    #[test]
    fn feedings_empty_the_hopper_then_refill() {
        let mut sim = DeviceSim::new(Scenario::Healthy);
        let statuses: Vec<&str> = (0..20).map(|_| sim.feed(0).status).collect();
        assert!(statuses.contains(&"success"));
        assert!(sim.food_pct > 0.0);
    }

    #[test]
    fn telemetry_serializes_camel_case() {
        let sim = DeviceSim::new(Scenario::Healthy);
        let json = serde_json::to_value(sim.telemetry(1_700_000_000)).unwrap();
        assert_eq!(json["batteryLevel"], 95.0);
        assert!(json["wifiSignal"].is_number());
        assert!(json["freeMemory"].is_i64());
        assert_eq!(json["timestamp"], 1_700_000_000);
    }

    #[test]
    fn denied_access_has_no_pet() {
        let mut sim = DeviceSim::new(Scenario::Healthy);
        sim.denied_prob = 1.0;
        let a = sim.access(0);
        assert_eq!(a.status, "denied");
        let json = serde_json::to_value(&a).unwrap();
        assert!(json.get("petId").is_none());
        assert!(json["rfidTag"].is_string());
    }

    #[test]
    fn event_kinds_match_topic_suffixes() {
        let mut sim = DeviceSim::new(Scenario::Healthy);
        sim.feeding_prob = 1.0;
        sim.access_prob = 1.0;
        sim.error_prob = 1.0;
        let kinds: Vec<&str> = sim.events(0).iter().map(SimEvent::kind).collect();
        assert_eq!(kinds, ["feeding", "access", "error"]);
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("DRAINING"), Scenario::Draining);
        assert_eq!(Scenario::from_str_lossy("flaky"), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Healthy);
        assert_eq!(Scenario::Flaky.to_string(), "flaky");
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let sum: f64 = (0..n).map(|_| approx_std_normal()).sum();
        let mean = sum / n as f64;
        assert!(mean.abs() < 0.15, "mean should be near zero: {mean}");
    }
}
