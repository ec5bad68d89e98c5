//! TOML config file loading, validation, and database seeding for users and
//! devices.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use time::UtcOffset;

use crate::alerts::Thresholds;
use crate::db::{Db, DeviceRecord, UserRecord};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic_root: String,
    pub keep_alive_sec: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "petcare-monitor".into(),
            topic_root: "pet-smart-home".into(),
            keep_alive_sec: 30,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub sweep_interval_sec: u64,
    /// Silence longer than this marks a device offline.
    pub offline_threshold_sec: u64,
    pub rollup_interval_sec: u64,
    /// Fixed offset used for day boundaries.
    pub utc_offset_hours: i8,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            sweep_interval_sec: 300,
            offline_threshold_sec: 300,
            rollup_interval_sec: 86_400,
            utc_offset_hours: 1,
        }
    }
}

impl MonitorSection {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_sec)
    }

    pub fn offline_threshold(&self) -> Duration {
        Duration::from_secs(self.offline_threshold_sec)
    }

    pub fn rollup_interval(&self) -> Duration {
        Duration::from_secs(self.rollup_interval_sec)
    }

    pub fn utc_offset(&self) -> Result<UtcOffset> {
        UtcOffset::from_hms(self.utc_offset_hours, 0, 0)
            .with_context(|| format!("invalid utc_offset_hours {}", self.utc_offset_hours))
    }
}

#[derive(Debug, Deserialize)]
pub struct UserEntry {
    pub user_id: String,
    pub name: String,
    pub push_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    pub name: String,
    pub owner: Option<String>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_monitor(&mut errors);
        self.validate_thresholds(&mut errors);
        self.validate_users(&mut errors);
        self.validate_devices(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt: host is empty".into());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt: client_id is empty".into());
        }
        if m.topic_root.trim().is_empty() {
            errors.push("mqtt: topic_root is empty".into());
        } else if m.topic_root.contains(['/', '+', '#']) {
            errors.push(format!(
                "mqtt: topic_root '{}' must not contain '/', '+' or '#'",
                m.topic_root
            ));
        }
        if m.keep_alive_sec == 0 {
            errors.push("mqtt: keep_alive_sec must be > 0".into());
        }
        if m.password.is_some() && m.username.is_none() {
            errors.push("mqtt: password given without username".into());
        }
    }

    fn validate_monitor(&self, errors: &mut Vec<String>) {
        let m = &self.monitor;
        if m.sweep_interval_sec == 0 {
            errors.push("monitor: sweep_interval_sec must be > 0".into());
        }
        if m.offline_threshold_sec == 0 {
            errors.push("monitor: offline_threshold_sec must be > 0".into());
        }
        if m.rollup_interval_sec == 0 {
            errors.push("monitor: rollup_interval_sec must be > 0".into());
        }
        if !(-12..=14).contains(&m.utc_offset_hours) {
            errors.push(format!(
                "monitor: utc_offset_hours {} out of range [-12, 14]",
                m.utc_offset_hours
            ));
        }
    }

    fn validate_thresholds(&self, errors: &mut Vec<String>) {
        let t = &self.thresholds;
        if !(0.0..=100.0).contains(&t.low_battery_pct) {
            errors.push(format!(
                "thresholds: low_battery_pct {} out of range [0, 100]",
                t.low_battery_pct
            ));
        }
        if !(0.0..=100.0).contains(&t.low_food_pct) {
            errors.push(format!(
                "thresholds: low_food_pct {} out of range [0, 100]",
                t.low_food_pct
            ));
        }
        if t.low_memory_bytes < 0 {
            errors.push(format!(
                "thresholds: low_memory_bytes {} is negative",
                t.low_memory_bytes
            ));
        }
    }

    fn validate_users(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, u) in self.users.iter().enumerate() {
            let ctx = || {
                if u.user_id.is_empty() {
                    format!("users[{i}]")
                } else {
                    format!("user '{}'", u.user_id)
                }
            };

            if u.user_id.trim().is_empty() {
                errors.push(format!("{}: user_id is empty", ctx()));
            } else if !seen_ids.insert(&u.user_id) {
                errors.push(format!("{}: duplicate user_id", ctx()));
            }
            if u.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let user_ids: HashSet<&str> = self.users.iter().map(|u| u.user_id.as_str()).collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.device_id.is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.device_id)
                }
            };

            if d.device_id.trim().is_empty() {
                errors.push(format!("{}: device_id is empty", ctx()));
            } else if d.device_id.contains(['/', '+', '#']) {
                errors.push(format!("{}: device_id must not contain '/', '+' or '#'", ctx()));
            } else if !seen_ids.insert(&d.device_id) {
                errors.push(format!("{}: duplicate device_id", ctx()));
            }

            if d.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            if let Some(owner) = &d.owner {
                if !user_ids.contains(owner.as_str()) {
                    errors.push(format!(
                        "{}: owner '{owner}' does not match any defined user",
                        ctx()
                    ));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all users and devices from the config into the database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for u in &config.users {
        db.upsert_user(&UserRecord {
            user_id: u.user_id.clone(),
            name: u.name.clone(),
            push_token: u.push_token.clone(),
        })
        .await
        .with_context(|| format!("failed to upsert user '{}'", u.user_id))?;
    }

    for d in &config.devices {
        db.upsert_device(&DeviceRecord {
            device_id: d.device_id.clone(),
            name: d.name.clone(),
            owner_id: d.owner.clone(),
        })
        .await
        .with_context(|| format!("failed to upsert device '{}'", d.device_id))?;
    }

    tracing::info!(
        users = config.users.len(),
        devices = config.devices.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
