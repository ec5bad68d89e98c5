//! In-memory presence registry: the process-local answer to "is this device
//! currently reachable".
//!
//! The registry starts empty and is rebuilt from live telemetry after a
//! restart; a device that stays silent through a restart is only reported
//! offline once it has been seen again and then gone quiet.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::alerts::{AlertDeduplicator, AlertKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceRecord {
    pub device_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen_at: OffsetDateTime,
    pub state: PresenceState,
    pub last_telemetry: Value,
}

/// A device flipped to offline by a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineTransition {
    pub device_id: String,
    pub last_seen_at: OffsetDateTime,
}

/// Result of a [`PresenceRegistry::touch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Touched {
    /// State before this touch, `None` for a first sighting.
    pub previous: Option<PresenceState>,
    /// This touch closed an open `device_offline` alert.
    pub reconnected: bool,
}

/// Sharded map keyed by device id. Touches for different devices land on
/// different shards; a sweep locks one shard at a time. Lock order is always
/// presence record first, then the alert map.
#[derive(Default)]
pub struct PresenceRegistry {
    records: DashMap<String, PresenceRecord>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a device as online with its latest snapshot.
    ///
    /// The `device_offline` alert is cleared while the record is still
    /// locked, so a concurrent sweep either sees the fresh `last_seen_at` or
    /// has already opened the alert this touch closes.
    pub fn touch(
        &self,
        device_id: &str,
        snapshot: Value,
        now: OffsetDateTime,
        alerts: &AlertDeduplicator,
    ) -> Touched {
        match self.records.entry(device_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let rec = entry.get_mut();
                let previous = rec.state;
                // Redelivered messages may carry an older receive time.
                rec.last_seen_at = rec.last_seen_at.max(now);
                rec.state = PresenceState::Online;
                rec.last_telemetry = snapshot;
                Touched {
                    previous: Some(previous),
                    reconnected: alerts.clear(device_id, AlertKind::Offline),
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(PresenceRecord {
                    device_id: device_id.to_string(),
                    last_seen_at: now,
                    state: PresenceState::Online,
                    last_telemetry: snapshot,
                });
                Touched {
                    previous: None,
                    reconnected: false,
                }
            }
        }
    }

    /// Flip every online device whose silence exceeds `threshold` to offline
    /// and open its `device_offline` alert under the same lock. Returns the
    /// devices whose alert this sweep opened; devices already offline are
    /// not reported again.
    pub fn sweep(
        &self,
        now: OffsetDateTime,
        threshold: Duration,
        alerts: &AlertDeduplicator,
    ) -> Vec<OfflineTransition> {
        let mut transitions = Vec::new();
        for mut rec in self.records.iter_mut() {
            if rec.state == PresenceState::Online && now - rec.last_seen_at > threshold {
                rec.state = PresenceState::Offline;
                if alerts.open(&rec.device_id, AlertKind::Offline) {
                    transitions.push(OfflineTransition {
                        device_id: rec.device_id.clone(),
                        last_seen_at: rec.last_seen_at,
                    });
                }
            }
        }
        transitions.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        transitions
    }

    pub fn get(&self, device_id: &str) -> Option<PresenceRecord> {
        self.records.get(device_id).map(|r| r.value().clone())
    }

    /// All records, ordered by device id.
    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        let mut all: Vec<PresenceRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    pub fn online_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.state == PresenceState::Online)
            .count()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
