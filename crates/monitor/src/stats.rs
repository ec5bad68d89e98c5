//! Per-device, per-day aggregate counters.
//!
//! Every update goes through [`CounterStore::run_atomic`], which hands the
//! current row (if any) to a mutation and persists the result inside one
//! transaction. Two events for the same device and day never both read the
//! same starting row.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime, UtcOffset};

use crate::error::MonitorResult;
use crate::mqtt::{AccessStatus, Direction, FeedingStatus};

pub const ACCESS_COUNTERS: &[&str] = &[
    "total_accesses",
    "success_count",
    "denied_count",
    "error_count",
    "entry_count",
    "exit_count",
];

pub const FEEDING_COUNTERS: &[&str] = &[
    "total_feedings",
    "success_count",
    "failed_count",
    "partial_count",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterFamily {
    Access,
    Feeding,
}

impl CounterFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Feeding => "feeding",
        }
    }

    fn counter_names(self) -> &'static [&'static str] {
        match self {
            Self::Access => ACCESS_COUNTERS,
            Self::Feeding => FEEDING_COUNTERS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub device_id: String,
    pub day: String, // YYYY-MM-DD
    pub family: CounterFamily,
}

impl CounterKey {
    pub fn new(device_id: &str, day: &str, family: CounterFamily) -> Self {
        Self {
            device_id: device_id.to_string(),
            day: day.to_string(),
            family,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyCounter {
    pub device_id: String,
    pub day: String,
    pub family: CounterFamily,
    pub counts: BTreeMap<String, i64>,
    pub total_amount: f64,
}

impl DailyCounter {
    /// A row with every counter of the family present and zero.
    pub fn zeroed(key: &CounterKey) -> Self {
        Self {
            device_id: key.device_id.clone(),
            day: key.day.clone(),
            family: key.family,
            counts: key
                .family
                .counter_names()
                .iter()
                .map(|name| (name.to_string(), 0))
                .collect(),
            total_amount: 0.0,
        }
    }

    pub fn count(&self, name: &str) -> i64 {
        self.counts.get(name).copied().unwrap_or(0)
    }

    fn bump(&mut self, name: &str) {
        *self.counts.entry(name.to_string()).or_insert(0) += 1;
    }
}

/// Mutation applied to the current row inside the store's transaction.
pub type Mutation = Box<dyn FnOnce(Option<DailyCounter>) -> DailyCounter + Send>;

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically read the row for `key`, apply `mutation`, write the result.
    async fn run_atomic(&self, key: &CounterKey, mutation: Mutation) -> anyhow::Result<DailyCounter>;

    async fn load(&self, key: &CounterKey) -> anyhow::Result<Option<DailyCounter>>;
}

// ---------------------------------------------------------------------------
// Counter arithmetic
// ---------------------------------------------------------------------------

pub fn apply_access(
    existing: Option<DailyCounter>,
    key: &CounterKey,
    status: AccessStatus,
    direction: Direction,
) -> DailyCounter {
    let mut c = existing.unwrap_or_else(|| DailyCounter::zeroed(key));
    c.bump("total_accesses");
    c.bump(match status {
        AccessStatus::Success => "success_count",
        AccessStatus::Denied => "denied_count",
        AccessStatus::Error | AccessStatus::Timeout => "error_count",
    });
    c.bump(match direction {
        Direction::Entry => "entry_count",
        Direction::Exit => "exit_count",
    });
    c
}

pub fn apply_feeding(
    existing: Option<DailyCounter>,
    key: &CounterKey,
    status: FeedingStatus,
    amount: f64,
) -> DailyCounter {
    let mut c = existing.unwrap_or_else(|| DailyCounter::zeroed(key));
    c.bump("total_feedings");
    c.bump(match status {
        FeedingStatus::Success => "success_count",
        FeedingStatus::Failed => "failed_count",
        FeedingStatus::Partial => "partial_count",
    });
    c.total_amount += amount;
    c
}

// ---------------------------------------------------------------------------
// Day boundaries
// ---------------------------------------------------------------------------

/// Calendar day of `ts` in the reference timezone, as YYYY-MM-DD.
pub fn day_key(ts: OffsetDateTime, offset: UtcOffset) -> String {
    let local = ts.to_offset(offset);
    format!(
        "{:04}-{:02}-{:02}",
        local.year(),
        local.month() as u8,
        local.day()
    )
}

/// Furthest a device clock may drift from the receive time before its
/// timestamp is ignored. A device that has not synced its clock yet reports
/// seconds since boot.
pub const MAX_CLOCK_SKEW: Duration = Duration::DAY;

/// Device-reported unix timestamp if plausible, otherwise the receive time.
pub fn event_time(reported: Option<i64>, received_at: OffsetDateTime) -> OffsetDateTime {
    reported
        .filter(|s| *s > 0)
        .and_then(|s| OffsetDateTime::from_unix_timestamp(s).ok())
        .filter(|ts| (*ts - received_at).abs() <= MAX_CLOCK_SKEW)
        .unwrap_or(received_at)
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct StatisticsAggregator {
    store: Arc<dyn CounterStore>,
}

impl StatisticsAggregator {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    pub async fn record_access(
        &self,
        device_id: &str,
        day: &str,
        status: AccessStatus,
        direction: Direction,
    ) -> MonitorResult<DailyCounter> {
        let key = CounterKey::new(device_id, day, CounterFamily::Access);
        let k = key.clone();
        let counter = self
            .store
            .run_atomic(
                &key,
                Box::new(move |existing| apply_access(existing, &k, status, direction)),
            )
            .await?;
        Ok(counter)
    }

    pub async fn record_feeding(
        &self,
        device_id: &str,
        day: &str,
        status: FeedingStatus,
        amount: f64,
    ) -> MonitorResult<DailyCounter> {
        let key = CounterKey::new(device_id, day, CounterFamily::Feeding);
        let k = key.clone();
        let counter = self
            .store
            .run_atomic(
                &key,
                Box::new(move |existing| apply_feeding(existing, &k, status, amount)),
            )
            .await?;
        Ok(counter)
    }

    pub async fn load(&self, key: &CounterKey) -> MonitorResult<Option<DailyCounter>> {
        Ok(self.store.load(key).await?)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
