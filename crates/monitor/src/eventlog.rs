//! Append-only event records. Rows are inserted once and never updated or
//! deleted by the monitor.

use anyhow::{Context, Result};
use time::{OffsetDateTime, UtcOffset};

use crate::db::Db;
use crate::mqtt::{
    wire_name, AccessEvent, AccessMethod, AccessStatus, Direction, ErrorReport, FeedingEvent,
    FeedingStatus,
};
use crate::stats::{day_key, event_time};

#[derive(Debug, Clone, PartialEq)]
pub struct AccessRecord {
    pub device_id: String,
    pub pet_id: Option<String>,
    pub direction: Direction,
    pub method: AccessMethod,
    pub status: AccessStatus,
    pub error_message: Option<String>,
    pub rfid_tag: Option<String>,
    pub ts: OffsetDateTime,
    pub day: String,
}

impl AccessRecord {
    pub fn new(device_id: &str, ev: &AccessEvent, received_at: OffsetDateTime, tz: UtcOffset) -> Self {
        let ts = event_time(ev.timestamp, received_at);
        Self {
            device_id: device_id.to_string(),
            pet_id: ev.pet_id.clone(),
            direction: ev.direction,
            method: ev.method,
            status: ev.status,
            error_message: ev.error_message.clone(),
            rfid_tag: ev.rfid_tag.clone(),
            ts,
            day: day_key(ts, tz),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedingRecord {
    pub device_id: String,
    pub pet_id: Option<String>,
    pub amount: f64,
    pub scheduled_amount: Option<f64>,
    pub status: FeedingStatus,
    pub error_message: Option<String>,
    pub remaining_food: Option<f64>,
    pub ts: OffsetDateTime,
    pub day: String,
}

impl FeedingRecord {
    pub fn new(device_id: &str, ev: &FeedingEvent, received_at: OffsetDateTime, tz: UtcOffset) -> Self {
        let ts = event_time(ev.timestamp, received_at);
        Self {
            device_id: device_id.to_string(),
            pet_id: ev.pet_id.clone(),
            amount: ev.amount,
            scheduled_amount: ev.scheduled_amount,
            status: ev.status,
            error_message: ev.error_message.clone(),
            remaining_food: ev.remaining_food,
            ts,
            day: day_key(ts, tz),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub device_id: String,
    pub message: String,
    pub severity: String,
    pub ts: OffsetDateTime,
}

impl ErrorRecord {
    pub fn new(device_id: &str, report: &ErrorReport, received_at: OffsetDateTime) -> Self {
        Self {
            device_id: device_id.to_string(),
            message: report.message.clone(),
            severity: report.severity.clone(),
            ts: event_time(report.timestamp, received_at),
        }
    }
}

impl Db {
    pub async fn append_access(&self, r: &AccessRecord) -> Result<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO access_events (
              device_id, pet_id, direction, method, status,
              error_message, rfid_tag, ts, day
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&r.device_id)
        .bind(&r.pet_id)
        .bind(wire_name(&r.direction))
        .bind(wire_name(&r.method))
        .bind(wire_name(&r.status))
        .bind(&r.error_message)
        .bind(&r.rfid_tag)
        .bind(r.ts.unix_timestamp())
        .bind(&r.day)
        .execute(self.pool())
        .await
        .context("append_access failed")?;
        Ok(res.last_insert_rowid())
    }

    pub async fn append_feeding(&self, r: &FeedingRecord) -> Result<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO feeding_events (
              device_id, pet_id, amount, scheduled_amount, status,
              error_message, remaining_food, ts, day
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&r.device_id)
        .bind(&r.pet_id)
        .bind(r.amount)
        .bind(r.scheduled_amount)
        .bind(wire_name(&r.status))
        .bind(&r.error_message)
        .bind(r.remaining_food)
        .bind(r.ts.unix_timestamp())
        .bind(&r.day)
        .execute(self.pool())
        .await
        .context("append_feeding failed")?;
        Ok(res.last_insert_rowid())
    }

    pub async fn append_error(&self, r: &ErrorRecord) -> Result<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO error_events (device_id, message, severity, ts, resolved)
            VALUES (?, ?, ?, ?, 0)
            "#,
        )
        .bind(&r.device_id)
        .bind(&r.message)
        .bind(&r.severity)
        .bind(r.ts.unix_timestamp())
        .execute(self.pool())
        .await
        .context("append_error failed")?;
        Ok(res.last_insert_rowid())
    }

    pub async fn error_count(&self, device_id: &str) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM error_events WHERE device_id = ?")
            .bind(device_id)
            .fetch_one(self.pool())
            .await
            .context("error_count failed")?;
        Ok(n)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
