use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::collections::BTreeMap;
use std::str::FromStr;
use time::OffsetDateTime;
use tracing::warn;

use crate::mqtt::DeviceTelemetry;
use crate::presence::OfflineTransition;
use crate::stats::{CounterKey, CounterStore, DailyCounter, Mutation};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub name: String,
    pub push_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub name: String,
    pub owner_id: Option<String>,
}

/// Persisted device row as seen by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DeviceStatusRow {
    pub device_id: String,
    pub status: String,
    pub last_seen: Option<i64>,
    pub battery_level: Option<f64>,
    pub wifi_signal: Option<f64>,
    pub free_memory: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailySummary {
    pub day: String,
    pub total_feedings: i64,
    pub total_accesses: i64,
    pub active_devices: i64,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/petcare/petcare.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // An in-memory database is shared-cache; one connection keeps writers
        // from tripping over table locks.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Users + devices
    // ----------------------------

    pub async fn upsert_user(&self, u: &UserRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, name, push_token)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
              name=excluded.name,
              push_token=excluded.push_token
            "#,
        )
        .bind(&u.user_id)
        .bind(&u.name)
        .bind(&u.push_token)
        .execute(&self.pool)
        .await
        .context("upsert_user failed")?;
        Ok(())
    }

    pub async fn upsert_device(&self, d: &DeviceRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, name, owner_id)
            VALUES (?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              name=excluded.name,
              owner_id=excluded.owner_id
            "#,
        )
        .bind(&d.device_id)
        .bind(&d.name)
        .bind(&d.owner_id)
        .execute(&self.pool)
        .await
        .context("upsert_device failed")?;
        Ok(())
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let row: Option<(String, String, Option<String>)> = sqlx::query_as(
            "SELECT device_id, name, owner_id FROM devices WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_device failed")?;

        Ok(row.map(|(device_id, name, owner_id)| DeviceRecord {
            device_id,
            name,
            owner_id,
        }))
    }

    /// The delivery address of a user, if the user exists and has one.
    pub async fn push_address(&self, user_id: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT push_token FROM users WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .context("push_address failed")?;

        Ok(row
            .and_then(|(token,)| token)
            .filter(|t| !t.trim().is_empty()))
    }

    // ----------------------------
    // Persisted device status
    // ----------------------------

    /// Store the latest metrics and mark the device online. Unregistered
    /// devices get a row named after their id and no owner.
    pub async fn record_device_telemetry(
        &self,
        device_id: &str,
        t: &DeviceTelemetry,
        seen_at: OffsetDateTime,
    ) -> Result<()> {
        let ts = seen_at.unix_timestamp();
        sqlx::query(
            r#"
            INSERT INTO devices (
              device_id, name, status, last_seen,
              battery_level, wifi_signal, free_memory, uptime, updated_at
            ) VALUES (?, ?, 'online', ?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
              status='online',
              last_seen=excluded.last_seen,
              battery_level=COALESCE(excluded.battery_level, devices.battery_level),
              wifi_signal=COALESCE(excluded.wifi_signal, devices.wifi_signal),
              free_memory=COALESCE(excluded.free_memory, devices.free_memory),
              uptime=COALESCE(excluded.uptime, devices.uptime),
              updated_at=excluded.updated_at
            "#,
        )
        .bind(device_id)
        .bind(device_id)
        .bind(ts)
        .bind(t.battery_level)
        .bind(t.wifi_signal)
        .bind(t.free_memory)
        .bind(t.uptime)
        .bind(ts)
        .execute(&self.pool)
        .await
        .context("record_device_telemetry failed")?;
        Ok(())
    }

    /// Persist one sweep cycle's offline transitions in a single transaction.
    /// Rows refreshed by telemetry after the device was last seen are left
    /// alone.
    pub async fn mark_offline(&self, transitions: &[OfflineTransition], now: OffsetDateTime) -> Result<()> {
        if transitions.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.context("mark_offline: begin failed")?;
        for t in transitions {
            sqlx::query(
                r#"
                UPDATE devices
                SET status = 'offline', last_seen = ?, updated_at = ?
                WHERE device_id = ? AND (last_seen IS NULL OR last_seen <= ?)
                "#,
            )
            .bind(t.last_seen_at.unix_timestamp())
            .bind(now.unix_timestamp())
            .bind(&t.device_id)
            .bind(t.last_seen_at.unix_timestamp())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("mark_offline failed for {}", t.device_id))?;
        }
        tx.commit().await.context("mark_offline: commit failed")?;
        Ok(())
    }

    pub async fn device_status(&self, device_id: &str) -> Result<Option<DeviceStatusRow>> {
        sqlx::query_as::<_, DeviceStatusRow>(
            r#"
            SELECT device_id, status, last_seen, battery_level, wifi_signal, free_memory
            FROM devices
            WHERE device_id = ?
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("device_status failed")
    }

    // ----------------------------
    // Notification history
    // ----------------------------

    pub async fn insert_notification(
        &self,
        recipient: &str,
        title: &str,
        body: &str,
        data: &serde_json::Value,
        priority: &str,
        ts: OffsetDateTime,
    ) -> Result<i64> {
        let data_json = serde_json::to_string(data).context("encode notification data")?;
        let res = sqlx::query(
            r#"
            INSERT INTO notifications (recipient, title, body, data, priority, read, ts)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(recipient)
        .bind(title)
        .bind(body)
        .bind(data_json)
        .bind(priority)
        .bind(ts.unix_timestamp())
        .execute(&self.pool)
        .await
        .context("insert_notification failed")?;
        Ok(res.last_insert_rowid())
    }

    /// Most recent notifications for a recipient: (title, priority, data).
    pub async fn notifications_for(&self, recipient: &str, limit: i64) -> Result<Vec<(String, String, serde_json::Value)>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT title, priority, data
            FROM notifications
            WHERE recipient = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(recipient)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("notifications_for failed")?;

        rows.into_iter()
            .map(|(title, priority, data)| {
                let data = serde_json::from_str(&data).context("decode notification data")?;
                Ok((title, priority, data))
            })
            .collect()
    }

    // ----------------------------
    // Daily rollup
    // ----------------------------

    pub async fn count_feedings_on(&self, day: &str) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feeding_events WHERE day = ?")
            .bind(day)
            .fetch_one(&self.pool)
            .await
            .context("count_feedings_on failed")?;
        Ok(n)
    }

    pub async fn count_accesses_on(&self, day: &str) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM access_events WHERE day = ?")
            .bind(day)
            .fetch_one(&self.pool)
            .await
            .context("count_accesses_on failed")?;
        Ok(n)
    }

    pub async fn upsert_daily_summary(&self, s: &DailySummary, generated_at: OffsetDateTime) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_summaries (day, total_feedings, total_accesses, active_devices, generated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(day) DO UPDATE SET
              total_feedings=excluded.total_feedings,
              total_accesses=excluded.total_accesses,
              active_devices=excluded.active_devices,
              generated_at=excluded.generated_at
            "#,
        )
        .bind(&s.day)
        .bind(s.total_feedings)
        .bind(s.total_accesses)
        .bind(s.active_devices)
        .bind(generated_at.unix_timestamp())
        .execute(&self.pool)
        .await
        .context("upsert_daily_summary failed")?;
        Ok(())
    }

    pub async fn get_daily_summary(&self, day: &str) -> Result<Option<DailySummary>> {
        let row: Option<(String, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT day, total_feedings, total_accesses, active_devices
            FROM daily_summaries
            WHERE day = ?
            "#,
        )
        .bind(day)
        .fetch_optional(&self.pool)
        .await
        .context("get_daily_summary failed")?;

        Ok(row.map(|(day, total_feedings, total_accesses, active_devices)| DailySummary {
            day,
            total_feedings,
            total_accesses,
            active_devices,
        }))
    }

    // ----------------------------
    // Daily counters
    // ----------------------------

    async fn read_counter(conn: &mut SqliteConnection, key: &CounterKey) -> Result<Option<DailyCounter>> {
        let row: Option<(String, f64)> = sqlx::query_as(
            r#"
            SELECT counts, total_amount
            FROM daily_counters
            WHERE device_id = ? AND day = ? AND family = ?
            "#,
        )
        .bind(&key.device_id)
        .bind(&key.day)
        .bind(key.family.as_str())
        .fetch_optional(&mut *conn)
        .await
        .context("read daily counter failed")?;

        row.map(|(counts, total_amount)| {
            let counts: BTreeMap<String, i64> =
                serde_json::from_str(&counts).context("decode daily counter")?;
            Ok(DailyCounter {
                device_id: key.device_id.clone(),
                day: key.day.clone(),
                family: key.family,
                counts,
                total_amount,
            })
        })
        .transpose()
    }

    async fn write_counter(conn: &mut SqliteConnection, c: &DailyCounter) -> Result<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let counts = serde_json::to_string(&c.counts).context("encode daily counter")?;
        sqlx::query(
            r#"
            INSERT INTO daily_counters (device_id, day, family, counts, total_amount, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id, day, family) DO UPDATE SET
              counts=excluded.counts,
              total_amount=excluded.total_amount,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(&c.device_id)
        .bind(&c.day)
        .bind(c.family.as_str())
        .bind(counts)
        .bind(c.total_amount)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .context("write daily counter failed")?;
        Ok(())
    }
}

#[async_trait]
impl CounterStore for Db {
    /// `BEGIN IMMEDIATE` takes the write lock before the read, so concurrent
    /// increments queue on the lock instead of racing.
    async fn run_atomic(&self, key: &CounterKey, mutation: Mutation) -> Result<DailyCounter> {
        let mut conn = self.pool.acquire().await.context("acquire connection failed")?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .context("begin counter transaction failed")?;

        let result = async {
            let existing = Self::read_counter(&mut *conn, key).await?;
            let updated = mutation(existing);
            Self::write_counter(&mut *conn, &updated).await?;
            sqlx::query("COMMIT")
                .execute(&mut *conn)
                .await
                .context("commit counter transaction failed")?;
            Ok::<_, anyhow::Error>(updated)
        }
        .await;

        if result.is_err() {
            if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                warn!(device = %key.device_id, day = %key.day, "counter rollback failed: {e}");
            }
        }
        result
    }

    async fn load(&self, key: &CounterKey) -> Result<Option<DailyCounter>> {
        let mut conn = self.pool.acquire().await.context("acquire connection failed")?;
        Self::read_counter(&mut *conn, key).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
