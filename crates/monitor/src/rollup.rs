//! Daily fleet summary, computed from the event logs for the previous day.

use std::time::Duration;

use time::{OffsetDateTime, UtcOffset};
use tracing::{error, info};

use crate::db::DailySummary;
use crate::monitor::SharedMonitor;
use crate::stats::day_key;

pub async fn run(monitor: SharedMonitor, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    info!(every_sec = every.as_secs(), "daily rollup started");

    loop {
        ticker.tick().await;
        let day = previous_day(OffsetDateTime::now_utc(), monitor.tz);
        match rollup_day(&monitor, &day).await {
            Ok(s) => info!(
                day = %s.day,
                feedings = s.total_feedings,
                accesses = s.total_accesses,
                active_devices = s.active_devices,
                "daily summary written"
            ),
            Err(e) => error!(%day, "daily rollup failed: {e:#}"),
        }
    }
}

/// The calendar day before `now` in the reference offset.
pub fn previous_day(now: OffsetDateTime, tz: UtcOffset) -> String {
    day_key(now - time::Duration::days(1), tz)
}

/// Compute and upsert the summary for `day`. Re-running overwrites it.
pub async fn rollup_day(monitor: &SharedMonitor, day: &str) -> anyhow::Result<DailySummary> {
    let summary = DailySummary {
        day: day.to_string(),
        total_feedings: monitor.db.count_feedings_on(day).await?,
        total_accesses: monitor.db.count_accesses_on(day).await?,
        active_devices: i64::try_from(monitor.presence.online_count())?,
    };
    monitor
        .db
        .upsert_daily_summary(&summary, OffsetDateTime::now_utc())
        .await?;
    Ok(summary)
}
