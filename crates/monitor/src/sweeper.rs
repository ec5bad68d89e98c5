//! Offline sweeper: periodically flips silent devices to offline, opens one
//! `device_offline` alert per outage and persists the cycle's transitions in
//! one batch.

use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, error, info};

use crate::alerts::AlertKind;
use crate::monitor::SharedMonitor;
use crate::notify;
use crate::presence::OfflineTransition;

/// Run the sweep loop. Intended to be `tokio::spawn`-ed from main.
pub async fn run(monitor: SharedMonitor, every: Duration, threshold: Duration) {
    let threshold = match time::Duration::try_from(threshold) {
        Ok(t) => t,
        Err(e) => {
            error!("offline threshold out of range: {e}");
            return;
        }
    };

    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately; nothing can be stale yet.
    ticker.tick().await;

    info!(
        every_sec = every.as_secs(),
        threshold_sec = threshold.whole_seconds(),
        "offline sweeper started"
    );

    loop {
        ticker.tick().await;
        sweep_once(&monitor, OffsetDateTime::now_utc(), threshold).await;
    }
}

/// One sweep cycle. Returns how many devices went offline.
pub async fn sweep_once(monitor: &SharedMonitor, now: OffsetDateTime, threshold: time::Duration) -> usize {
    let transitions = monitor.presence.sweep(now, threshold, &monitor.alerts);
    if transitions.is_empty() {
        return 0;
    }

    for t in &transitions {
        // A heartbeat during an earlier notification may already have closed
        // this outage.
        if !monitor.alerts.is_open(&t.device_id, AlertKind::Offline) {
            debug!(device = %t.device_id, "offline notification skipped: device is back");
            continue;
        }
        let silent_min = (now - t.last_seen_at).whole_minutes();
        info!(device = %t.device_id, silent_min, "device offline");
        monitor
            .notify(&t.device_id, "offline", |name| {
                notify::offline_notification(&t.device_id, name, silent_min)
            })
            .await;
    }

    let still_offline: Vec<OfflineTransition> = transitions
        .iter()
        .filter(|t| monitor.alerts.is_open(&t.device_id, AlertKind::Offline))
        .cloned()
        .collect();

    // The in-memory transition stands even if this write fails.
    if let Err(e) = monitor.db.mark_offline(&still_offline, now).await {
        error!(devices = still_offline.len(), "persisting offline transitions failed: {e:#}");
    }

    transitions.len()
}

// ===========================================================================
// Tests
// ===========================================================================
