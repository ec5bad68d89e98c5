use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::alerts::OpenAlert;
use crate::db::DeviceStatusRow;
use crate::monitor::SharedMonitor;
use crate::presence::PresenceRecord;
use crate::stats::{CounterFamily, CounterKey, DailyCounter};

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StatusResponse {
    uptime_sec: u64,
    mqtt_connected: bool,
    devices: Vec<PresenceRecord>,
    open_alerts: Vec<OpenAlert>,
}

#[derive(Serialize)]
struct DeviceResponse {
    device_id: String,
    presence: Option<PresenceRecord>,
    persisted: Option<DeviceStatusRow>,
    open_alerts: Vec<OpenAlert>,
    error_reports: i64,
}

#[derive(Serialize)]
struct NotificationEntry {
    title: String,
    priority: String,
    data: serde_json::Value,
}

#[derive(Serialize)]
struct DeviceStatsResponse {
    device_id: String,
    day: String,
    access: Option<DailyCounter>,
    feeding: Option<DailyCounter>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(monitor: SharedMonitor) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/devices/{device_id}", get(api_device))
        .route("/api/devices/{device_id}/stats/{day}", get(api_device_stats))
        .route("/api/summaries/{day}", get(api_summary))
        .route("/api/users/{user_id}/notifications", get(api_notifications))
        .with_state(monitor)
}

async fn api_status(State(monitor): State<SharedMonitor>) -> impl IntoResponse {
    Json(StatusResponse {
        uptime_sec: monitor.started_at.elapsed().as_secs(),
        mqtt_connected: monitor.mqtt_connected(),
        devices: monitor.presence.snapshot(),
        open_alerts: monitor.alerts.open_alerts(),
    })
}

fn storage_error(e: impl std::fmt::Display) -> Response {
    error!("status api storage error: {e:#}");
    (StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable").into_response()
}

async fn api_device(
    State(monitor): State<SharedMonitor>,
    Path(device_id): Path<String>,
) -> Response {
    let presence = monitor.presence.get(&device_id);
    let persisted = match monitor.db.device_status(&device_id).await {
        Ok(row) => row,
        Err(e) => return storage_error(e),
    };
    if presence.is_none() && persisted.is_none() {
        return (StatusCode::NOT_FOUND, "unknown device").into_response();
    }
    let error_reports = match monitor.db.error_count(&device_id).await {
        Ok(n) => n,
        Err(e) => return storage_error(e),
    };
    let open_alerts = monitor
        .alerts
        .open_alerts()
        .into_iter()
        .filter(|a| a.device_id == device_id)
        .collect();

    Json(DeviceResponse {
        device_id,
        presence,
        persisted,
        open_alerts,
        error_reports,
    })
    .into_response()
}

async fn api_summary(State(monitor): State<SharedMonitor>, Path(day): Path<String>) -> Response {
    match monitor.db.get_daily_summary(&day).await {
        Ok(Some(summary)) => Json(summary).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "no summary for that day").into_response(),
        Err(e) => storage_error(e),
    }
}

async fn api_notifications(
    State(monitor): State<SharedMonitor>,
    Path(user_id): Path<String>,
) -> Response {
    match monitor.db.notifications_for(&user_id, 50).await {
        Ok(rows) => Json(
            rows.into_iter()
                .map(|(title, priority, data)| NotificationEntry { title, priority, data })
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => storage_error(e),
    }
}

async fn api_device_stats(
    State(monitor): State<SharedMonitor>,
    Path((device_id, day)): Path<(String, String)>,
) -> Response {
    let access = monitor
        .stats
        .load(&CounterKey::new(&device_id, &day, CounterFamily::Access))
        .await;
    let feeding = monitor
        .stats
        .load(&CounterKey::new(&device_id, &day, CounterFamily::Feeding))
        .await;

    match (access, feeding) {
        (Ok(access), Ok(feeding)) => Json(DeviceStatsResponse {
            device_id,
            day,
            access,
            feeding,
        })
        .into_response(),
        (Err(e), _) | (_, Err(e)) => storage_error(e),
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(monitor: SharedMonitor, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("status api listening on http://{addr}");

    axum::serve(listener, router(monitor))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertKind, Thresholds};
    use crate::db::Db;
    use crate::monitor::Monitor;
    use crate::notify::testing::RecordingDelivery;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use time::macros::{datetime, offset};
    use tower::ServiceExt;

    async fn monitor() -> SharedMonitor {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        Arc::new(Monitor::new(
            db,
            Arc::new(RecordingDelivery::default()),
            Thresholds::default(),
            offset!(UTC),
        ))
    }

    async fn get_json(monitor: SharedMonitor, uri: &str) -> (StatusCode, Value) {
        let res = router(monitor)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    // -- /api/status ---------------------------------------------------------

    #[tokio::test]
    async fn status_lists_presence_and_alerts() {
        let m = monitor().await;
        m.set_mqtt_connected(true);
        m.touch("d1", json!({ "batteryLevel": 12 }), datetime!(2024-05-01 10:00 UTC))
            .await;
        m.alerts.open("d1", AlertKind::LowBattery);

        let (status, body) = get_json(m, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mqtt_connected"], true);
        assert_eq!(body["devices"][0]["device_id"], "d1");
        assert_eq!(body["devices"][0]["state"], "online");
        assert_eq!(body["devices"][0]["last_telemetry"]["batteryLevel"], 12);
        assert_eq!(body["open_alerts"][0]["kind"], "low_battery");
    }

    // -- /api/devices/{id}/stats/{day} --------------------------------------

    #[tokio::test]
    async fn device_stats_returns_both_families() {
        let m = monitor().await;
        m.handle_access(
            "d1",
            &json!({ "direction": "exit", "method": "ble", "status": "success" }),
            datetime!(2024-05-01 10:00 UTC),
        )
        .await
        .unwrap();

        let (status, body) = get_json(m, "/api/devices/d1/stats/2024-05-01").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["access"]["counts"]["exit_count"], 1);
        assert_eq!(body["access"]["family"], "access");
        assert!(body["feeding"].is_null());
    }

    // -- /api/devices/{id} ---------------------------------------------------

    #[tokio::test]
    async fn device_detail_merges_presence_and_persisted_state() {
        let m = monitor().await;
        let at = datetime!(2024-05-01 10:00 UTC);
        m.touch("d1", json!({ "batteryLevel": 5 }), at).await;
        m.handle_heartbeat("d1", &json!({ "batteryLevel": 5 }), at).await.unwrap();
        m.handle_error("d1", &json!({ "message": "jam" }), at).await.unwrap();

        let (status, body) = get_json(m, "/api/devices/d1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["presence"]["state"], "online");
        assert_eq!(body["persisted"]["battery_level"], 5.0);
        assert_eq!(body["open_alerts"][0]["kind"], "low_battery");
        assert_eq!(body["error_reports"], 1);
    }

    #[tokio::test]
    async fn unknown_device_is_404() {
        let res = router(monitor().await)
            .oneshot(Request::builder().uri("/api/devices/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    // -- /api/summaries, /api/users/{id}/notifications ----------------------

    #[tokio::test]
    async fn summary_is_served_after_rollup() {
        let m = monitor().await;
        crate::rollup::rollup_day(&m, "2024-05-01").await.unwrap();

        let (status, body) = get_json(m, "/api/summaries/2024-05-01").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_feedings"], 0);
        assert_eq!(body["active_devices"], 0);
    }

    #[tokio::test]
    async fn notifications_for_unknown_user_are_empty() {
        let (status, body) = get_json(monitor().await, "/api/users/u9/notifications").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn device_stats_for_quiet_day_are_null() {
        let (status, body) = get_json(monitor().await, "/api/devices/d9/stats/2024-01-01").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["access"].is_null());
        assert!(body["feeding"].is_null());
    }
}
