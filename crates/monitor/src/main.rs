mod alerts;
mod config;
mod db;
mod error;
mod eventlog;
mod monitor;
mod mqtt;
mod notify;
mod presence;
mod rollup;
mod router;
mod stats;
mod sweeper;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet};
use std::{env, sync::Arc, time::Duration};
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use monitor::Monitor;
use notify::LogDelivery;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file (seed users + devices) ──────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut cfg = config::load(&config_path)?;

    // ── Env overrides ───────────────────────────────────────────────
    if let Ok(host) = env::var("MQTT_HOST") {
        cfg.mqtt.host = host;
    }
    if let Some(port) = env::var("MQTT_PORT").ok().and_then(|s| s.parse().ok()) {
        cfg.mqtt.port = port;
    }
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:petcare.db?mode=rwc".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;
    config::apply(&cfg, &db).await?;

    // ── Pipeline state ──────────────────────────────────────────────
    let tz = cfg.monitor.utc_offset()?;
    let monitor = Arc::new(Monitor::new(
        db,
        Arc::new(LogDelivery),
        cfg.thresholds.clone(),
        tz,
    ));
    info!(%tz, thresholds = ?cfg.thresholds, "monitor ready");

    // ── Web server ──────────────────────────────────────────────────
    let web_monitor = Arc::clone(&monitor);
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_monitor, web_port).await {
            error!("status api stopped: {e:#}");
        }
    });

    // ── Periodic tasks ──────────────────────────────────────────────
    tokio::spawn(sweeper::run(
        Arc::clone(&monitor),
        cfg.monitor.sweep_interval(),
        cfg.monitor.offline_threshold(),
    ));
    tokio::spawn(rollup::run(
        Arc::clone(&monitor),
        cfg.monitor.rollup_interval(),
    ));

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(&cfg.mqtt.client_id, &cfg.mqtt.host, cfg.mqtt.port);
    mqttoptions.set_keep_alive(Duration::from_secs(cfg.mqtt.keep_alive_sec));
    if let (Some(user), Some(pass)) = (&cfg.mqtt.username, &cfg.mqtt.password) {
        mqttoptions.set_credentials(user, pass);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 64);

    let filters = mqtt::subscriptions(&cfg.mqtt.topic_root);
    info!(broker = %cfg.mqtt.host, port = cfg.mqtt.port, ?filters, "connecting to mqtt");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                // Inline so one device's messages are handled in arrival order.
                router::route(&monitor, &p.topic, &p.payload, OffsetDateTime::now_utc()).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let queued = mqtt::subscribe_all(&client, &filters).await;
                info!(queued, "mqtt connected, subscriptions queued");
                monitor.set_mqtt_connected(true);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                monitor.set_mqtt_connected(false);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                monitor.set_mqtt_connected(false);
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
