mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sim::{DeviceSim, Scenario};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn topic(root: &str, node_id: &str, kind: &str) -> String {
    format!("{root}/{node_id}/{kind}")
}

async fn publish(client: &AsyncClient, topic: &str, payload: Vec<u8>) {
    if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, payload).await {
        warn!(%topic, "publish error: {e}");
    } else {
        info!(%topic, "published");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let node_id = env::var("NODE_ID").unwrap_or_else(|_| "feeder-1".to_string());
    let root = env::var("TOPIC_ROOT").unwrap_or_else(|_| "pet-smart-home".to_string());
    let heartbeat_every_s: u64 = env_or("HEARTBEAT_EVERY_S", 60);
    let status_every_s: u64 = env_or("STATUS_EVERY_S", 30);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let mut mqttoptions = MqttOptions::new(format!("petcare-node-{node_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // Publish-only, but the eventloop must run to keep the connection alive.
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("node connected to mqtt"),
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    info!(%node_id, %root, %scenario, heartbeat_every_s, status_every_s, "simulated device starting");

    let mut device = DeviceSim::new(scenario);
    let mut heartbeat = tokio::time::interval(Duration::from_secs(heartbeat_every_s));
    let mut status = tokio::time::interval(Duration::from_secs(status_every_s));

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let payload = serde_json::to_vec(&device.telemetry(now_unix()))?;
                publish(&client, &topic(&root, &node_id, "heartbeat"), payload).await;
            }
            _ = status.tick() => {
                let now = now_unix();
                device.tick(status_every_s as i64);
                let payload = serde_json::to_vec(&device.telemetry(now))?;
                publish(&client, &topic(&root, &node_id, "status"), payload).await;

                for ev in device.events(now) {
                    publish(&client, &topic(&root, &node_id, ev.kind()), ev.to_json()?).await;
                }
            }
        }
    }
}
