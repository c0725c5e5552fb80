//! Live smoke client for a running bridge
//!
//! Listens on every node's `out` / `out_json` topics and, when given a node
//! and a command, writes the command to that node's `in` topic.
//!
//! ```bash
//! BROKER=127.0.0.1 cargo run -- m3-42 "blink"
//! ```

use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Deserialize;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

// ===== Configuration =====
const DEFAULT_BROKER: &str = "127.0.0.1";
const MQTT_PORT: u16 = 1883;
const CLIENT_ID: &str = "libridge-smoke-client";

const OUT_FILTER: &str = "testbed/node/+/out";
const OUT_JSON_FILTER: &str = "testbed/node/+/out_json";

/// Record published by the bridge for each serial line
#[derive(Debug, Deserialize)]
struct OutboundRecord {
    timestamp: f64,
    node_id: String,
    payload: serde_json::Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let broker = std::env::var("BROKER").unwrap_or_else(|_| DEFAULT_BROKER.to_string());
    let mut args = std::env::args().skip(1);
    let command = match (args.next(), args.next()) {
        (Some(node), Some(data)) => Some((node, data)),
        _ => None,
    };

    let mut options = MqttOptions::new(CLIENT_ID, broker.as_str(), MQTT_PORT);
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(options, 10);

    client.subscribe(OUT_FILTER, QoS::AtMostOnce).await?;
    client.subscribe(OUT_JSON_FILTER, QoS::AtMostOnce).await?;
    info!(%broker, "listening for bridge output");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                if let Some((node, data)) = &command {
                    let topic = format!("testbed/node/{}/in", node);
                    client
                        .publish(topic.as_str(), QoS::AtMostOnce, false, data.clone().into_bytes())
                        .await?;
                    info!(%topic, %data, "command sent");
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                match serde_json::from_slice::<OutboundRecord>(&publish.payload) {
                    Ok(record) => info!(
                        topic = %publish.topic,
                        node = %record.node_id,
                        ts = record.timestamp,
                        payload = %record.payload,
                        "record"
                    ),
                    Err(e) => warn!(topic = %publish.topic, error = %e, "unexpected payload"),
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {}. Reconnecting...", e);
                sleep(Duration::from_secs(5)).await;
            }
        }
    }
}
