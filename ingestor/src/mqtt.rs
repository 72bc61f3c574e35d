use crate::errors::{Error, Result};
use crate::metrics::{CHANNEL_FULL_TOTAL, MESSAGES_TOTAL};
use crate::pipeline::RawMessage;
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 30_000;

/// Transport receive loop. Holds one broker connection, subscribes to the
/// device telemetry pattern, and forwards raw messages into the pipeline
/// channel. Connection loss is never fatal: the loop backs off and rumqttc
/// re-dials; the subscription is replayed on every ConnAck.
pub async fn run_mqtt(
    broker: String,
    port: u16,
    client_id: String,
    topic: String,
    tx: mpsc::Sender<RawMessage>,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    let mut backoff_ms = INITIAL_BACKOFF_MS;
    let mut connected = false;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to broker, subscribing to {} with QoS 1", topic);
                connected = true;
                backoff_ms = INITIAL_BACKOFF_MS;

                if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                    error!("Subscribe request failed: {}", e);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                MESSAGES_TOTAL.inc();
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );

                let msg = RawMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                forward(msg, &tx).await?;
            }
            Ok(_) => {}
            Err(e) => {
                if connected {
                    warn!("MQTT connection lost: {}", e);
                    connected = false;
                } else {
                    warn!("MQTT reconnect failed: {}", e);
                }

                // Bounded, jittered backoff before the next dial attempt.
                let jitter = rand::thread_rng().gen_range(0..=backoff_ms / 4);
                tokio::time::sleep(Duration::from_millis(backoff_ms + jitter)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

/// Hand a message to the pipeline without blocking the receive loop; only a
/// full channel degrades to an awaited send. Messages are not buffered here
/// beyond the channel itself — delivery is at-most-once.
async fn forward(msg: RawMessage, tx: &mpsc::Sender<RawMessage>) -> Result<()> {
    match tx.try_send(msg) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(msg)) => {
            CHANNEL_FULL_TOTAL.inc();
            debug!("Pipeline channel full, awaiting capacity");
            tx.send(msg).await.map_err(|_| Error::ChannelSend)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            error!("Pipeline channel closed, cannot forward message");
            Err(Error::ChannelSend)
        }
    }
}
