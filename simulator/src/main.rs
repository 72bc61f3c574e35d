mod devices;

use devices::FLEET;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::env;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let mqtt_broker = env::var("MQTT_BROKER").unwrap_or_else(|_| "localhost".to_string());
    let mqtt_port: u16 = env::var("MQTT_PORT")
        .unwrap_or_else(|_| "1883".to_string())
        .parse()
        .unwrap_or(1883);
    let interval_secs: u64 = env::var("INTERVAL_SECS")
        .unwrap_or_else(|_| "3".to_string())
        .parse()
        .unwrap_or(3);

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting IoT Simulator");
    info!(
        "Broker: {}:{}, publishing {} devices every {}s",
        mqtt_broker,
        mqtt_port,
        FLEET.len(),
        interval_secs
    );

    let mut rng = rand::thread_rng();
    let client_id = format!("sim-{}", rng.gen::<u32>());

    let mut mqtt_options = MqttOptions::new(&client_id, &mqtt_broker, mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);

    // Spawn eventloop handler
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT eventloop error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("Connected to MQTT broker, starting to publish telemetry");

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    let mut published = 0u64;

    loop {
        ticker.tick().await;

        for device in &FLEET {
            let payload = device.sample(&mut rng);
            let body = match serde_json::to_string(&payload) {
                Ok(b) => b,
                Err(e) => {
                    error!("Failed to serialize payload: {}", e);
                    continue;
                }
            };

            match client
                .publish(device.topic(), QoS::AtLeastOnce, false, body)
                .await
            {
                Ok(_) => {
                    published += 1;
                }
                Err(e) => {
                    warn!("Failed to publish for {}: {}", device.id, e);
                }
            }
        }

        if published % 600 == 0 && published > 0 {
            info!("Published {} messages", published);
        }
    }
}
