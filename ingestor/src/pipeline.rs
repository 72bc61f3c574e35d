use crate::decode;
use crate::hub::FanoutHub;
use crate::liveness::DeviceRegistry;
use crate::metrics::{DB_FAILURES_TOTAL, INGEST_LATENCY_SECONDS, READINGS_TOTAL, REJECTED_TOTAL};
use crate::model::UpdateEvent;
use crate::storage::Storage;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One raw message as delivered by the transport: topic plus payload bytes.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Single consumer of the transport channel. Channel order is arrival
/// order, so readings for any one device are processed in the order the
/// transport delivered them.
pub async fn run_pipeline(
    mut rx: mpsc::Receiver<RawMessage>,
    registry: Arc<DeviceRegistry>,
    storage: Arc<dyn Storage>,
    hub: Arc<FanoutHub>,
) {
    info!("Ingestion pipeline started");

    while let Some(msg) = rx.recv().await {
        ingest(msg, &registry, storage.as_ref(), &hub).await;
    }

    info!("Ingestion pipeline stopped");
}

/// One pass per message: decode, refresh liveness, persist, fan out.
/// Persistence is best-effort; observers still see the live value when the
/// store is down.
async fn ingest(msg: RawMessage, registry: &DeviceRegistry, storage: &dyn Storage, hub: &FanoutHub) {
    let start = tokio::time::Instant::now();

    let decoded = match decode::decode(&msg.topic, &msg.payload) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(topic = %msg.topic, "Dropping message: {}", e);
            REJECTED_TOTAL.inc();
            return;
        }
    };

    let device_id = decoded.reading.device_id.clone();
    let (device, transition) = registry.observe(&device_id, &decoded.meta, Utc::now()).await;
    READINGS_TOTAL.inc();

    if let Err(e) = storage.upsert_device(&device).await {
        warn!(device_id = %device_id, "Device record not persisted: {}", e);
        DB_FAILURES_TOTAL.inc();
    }
    if let Err(e) = storage.append_reading(&decoded.reading).await {
        warn!(device_id = %device_id, "Reading not persisted, observers still served: {}", e);
        DB_FAILURES_TOTAL.inc();
    }

    if let Some(change) = transition {
        hub.publish(&UpdateEvent::from(change)).await;
    }
    hub.publish(&UpdateEvent::Telemetry {
        reading: decoded.reading,
    })
    .await;

    INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::MemoryStorage;
    use axum::extract::ws::Message;
    use std::time::Duration;
    use uuid::Uuid;

    fn raw(device_id: &str, value: serde_json::Value, ts: &str) -> RawMessage {
        RawMessage {
            topic: format!("iot/devices/{device_id}/telemetry"),
            payload: serde_json::to_vec(&serde_json::json!({
                "deviceId": device_id,
                "deviceType": "temperature",
                "metric": "temperature",
                "value": value,
                "unit": "C",
                "location": "Office",
                "timestamp": ts,
            }))
            .unwrap(),
        }
    }

    fn fixtures() -> (DeviceRegistry, MemoryStorage, FanoutHub) {
        (
            DeviceRegistry::new(Duration::from_secs(10)),
            MemoryStorage::new(),
            FanoutHub::new(),
        )
    }

    async fn recv_event(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Message>) -> serde_json::Value {
        let Some(Message::Text(text)) = rx.recv().await else {
            panic!("expected text frame");
        };
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_valid_reading_full_pass() {
        let (registry, storage, hub) = fixtures();
        let mut rx = hub.add(Uuid::new_v4()).await;

        let msg = raw("machine_01", serde_json::json!(21.5), "2026-08-08T10:00:00Z");
        ingest(msg, &registry, &storage, &hub).await;

        // Device is online with a refreshed last_seen.
        let device = registry.get("machine_01").await.unwrap();
        assert_eq!(device.status, crate::model::DeviceStatus::Online);

        // One persisted reading.
        let stored = storage.recent_readings("machine_01", 10).await.unwrap();
        assert_eq!(stored.len(), 1);

        // First contact emits status-change then telemetry-update.
        let first = recv_event(&mut rx).await;
        assert_eq!(first["event"], "status-change");
        assert_eq!(first["status"], "online");
        let second = recv_event(&mut rx).await;
        assert_eq!(second["event"], "telemetry-update");
        assert_eq!(second["value"], 21.5);
    }

    #[tokio::test]
    async fn test_malformed_payload_changes_nothing() {
        let (registry, storage, hub) = fixtures();
        let mut rx = hub.add(Uuid::new_v4()).await;

        let msg = RawMessage {
            topic: "iot/devices/machine_01/telemetry".to_string(),
            payload: b"{broken".to_vec(),
        };
        ingest(msg, &registry, &storage, &hub).await;

        assert!(registry.get("machine_01").await.is_none());
        assert!(storage.readings.lock().await.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_persistence_failure_still_fans_out() {
        let (registry, storage, hub) = fixtures();
        storage.fail_writes(true);
        let mut rx = hub.add(Uuid::new_v4()).await;

        let msg = raw("machine_01", serde_json::json!(21.5), "2026-08-08T10:00:00Z");
        ingest(msg, &registry, &storage, &hub).await;

        // Nothing persisted, but liveness updated and both events delivered.
        assert!(storage.readings.lock().await.is_empty());
        assert!(registry.get("machine_01").await.is_some());
        assert_eq!(recv_event(&mut rx).await["event"], "status-change");
        assert_eq!(recv_event(&mut rx).await["event"], "telemetry-update");
    }

    #[tokio::test]
    async fn test_reingest_is_idempotent() {
        let (registry, storage, hub) = fixtures();

        let msg = raw("machine_01", serde_json::json!(21.5), "2026-08-08T10:00:00Z");
        ingest(msg.clone(), &registry, &storage, &hub).await;
        let last_seen = registry.get("machine_01").await.unwrap().last_seen;

        ingest(msg, &registry, &storage, &hub).await;

        let device = registry.get("machine_01").await.unwrap();
        assert!(device.last_seen >= last_seen);
        let stored = storage.recent_readings("machine_01", 10).await.unwrap();
        assert_eq!(stored.len(), 1, "duplicate reading must not be stored twice");
    }

    #[tokio::test]
    async fn test_per_device_order_matches_arrival_order() {
        let (registry, storage, hub) = fixtures();
        let mut rx = hub.add(Uuid::new_v4()).await;

        for i in 0..4 {
            let msg = raw(
                "machine_01",
                serde_json::json!(f64::from(i)),
                &format!("2026-08-08T10:00:0{i}Z"),
            );
            ingest(msg, &registry, &storage, &hub).await;
        }

        // Skip the initial status-change, then expect values in order.
        assert_eq!(recv_event(&mut rx).await["event"], "status-change");
        for i in 0..4 {
            let event = recv_event(&mut rx).await;
            assert_eq!(event["event"], "telemetry-update");
            assert_eq!(event["value"], f64::from(i));
        }
    }

    #[tokio::test]
    async fn test_pipeline_consumes_channel() {
        let (registry, storage, hub) = fixtures();
        let registry = Arc::new(registry);
        let storage: Arc<dyn Storage> = Arc::new(storage);
        let hub = Arc::new(hub);

        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(run_pipeline(
            rx,
            registry.clone(),
            storage.clone(),
            hub.clone(),
        ));

        tx.send(raw("machine_01", serde_json::json!(21.5), "2026-08-08T10:00:00Z"))
            .await
            .unwrap();
        tx.send(raw("machine_02", serde_json::json!(22.5), "2026-08-08T10:00:00Z"))
            .await
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(registry.snapshot().await.len(), 2);
    }
}
