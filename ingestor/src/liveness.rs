use crate::hub::FanoutHub;
use crate::model::{Device, DeviceMeta, DeviceStatus, StatusChange, UpdateEvent};
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Authoritative in-memory map of device id to current record.
///
/// The ingestion pipeline and the sweep task are the only writers; the REST
/// layer reads snapshots. All access goes through the interior lock, so a
/// device record can never see interleaved updates to last_seen/status.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
    staleness_timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(staleness_timeout: Duration) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            staleness_timeout,
        }
    }

    /// Record a valid reading for a device: upsert on first contact, refresh
    /// last_seen, force status online. Returns the updated record plus a
    /// transition for `unknown -> online` and `offline -> online`; a device
    /// that was already online produces no event.
    pub async fn observe(
        &self,
        device_id: &str,
        meta: &DeviceMeta,
        now: DateTime<Utc>,
    ) -> (Device, Option<StatusChange>) {
        let mut devices = self.devices.write().await;

        match devices.get_mut(device_id) {
            Some(device) => {
                let was_offline = device.status == DeviceStatus::Offline;
                device.kind = meta.kind;
                device.unit = meta.unit.clone();
                device.location = meta.location.clone();
                device.status = DeviceStatus::Online;
                // Redelivered messages must never move last_seen backward.
                if now > device.last_seen {
                    device.last_seen = now;
                }

                let change = was_offline.then(|| StatusChange {
                    device_id: device_id.to_string(),
                    status: DeviceStatus::Online,
                    timestamp: now,
                });
                (device.clone(), change)
            }
            None => {
                let device = Device {
                    device_id: device_id.to_string(),
                    kind: meta.kind,
                    unit: meta.unit.clone(),
                    location: meta.location.clone(),
                    status: DeviceStatus::Online,
                    last_seen: now,
                };
                devices.insert(device_id.to_string(), device.clone());

                let change = StatusChange {
                    device_id: device_id.to_string(),
                    status: DeviceStatus::Online,
                    timestamp: now,
                };
                (device, Some(change))
            }
        }
    }

    /// Demote every device unheard-from for longer than the staleness
    /// timeout. Staleness is evaluated under the write lock, so a device
    /// refreshed by the pipeline between sweep ticks is left alone. Each
    /// demotion yields exactly one transition; devices already offline are
    /// skipped.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<StatusChange> {
        let mut devices = self.devices.write().await;
        let mut changes = Vec::new();

        for device in devices.values_mut() {
            if device.status == DeviceStatus::Online && self.is_stale(device.last_seen, now) {
                device.status = DeviceStatus::Offline;
                changes.push(StatusChange {
                    device_id: device.device_id.clone(),
                    status: DeviceStatus::Offline,
                    timestamp: now,
                });
            }
        }

        changes
    }

    fn is_stale(&self, last_seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        (now - last_seen)
            .to_std()
            .is_ok_and(|elapsed| elapsed > self.staleness_timeout)
    }

    pub async fn get(&self, device_id: &str) -> Option<Device> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// Cloned view of all devices, ordered by id. The lock is held only for
    /// the copy.
    pub async fn snapshot(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }
}

/// Periodic sweep task: demotes stale devices, mirrors the new status to
/// storage, and publishes one status-change event per transition.
pub async fn run_sweeper(
    registry: Arc<DeviceRegistry>,
    storage: Arc<dyn Storage>,
    hub: Arc<FanoutHub>,
    sweep_interval: Duration,
) {
    info!("Starting liveness sweeper, interval {:?}", sweep_interval);
    let mut ticker = tokio::time::interval(sweep_interval);

    loop {
        ticker.tick().await;

        let changes = registry.sweep(Utc::now()).await;
        for change in changes {
            info!(device_id = %change.device_id, "Device went offline");

            if let Some(device) = registry.get(&change.device_id).await {
                if let Err(e) = storage.upsert_device(&device).await {
                    warn!(device_id = %device.device_id, "Failed to persist offline status: {}", e);
                }
            }

            hub.publish(&UpdateEvent::from(change)).await;
        }
    }
}
