use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declared device category, taken from the payload's `deviceType` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Temperature,
    Humidity,
    AirQuality,
    Power,
    Gps,
    Motion,
    #[serde(other)]
    Other,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Temperature => "temperature",
            DeviceKind::Humidity => "humidity",
            DeviceKind::AirQuality => "air_quality",
            DeviceKind::Power => "power",
            DeviceKind::Gps => "gps",
            DeviceKind::Motion => "motion",
            DeviceKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
        }
    }
}

/// A tracked device. Created on first observed reading, mutated by every
/// reading and by the liveness sweep, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    pub unit: String,
    pub location: String,
    pub status: DeviceStatus,
    pub last_seen: DateTime<Utc>,
}

/// Declared metadata carried by every payload, applied to the device record
/// on each upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMeta {
    pub kind: DeviceKind,
    pub unit: String,
    pub location: String,
}

/// A sample value. Most metrics are plain scalars; GPS devices report a
/// coordinate pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Coordinates { lat: f64, lng: f64 },
}

/// One validated telemetry sample. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    pub device_id: String,
    pub metric: String,
    pub value: MetricValue,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

/// A liveness transition produced by the registry (upsert or sweep).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub device_id: String,
    pub status: DeviceStatus,
    pub timestamp: DateTime<Utc>,
}

/// Wire format pushed to WebSocket observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum UpdateEvent {
    #[serde(rename = "telemetry-update")]
    Telemetry {
        #[serde(flatten)]
        reading: TelemetryReading,
    },
    #[serde(rename = "status-change")]
    Status {
        #[serde(flatten)]
        change: StatusChange,
    },
}

impl UpdateEvent {
    /// The device this event concerns, used for observer filtering.
    pub fn device_id(&self) -> &str {
        match self {
            UpdateEvent::Telemetry { reading } => &reading.device_id,
            UpdateEvent::Status { change } => &change.device_id,
        }
    }
}

impl From<StatusChange> for UpdateEvent {
    fn from(change: StatusChange) -> Self {
        UpdateEvent::Status { change }
    }
}

/// REST response wrapper for reading queries.
#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub data: Vec<TelemetryReading>,
    pub total: usize,
    pub limit: u32,
}
