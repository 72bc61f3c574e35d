use crate::errors::{Error, Result};
use crate::model::{DeviceKind, DeviceMeta, MetricValue, TelemetryReading};
use chrono::{DateTime, Utc};
use serde::Deserialize;

const TOPIC_PREFIX: &str = "iot/devices/";
const TOPIC_SUFFIX: &str = "/telemetry";

/// A fully validated message: the reading plus the device metadata the
/// payload declared alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub reading: TelemetryReading,
    pub meta: DeviceMeta,
}

/// Raw JSON shape published by devices. Field names follow the wire contract
/// (`deviceId`, `deviceType`, ...), not our internal naming.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPayload {
    device_id: String,
    device_type: DeviceKind,
    metric: String,
    value: serde_json::Value,
    unit: String,
    location: String,
    timestamp: DateTime<Utc>,
}

/// Extract the device id from a `iot/devices/<id>/telemetry` topic.
/// The topic is authoritative for identity; payloads only corroborate it.
pub fn device_id_from_topic(topic: &str) -> Option<&str> {
    let id = topic.strip_prefix(TOPIC_PREFIX)?.strip_suffix(TOPIC_SUFFIX)?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id)
}

/// Decode and validate one raw message. Any rejection is an `Error::Reject`
/// that the pipeline logs and drops; it never propagates further.
pub fn decode(topic: &str, payload: &[u8]) -> Result<Decoded> {
    let device_id = device_id_from_topic(topic)
        .ok_or_else(|| Error::Reject(format!("topic {topic} does not match device pattern")))?;

    let raw: RawPayload = serde_json::from_slice(payload)
        .map_err(|e| Error::Reject(format!("payload parse error: {e}")))?;

    if raw.device_id != device_id {
        return Err(Error::Reject(format!(
            "payload device id {} does not match topic device id {}",
            raw.device_id, device_id
        )));
    }

    if raw.metric.is_empty() {
        return Err(Error::Reject("empty metric name".to_string()));
    }

    let value = coerce_value(raw.device_type, &raw.value)?;

    Ok(Decoded {
        reading: TelemetryReading {
            device_id: raw.device_id,
            metric: raw.metric,
            value,
            unit: raw.unit.clone(),
            timestamp: raw.timestamp,
        },
        meta: DeviceMeta {
            kind: raw.device_type,
            unit: raw.unit,
            location: raw.location,
        },
    })
}

/// Accept the value shapes seen on the wire: JSON numbers, numeric strings
/// (devices stringify fixed-precision floats), `"lat, lng"` strings, and
/// `{lat, lng}` objects. The declared kind decides which shapes are legal.
fn coerce_value(kind: DeviceKind, raw: &serde_json::Value) -> Result<MetricValue> {
    let value = match raw {
        serde_json::Value::Number(n) => n
            .as_f64()
            .map(MetricValue::Scalar)
            .ok_or_else(|| Error::Reject(format!("non-finite numeric value {n}")))?,
        serde_json::Value::String(s) => parse_value_str(s)
            .ok_or_else(|| Error::Reject(format!("unparsable value string {s:?}")))?,
        serde_json::Value::Object(_) => serde_json::from_value::<MetricValue>(raw.clone())
            .map_err(|_| Error::Reject(format!("unexpected value object {raw}")))?,
        other => {
            return Err(Error::Reject(format!("unexpected value shape {other}")));
        }
    };

    match (kind, &value) {
        (DeviceKind::Gps, MetricValue::Coordinates { .. }) => Ok(value),
        (DeviceKind::Gps, MetricValue::Scalar(_)) => {
            Err(Error::Reject("gps device sent a scalar value".to_string()))
        }
        (DeviceKind::Other, _) => Ok(value),
        (_, MetricValue::Scalar(_)) => Ok(value),
        (_, MetricValue::Coordinates { .. }) => Err(Error::Reject(format!(
            "{} device sent a coordinate value",
            kind.as_str()
        ))),
    }
}

fn parse_value_str(s: &str) -> Option<MetricValue> {
    if let Some((lat, lng)) = s.split_once(',') {
        let lat = lat.trim().parse::<f64>().ok()?;
        let lng = lng.trim().parse::<f64>().ok()?;
        return Some(MetricValue::Coordinates { lat, lng });
    }
    s.trim().parse::<f64>().ok().map(MetricValue::Scalar)
}
