use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

/// Static profile of one simulated device.
pub struct DeviceProfile {
    pub id: &'static str,
    pub kind: &'static str,
    pub unit: &'static str,
    pub location: &'static str,
}

/// The simulated fleet: one device per supported category.
pub const FLEET: [DeviceProfile; 6] = [
    DeviceProfile {
        id: "machine_01",
        kind: "temperature",
        unit: "C",
        location: "Office",
    },
    DeviceProfile {
        id: "machine_02",
        kind: "humidity",
        unit: "%",
        location: "Lab",
    },
    DeviceProfile {
        id: "machine_03",
        kind: "air_quality",
        unit: "PPM",
        location: "Factory",
    },
    DeviceProfile {
        id: "machine_04",
        kind: "power",
        unit: "W",
        location: "Plant",
    },
    DeviceProfile {
        id: "machine_05",
        kind: "gps",
        unit: "lat-long",
        location: "Vehicle",
    },
    DeviceProfile {
        id: "machine_06",
        kind: "motion",
        unit: "state",
        location: "Warehouse",
    },
];

/// Wire payload, camelCase per the device contract.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryPayload {
    pub device_id: String,
    pub device_type: String,
    pub metric: String,
    pub value: serde_json::Value,
    pub unit: String,
    pub location: String,
    pub timestamp: DateTime<Utc>,
}

impl DeviceProfile {
    pub fn topic(&self) -> String {
        format!("iot/devices/{}/telemetry", self.id)
    }

    pub fn sample(&self, rng: &mut impl Rng) -> TelemetryPayload {
        TelemetryPayload {
            device_id: self.id.to_string(),
            device_type: self.kind.to_string(),
            metric: self.kind.to_string(),
            value: generate_value(rng, self.kind),
            unit: self.unit.to_string(),
            location: self.location.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Value shapes mirror what real firmware sends: fixed-precision floats as
/// strings, integers as numbers, GPS as a "lat, lng" string.
fn generate_value(rng: &mut impl Rng, kind: &str) -> serde_json::Value {
    match kind {
        "temperature" => {
            let v: f64 = rng.gen_range(20.0..30.0);
            serde_json::Value::String(format!("{v:.2}"))
        }
        "humidity" => {
            let v: f64 = rng.gen_range(40.0..70.0);
            serde_json::Value::String(format!("{v:.2}"))
        }
        "air_quality" => serde_json::json!(rng.gen_range(200..400)),
        "power" => serde_json::json!(rng.gen_range(100..600)),
        "gps" => {
            let lat: f64 = 28.0 + rng.gen_range(0.0..1.0);
            let lng: f64 = 77.0 + rng.gen_range(0.0..1.0);
            serde_json::Value::String(format!("{lat:.5}, {lng:.5}"))
        }
        "motion" => serde_json::json!(if rng.gen_bool(0.5) { 1 } else { 0 }),
        _ => serde_json::json!(rng.gen_range(0.0..1.0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_match_device_pattern() {
        for device in &FLEET {
            let topic = device.topic();
            assert!(topic.starts_with("iot/devices/"));
            assert!(topic.ends_with("/telemetry"));
        }
    }

    #[test]
    fn test_gps_sample_is_coordinate_string() {
        let mut rng = rand::thread_rng();
        let gps = FLEET.iter().find(|d| d.kind == "gps").unwrap();

        let payload = gps.sample(&mut rng);
        let text = payload.value.as_str().expect("gps value is a string");
        let (lat, lng) = text.split_once(',').expect("lat, lng pair");
        assert!(lat.trim().parse::<f64>().is_ok());
        assert!(lng.trim().parse::<f64>().is_ok());
    }

    #[test]
    fn test_payload_uses_wire_field_names() {
        let mut rng = rand::thread_rng();
        let payload = FLEET[0].sample(&mut rng);

        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("deviceId").is_some());
        assert!(json.get("deviceType").is_some());
        assert!(json.get("timestamp").is_some());
    }
}
