use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{Device, MetricValue, TelemetryReading};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::time::Duration;
use tracing::{error, info, warn};

/// Durable storage contract. The core only depends on these operations; the
/// Postgres implementation below is one provider.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn upsert_device(&self, device: &Device) -> Result<()>;

    /// Append one immutable reading. Re-appending an identical
    /// (device, metric, timestamp) reading must succeed without creating a
    /// duplicate record.
    async fn append_reading(&self, reading: &TelemetryReading) -> Result<()>;

    /// Up to `limit` most recent readings for a device, oldest-to-newest.
    async fn recent_readings(&self, device_id: &str, limit: u32) -> Result<Vec<TelemetryReading>>;
}

pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        info!("Database connection established");
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        info!("Migrations completed");

        Ok(Self { pool })
    }
}

#[derive(sqlx::FromRow)]
struct ReadingRow {
    device_id: String,
    metric: String,
    value: Json<MetricValue>,
    unit: String,
    ts: DateTime<Utc>,
}

impl From<ReadingRow> for TelemetryReading {
    fn from(row: ReadingRow) -> Self {
        TelemetryReading {
            device_id: row.device_id,
            metric: row.metric,
            value: row.value.0,
            unit: row.unit,
            timestamp: row.ts,
        }
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn upsert_device(&self, device: &Device) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (device_id, kind, unit, location, status, last_seen)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (device_id) DO UPDATE SET
                kind = EXCLUDED.kind,
                unit = EXCLUDED.unit,
                location = EXCLUDED.location,
                status = EXCLUDED.status,
                last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(&device.device_id)
        .bind(device.kind.as_str())
        .bind(&device.unit)
        .bind(&device.location)
        .bind(device.status.as_str())
        .bind(device.last_seen)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_reading(&self, reading: &TelemetryReading) -> Result<()> {
        let mut attempts = 0;
        let max_attempts = 3;

        loop {
            attempts += 1;
            match self.insert_reading(reading).await {
                Ok(()) => return Ok(()),
                Err(e) => match &e {
                    Error::Database(db_err) => {
                        if attempts >= max_attempts || !is_transient_error(db_err) {
                            error!(
                                "Reading insert failed permanently after {} attempts: {}",
                                attempts, e
                            );
                            return Err(e);
                        }

                        let wait_ms = 100 * 2_u64.pow(attempts - 1);
                        warn!(
                            "Reading insert failed (attempt {}/{}), retrying in {}ms: {}",
                            attempts, max_attempts, wait_ms, db_err
                        );
                        DB_FAILURES_TOTAL.inc();
                        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                    }
                    _ => {
                        error!("Reading insert failed with non-database error: {}", e);
                        return Err(e);
                    }
                },
            }
        }
    }

    async fn recent_readings(&self, device_id: &str, limit: u32) -> Result<Vec<TelemetryReading>> {
        let rows = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT device_id, metric, value, unit, ts
            FROM readings
            WHERE device_id = $1
            ORDER BY ts DESC
            LIMIT $2
            "#,
        )
        .bind(device_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        // The window is the most recent N, returned oldest-to-newest.
        let mut readings: Vec<TelemetryReading> =
            rows.into_iter().map(TelemetryReading::from).collect();
        readings.reverse();
        Ok(readings)
    }
}

impl PgStorage {
    async fn insert_reading(&self, reading: &TelemetryReading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO readings (device_id, metric, value, unit, ts)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (device_id, metric, ts) DO NOTHING
            "#,
        )
        .bind(&reading.device_id)
        .bind(&reading.metric)
        .bind(Json(&reading.value))
        .bind(&reading.unit)
        .bind(reading.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Connection-related SQLSTATE classes
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryStorage;
    use super::*;
    use crate::model::{DeviceKind, DeviceStatus};
    use chrono::TimeZone;

    fn reading(ts_offset: i64) -> TelemetryReading {
        TelemetryReading {
            device_id: "machine_01".to_string(),
            metric: "temperature".to_string(),
            value: MetricValue::Scalar(21.5),
            unit: "C".to_string(),
            timestamp: Utc.timestamp_opt(1_700_000_000 + ts_offset, 0).unwrap(),
        }
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient_error(&sqlx::Error::PoolTimedOut));
        assert!(is_transient_error(&sqlx::Error::PoolClosed));
        assert!(!is_transient_error(&sqlx::Error::RowNotFound));
    }

    #[tokio::test]
    async fn test_memory_storage_deduplicates_readings() {
        let storage = MemoryStorage::new();

        storage.append_reading(&reading(0)).await.unwrap();
        storage.append_reading(&reading(0)).await.unwrap();
        storage.append_reading(&reading(1)).await.unwrap();

        let stored = storage.recent_readings("machine_01", 10).await.unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_memory_storage_windows_oldest_to_newest() {
        let storage = MemoryStorage::new();
        for offset in 0..5 {
            storage.append_reading(&reading(offset)).await.unwrap();
        }

        let stored = storage.recent_readings("machine_01", 3).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored[0].timestamp < stored[1].timestamp);
        assert!(stored[1].timestamp < stored[2].timestamp);
        assert_eq!(stored[2], reading(4));

        // Fewer stored than requested returns all of them, no padding.
        let all = storage.recent_readings("machine_01", 50).await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_memory_storage_upsert_device() {
        let storage = MemoryStorage::new();
        let device = Device {
            device_id: "machine_01".to_string(),
            kind: DeviceKind::Temperature,
            unit: "C".to_string(),
            location: "Office".to_string(),
            status: DeviceStatus::Online,
            last_seen: Utc::now(),
        };

        storage.upsert_device(&device).await.unwrap();
        let mut updated = device.clone();
        updated.status = DeviceStatus::Offline;
        storage.upsert_device(&updated).await.unwrap();

        let devices = storage.devices.lock().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices["machine_01"].status, DeviceStatus::Offline);
    }
}
