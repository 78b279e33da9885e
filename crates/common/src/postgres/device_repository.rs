use crate::domain::{Device, DeviceRepository, DomainResult, UpsertDeviceRepoInput};
use crate::postgres::error::{classify_pg_error, classify_pool_error};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::Row;
use tracing::{debug, instrument};

/// Device row for PostgreSQL storage
#[derive(Debug, Clone)]
pub struct DeviceRow {
    pub id: i32,
    pub device_key: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl From<&Row> for DeviceRow {
    fn from(row: &Row) -> Self {
        DeviceRow {
            id: row.get(0),
            device_key: row.get(1),
            first_seen: row.get(2),
            last_seen: row.get(3),
        }
    }
}

/// Convert database DeviceRow to domain Device
impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        Device {
            id: row.id,
            device_key: row.device_key,
            first_seen: row.first_seen,
            last_seen: row.last_seen,
        }
    }
}

/// PostgreSQL implementation of DeviceRepository trait
#[derive(Clone)]
pub struct PostgresDeviceRepository {
    client: PostgresClient,
}

impl PostgresDeviceRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeviceRepository for PostgresDeviceRepository {
    #[instrument(skip(self, input), fields(device_key = %input.device_key))]
    async fn upsert_device(&self, input: UpsertDeviceRepoInput) -> DomainResult<Device> {
        let mut conn = self
            .client
            .get_connection()
            .await
            .map_err(classify_pool_error)?;

        let tx = conn.transaction().await.map_err(classify_pg_error)?;

        // GREATEST keeps last_seen non-decreasing when sightings commit out of order
        let row = tx
            .query_one(
                "INSERT INTO devices (device_key, first_seen, last_seen)
                 VALUES ($1, $2, $2)
                 ON CONFLICT (device_key)
                 DO UPDATE SET last_seen = GREATEST(devices.last_seen, EXCLUDED.last_seen)
                 RETURNING id, device_key, first_seen, last_seen",
                &[&input.device_key, &input.seen_at],
            )
            .await
            .map_err(classify_pg_error)?;

        // Replaying the upsert is harmless, so a lost commit stays retryable
        tx.commit().await.map_err(classify_pg_error)?;

        let device: Device = DeviceRow::from(&row).into();
        debug!(device_id = device.id, "upserted device");

        Ok(device)
    }

    #[instrument(skip(self))]
    async fn get_device(&self, device_key: &str) -> DomainResult<Option<Device>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(classify_pool_error)?;

        let row = conn
            .query_opt(
                "SELECT id, device_key, first_seen, last_seen
                 FROM devices
                 WHERE device_key = $1",
                &[&device_key],
            )
            .await
            .map_err(classify_pg_error)?;

        Ok(row.map(|row| DeviceRow::from(&row).into()))
    }
}
