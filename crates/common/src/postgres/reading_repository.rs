use crate::domain::{DomainResult, FlatReading, Reading, ReadingRepository};
use crate::postgres::error::{classify_commit_error, classify_pg_error, classify_pool_error};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use tokio_postgres::types::Json;
use tracing::{debug, instrument};

/// PostgreSQL implementation of ReadingRepository trait
#[derive(Clone)]
pub struct PostgresReadingRepository {
    client: PostgresClient,
}

impl PostgresReadingRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReadingRepository for PostgresReadingRepository {
    #[instrument(skip(self, reading), fields(device_id = reading.device_id, topic = %reading.topic))]
    async fn insert_reading(&self, reading: &Reading) -> DomainResult<()> {
        let mut conn = self
            .client
            .get_connection()
            .await
            .map_err(classify_pool_error)?;

        let tx = conn.transaction().await.map_err(classify_pg_error)?;

        tx.execute(
            "INSERT INTO readings (device_id, topic, payload, ts)
             VALUES ($1, $2, $3, $4)",
            &[
                &reading.device_id,
                &reading.topic,
                &Json(reading.payload.fields()),
                &reading.ts,
            ],
        )
        .await
        .map_err(classify_pg_error)?;

        tx.commit().await.map_err(classify_commit_error)?;

        debug!(field_count = reading.payload.len(), "inserted reading");
        Ok(())
    }

    #[instrument(skip(self, flat), fields(device_id = flat.device_id, topic = %flat.topic))]
    async fn insert_flat_reading(&self, flat: &FlatReading) -> DomainResult<()> {
        let mut conn = self
            .client
            .get_connection()
            .await
            .map_err(classify_pool_error)?;

        let tx = conn.transaction().await.map_err(classify_pg_error)?;

        tx.execute(
            "INSERT INTO readings_flat (
                device_id, topic, ts,
                rssi, temperature, humidity, pressure, voltage, current, pm25, pm10
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            &[
                &flat.device_id,
                &flat.topic,
                &flat.ts,
                &flat.rssi,
                &flat.temperature,
                &flat.humidity,
                &flat.pressure,
                &flat.voltage,
                &flat.current,
                &flat.pm25,
                &flat.pm10,
            ],
        )
        .await
        .map_err(classify_pg_error)?;

        tx.commit().await.map_err(classify_commit_error)?;

        debug!("inserted flat reading");
        Ok(())
    }
}
