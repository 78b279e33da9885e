use crate::domain::RetryPolicy;
use chrono::{DateTime, Utc};
use common::domain::{
    DeviceId, DomainResult, FlatReading, ParsedPayload, Reading, ReadingRepository,
};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Writes canonical and flat readings, retrying transient storage failures.
///
/// The two writes are independent: a failed flat write never undoes a
/// canonical row that was already committed.
pub struct PersistenceGateway {
    reading_repository: Arc<dyn ReadingRepository>,
    retry_policy: RetryPolicy,
}

impl PersistenceGateway {
    pub fn new(reading_repository: Arc<dyn ReadingRepository>, retry_policy: RetryPolicy) -> Self {
        Self {
            reading_repository,
            retry_policy,
        }
    }

    /// Append one canonical reading
    #[instrument(skip(self, payload, ts))]
    pub async fn write_reading(
        &self,
        device_id: DeviceId,
        topic: &str,
        payload: &ParsedPayload,
        ts: DateTime<Utc>,
    ) -> DomainResult<()> {
        let reading = Reading {
            device_id,
            topic: topic.to_string(),
            payload: payload.clone(),
            ts,
        };

        self.retry_policy
            .run("write_reading", || self.reading_repository.insert_reading(&reading))
            .await?;

        debug!("reading written");
        Ok(())
    }

    /// Append the flat projection of `payload` if it has any numeric column.
    ///
    /// Returns `false` without touching storage when nothing projects.
    #[instrument(skip(self, payload, ts))]
    pub async fn write_flat(
        &self,
        device_id: DeviceId,
        topic: &str,
        payload: &ParsedPayload,
        ts: DateTime<Utc>,
    ) -> DomainResult<bool> {
        let Some(flat) = FlatReading::from_payload(device_id, topic, payload, ts) else {
            debug!("no flat columns present, skipping flat row");
            return Ok(false);
        };

        self.retry_policy
            .run("write_flat", || self.reading_repository.insert_flat_reading(&flat))
            .await?;

        debug!("flat reading written");
        Ok(true)
    }
}
