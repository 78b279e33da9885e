use crate::domain::RetryPolicy;
use chrono::{DateTime, Utc};
use common::domain::{Device, DeviceRepository, DomainResult, ParsedPayload, UpsertDeviceRepoInput};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Payload fields checked, in order, for an explicit device identity
pub const DEVICE_KEY_FIELDS: [&str; 6] = ["device_id", "device", "id", "mac", "chipid", "node"];

/// Derive the stable device key for a message.
///
/// Order: first candidate payload field holding a non-empty value, then the
/// first two topic levels (`esp32/lab/telemetry` -> `esp32/lab`), then the
/// topic itself.
pub fn resolve_device_key(topic: &str, payload: &ParsedPayload) -> String {
    DEVICE_KEY_FIELDS
        .iter()
        .find_map(|field| payload.get(field).and_then(key_from_value))
        .unwrap_or_else(|| key_from_topic(topic))
}

fn key_from_value(value: &Value) -> Option<String> {
    let key = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!key.is_empty()).then_some(key)
}

fn key_from_topic(topic: &str) -> String {
    let mut levels = topic.split('/');
    match (levels.next(), levels.next()) {
        (Some(first), Some(second)) => format!("{}/{}", first, second),
        _ => topic.to_string(),
    }
}

/// Maps messages to internal device ids, creating devices on first sighting
pub struct DeviceIdentityResolver {
    device_repository: Arc<dyn DeviceRepository>,
    retry_policy: RetryPolicy,
}

impl DeviceIdentityResolver {
    pub fn new(device_repository: Arc<dyn DeviceRepository>, retry_policy: RetryPolicy) -> Self {
        Self {
            device_repository,
            retry_policy,
        }
    }

    pub fn resolve(&self, topic: &str, payload: &ParsedPayload) -> String {
        resolve_device_key(topic, payload)
    }

    /// Record a sighting of `device_key` and return the stored device.
    ///
    /// Transient storage failures are retried under the configured policy.
    #[instrument(skip(self), fields(device_key = %device_key))]
    pub async fn upsert(&self, device_key: &str, seen_at: DateTime<Utc>) -> DomainResult<Device> {
        let device = self
            .retry_policy
            .run("upsert_device", || {
                self.device_repository.upsert_device(UpsertDeviceRepoInput {
                    device_key: device_key.to_string(),
                    seen_at,
                })
            })
            .await?;

        debug!(device_id = device.id, "resolved device");
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::domain::{DomainError, MockDeviceRepository};
    use serde_json::json;
    use std::time::Duration;

    fn payload(value: Value) -> ParsedPayload {
        match value {
            Value::Object(map) => ParsedPayload::from_map(map).unwrap(),
            _ => panic!("payload must be an object"),
        }
    }

    fn no_delay_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    #[test]
    fn test_device_id_field_wins() {
        let key = resolve_device_key(
            "esp32/lab/telemetry",
            &payload(json!({"device_id": "X1", "mac": "AA:BB"})),
        );
        assert_eq!(key, "X1");
    }

    #[test]
    fn test_candidates_checked_in_order() {
        let key = resolve_device_key(
            "esp32/lab/telemetry",
            &payload(json!({"node": "n-9", "mac": "AA:BB", "chipid": "c1"})),
        );
        assert_eq!(key, "AA:BB");
    }

    #[test]
    fn test_blank_candidate_is_skipped_and_value_trimmed() {
        let key = resolve_device_key(
            "esp32/lab/telemetry",
            &payload(json!({"device_id": "   ", "device": "  sensor-4 "})),
        );
        assert_eq!(key, "sensor-4");
    }

    #[test]
    fn test_numeric_candidate_is_rendered_as_text() {
        let key = resolve_device_key("a/b/c", &payload(json!({"chipid": 123456})));
        assert_eq!(key, "123456");
    }

    #[test]
    fn test_non_scalar_candidates_are_skipped() {
        let key = resolve_device_key(
            "arduino/shed/data",
            &payload(json!({"id": null, "device": {"name": "x"}, "node": true})),
        );
        assert_eq!(key, "arduino/shed");
    }

    #[test]
    fn test_topic_fallback_uses_first_two_levels() {
        let key = resolve_device_key("esp32/lab/telemetry", &payload(json!({"rssi": -70})));
        assert_eq!(key, "esp32/lab");
    }

    #[test]
    fn test_single_level_topic_is_used_verbatim() {
        let key = resolve_device_key("telemetry", &ParsedPayload::raw("x"));
        assert_eq!(key, "telemetry");
    }

    #[tokio::test]
    async fn test_upsert_returns_device() {
        let mut mock_repo = MockDeviceRepository::new();
        let now = Utc::now();
        mock_repo
            .expect_upsert_device()
            .withf(|input: &UpsertDeviceRepoInput| input.device_key == "X1")
            .times(1)
            .returning(move |input| {
                Ok(Device {
                    id: 42,
                    device_key: input.device_key,
                    first_seen: input.seen_at,
                    last_seen: input.seen_at,
                })
            });

        let resolver = DeviceIdentityResolver::new(Arc::new(mock_repo), no_delay_policy(3));
        let device = resolver.upsert("X1", now).await.unwrap();

        assert_eq!(device.id, 42);
        assert_eq!(device.first_seen, now);
    }

    #[tokio::test]
    async fn test_upsert_retries_transient_failures() {
        let mut mock_repo = MockDeviceRepository::new();
        let mut seq = mockall::Sequence::new();
        mock_repo
            .expect_upsert_device()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(DomainError::StorageUnavailable(anyhow::anyhow!("reset"))));
        mock_repo
            .expect_upsert_device()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|input| {
                Ok(Device {
                    id: 1,
                    device_key: input.device_key,
                    first_seen: input.seen_at,
                    last_seen: input.seen_at,
                })
            });

        let resolver = DeviceIdentityResolver::new(Arc::new(mock_repo), no_delay_policy(3));

        assert_eq!(resolver.upsert("X1", Utc::now()).await.unwrap().id, 1);
    }
}
