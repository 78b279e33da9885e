use crate::domain::device::DeviceId;
use crate::domain::payload::ParsedPayload;
use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Canonical reading, appended once per processed message
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device_id: DeviceId,
    pub topic: String,
    pub payload: ParsedPayload,
    pub ts: DateTime<Utc>,
}

/// Denormalized numeric projection of a reading
#[derive(Debug, Clone, PartialEq)]
pub struct FlatReading {
    pub device_id: DeviceId,
    pub topic: String,
    pub ts: DateTime<Utc>,
    pub rssi: Option<i32>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
}

impl FlatReading {
    /// Project the allow-listed numeric fields of a reading.
    ///
    /// Returns `None` when no allow-listed field is present with a value that
    /// coerces to a number, in which case no flat row is written.
    pub fn project(reading: &Reading) -> Option<Self> {
        Self::from_payload(reading.device_id, &reading.topic, &reading.payload, reading.ts)
    }

    pub fn from_payload(
        device_id: DeviceId,
        topic: &str,
        payload: &ParsedPayload,
        ts: DateTime<Utc>,
    ) -> Option<Self> {
        let flat = FlatReading {
            device_id,
            topic: topic.to_string(),
            ts,
            rssi: payload.get("rssi").and_then(as_int),
            temperature: payload.get("temperature").and_then(as_float),
            humidity: payload.get("humidity").and_then(as_float),
            pressure: payload.get("pressure").and_then(as_float),
            voltage: payload.get("voltage").and_then(as_float),
            current: payload.get("current").and_then(as_float),
            pm25: payload.get("pm25").and_then(as_float),
            pm10: payload.get("pm10").and_then(as_float),
        };

        flat.has_values().then_some(flat)
    }

    fn has_values(&self) -> bool {
        self.rssi.is_some()
            || [
                self.temperature,
                self.humidity,
                self.pressure,
                self.voltage,
                self.current,
                self.pm25,
                self.pm10,
            ]
            .iter()
            .any(Option::is_some)
    }
}

fn as_float(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn as_int(value: &Value) -> Option<i32> {
    if let Some(n) = value.as_i64() {
        return i32::try_from(n).ok();
    }
    let truncated = as_float(value)?.trunc();
    if truncated < f64::from(i32::MIN) || truncated > f64::from(i32::MAX) {
        return None;
    }
    Some(truncated as i32)
}

/// Repository trait for reading storage operations.
///
/// Each call is one insert inside its own transaction; the two writes are not
/// coordinated with each other.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ReadingRepository: Send + Sync {
    async fn insert_reading(&self, reading: &Reading) -> DomainResult<()>;

    async fn insert_flat_reading(&self, flat: &FlatReading) -> DomainResult<()>;
}
