use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Internal identifier assigned by storage to a device row
pub type DeviceId = i32;

/// Domain entity for a field device
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub device_key: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Input for recording a device sighting
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertDeviceRepoInput {
    pub device_key: String,
    pub seen_at: DateTime<Utc>,
}

/// Repository trait for device storage operations
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Insert the device if `device_key` is unseen, otherwise advance `last_seen`.
    ///
    /// Must be a single atomic statement keyed on the unique `device_key`;
    /// `first_seen` is never modified after creation.
    async fn upsert_device(&self, input: UpsertDeviceRepoInput) -> DomainResult<Device>;

    /// Look up a device by its key
    async fn get_device(&self, device_key: &str) -> DomainResult<Option<Device>>;
}
