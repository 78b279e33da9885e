use chrono::{DateTime, Utc};

/// A message delivered by the transport, owned by one handling cycle
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub raw: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, raw: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            raw: raw.into(),
            received_at: Utc::now(),
        }
    }

    /// Payload rendered as text for log output
    pub fn raw_lossy(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }
}
