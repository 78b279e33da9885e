mod connection_state;
mod subscriber;
mod topic;

pub use connection_state::{ConnectionEvent, ConnectionState, ReconnectBackoff};
pub use subscriber::{IngestionCoordinator, MqttSubscriberConfig, SubscriptionSink};
pub use topic::{parse_qos, parse_topic_filters, validate_topic_filter};
