use common::domain::{DomainError, DomainResult};
use common::postgres::PostgresConfig;
use common::telemetry::TelemetryConfig;
use config::{Config, ConfigError, Environment};
use ingestion_worker::mqtt::{parse_qos, parse_topic_filters, MqttSubscriberConfig};
use ingestion_worker::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const ENV_PREFIX: &str = "FIELDLINK";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // MQTT configuration
    #[serde(default = "default_mqtt_host")]
    pub mqtt_host: String,

    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,

    #[serde(default)]
    pub mqtt_username: Option<String>,

    #[serde(default, skip_serializing)]
    pub mqtt_password: Option<String>,

    #[serde(default = "default_mqtt_client_id")]
    pub mqtt_client_id: String,

    /// Comma separated topic filters, wildcards allowed
    #[serde(default = "default_mqtt_topics")]
    pub mqtt_topics: String,

    /// 0, 1 or 2
    #[serde(default = "default_mqtt_qos")]
    pub mqtt_qos: u8,

    #[serde(default = "default_mqtt_keep_alive_secs")]
    pub mqtt_keep_alive_secs: u64,

    /// First delay before reconnecting to the broker
    #[serde(default = "default_mqtt_reconnect_min_delay_secs")]
    pub mqtt_reconnect_min_delay_secs: u64,

    /// Cap for the doubling reconnect delay
    #[serde(default = "default_mqtt_reconnect_max_delay_secs")]
    pub mqtt_reconnect_max_delay_secs: u64,

    // PostgreSQL configuration
    #[serde(default = "default_postgres_host")]
    pub postgres_host: String,

    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,

    #[serde(default = "default_postgres_database")]
    pub postgres_database: String,

    #[serde(default = "default_postgres_username")]
    pub postgres_username: String,

    #[serde(default = "default_postgres_password", skip_serializing)]
    pub postgres_password: String,

    #[serde(default = "default_postgres_min_pool_size")]
    pub postgres_min_pool_size: usize,

    #[serde(default = "default_postgres_max_pool_size")]
    pub postgres_max_pool_size: usize,

    #[serde(default = "default_postgres_acquire_timeout_secs")]
    pub postgres_acquire_timeout_secs: u64,

    // Storage retry policy
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_min_delay_ms")]
    pub retry_min_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Messages allowed inside the pipeline at once; defaults to the pool max size
    #[serde(default)]
    pub max_in_flight_messages: Option<usize>,

    /// Messages held in memory at once, running ones included; extra deliveries are dropped
    #[serde(default = "default_max_pending_messages")]
    pub max_pending_messages: usize,

    /// Upper bound for the cleanup phase after all processes stopped
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    // OpenTelemetry configuration
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    #[serde(default = "default_otel_enabled")]
    pub otel_enabled: bool,

    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

// MQTT defaults
fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "fieldlink-ingest".to_string()
}

fn default_mqtt_topics() -> String {
    "channels/+/publish".to_string()
}

fn default_mqtt_qos() -> u8 {
    1
}

fn default_mqtt_keep_alive_secs() -> u64 {
    60
}

fn default_mqtt_reconnect_min_delay_secs() -> u64 {
    1
}

fn default_mqtt_reconnect_max_delay_secs() -> u64 {
    30
}

// PostgreSQL defaults
fn default_postgres_host() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_database() -> String {
    "iot_data".to_string()
}

fn default_postgres_username() -> String {
    "postgres".to_string()
}

fn default_postgres_password() -> String {
    "postgres".to_string()
}

fn default_postgres_min_pool_size() -> usize {
    1
}

fn default_postgres_max_pool_size() -> usize {
    10
}

fn default_postgres_acquire_timeout_secs() -> u64 {
    5
}

// Retry defaults
fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_min_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_max_pending_messages() -> usize {
    1000
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

// OpenTelemetry defaults
fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_enabled() -> bool {
    false
}

fn default_otel_service_name() -> String {
    "fieldlink-ingest".to_string()
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_environment(Environment::with_prefix(ENV_PREFIX))
    }

    fn from_environment(environment: Environment) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(environment)
            .build()?
            .try_deserialize()
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> DomainResult<()> {
        if self.postgres_min_pool_size == 0 {
            return Err(DomainError::InvalidConfiguration(
                "postgres_min_pool_size must be at least 1".to_string(),
            ));
        }
        if self.postgres_min_pool_size > self.postgres_max_pool_size {
            return Err(DomainError::InvalidConfiguration(format!(
                "postgres_min_pool_size ({}) exceeds postgres_max_pool_size ({})",
                self.postgres_min_pool_size, self.postgres_max_pool_size
            )));
        }
        if self.retry_max_attempts == 0 {
            return Err(DomainError::InvalidConfiguration(
                "retry_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry_min_delay_ms > self.retry_max_delay_ms {
            return Err(DomainError::InvalidConfiguration(format!(
                "retry_min_delay_ms ({}) exceeds retry_max_delay_ms ({})",
                self.retry_min_delay_ms, self.retry_max_delay_ms
            )));
        }
        if self.mqtt_reconnect_min_delay_secs > self.mqtt_reconnect_max_delay_secs {
            return Err(DomainError::InvalidConfiguration(format!(
                "mqtt_reconnect_min_delay_secs ({}) exceeds mqtt_reconnect_max_delay_secs ({})",
                self.mqtt_reconnect_min_delay_secs, self.mqtt_reconnect_max_delay_secs
            )));
        }
        if self.max_in_flight_messages == Some(0) {
            return Err(DomainError::InvalidConfiguration(
                "max_in_flight_messages must be at least 1".to_string(),
            ));
        }
        if self.max_pending_messages < self.effective_max_in_flight() {
            return Err(DomainError::InvalidConfiguration(format!(
                "max_pending_messages ({}) is below max_in_flight_messages ({})",
                self.max_pending_messages,
                self.effective_max_in_flight()
            )));
        }

        parse_qos(self.mqtt_qos)?;
        parse_topic_filters(&self.mqtt_topics)?;
        Ok(())
    }

    pub fn postgres_config(&self) -> PostgresConfig {
        PostgresConfig {
            host: self.postgres_host.clone(),
            port: self.postgres_port,
            database: self.postgres_database.clone(),
            username: self.postgres_username.clone(),
            password: self.postgres_password.clone(),
            min_pool_size: self.postgres_min_pool_size,
            max_pool_size: self.postgres_max_pool_size,
            acquire_timeout_secs: self.postgres_acquire_timeout_secs,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_min_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    pub fn mqtt_subscriber_config(&self) -> DomainResult<MqttSubscriberConfig> {
        Ok(MqttSubscriberConfig {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            client_id: self.mqtt_client_id.clone(),
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            topic_filters: parse_topic_filters(&self.mqtt_topics)?,
            qos: parse_qos(self.mqtt_qos)?,
            keep_alive: Duration::from_secs(self.mqtt_keep_alive_secs),
            reconnect_min_delay: Duration::from_secs(self.mqtt_reconnect_min_delay_secs),
            reconnect_max_delay: Duration::from_secs(self.mqtt_reconnect_max_delay_secs),
            max_in_flight_messages: self.effective_max_in_flight(),
            max_pending_messages: self.max_pending_messages,
        })
    }

    fn effective_max_in_flight(&self) -> usize {
        self.max_in_flight_messages.unwrap_or(self.postgres_max_pool_size)
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: self.otel_service_name.clone(),
            otel_endpoint: self.otel_endpoint.clone(),
            otel_enabled: self.otel_enabled,
            log_level: self.log_level.clone(),
        }
    }
}
