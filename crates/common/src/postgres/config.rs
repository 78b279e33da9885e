use serde::{Deserialize, Serialize};
use std::time::Duration;

/// PostgreSQL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    /// Upper bound for waiting on, creating or recycling a pooled connection
    pub acquire_timeout_secs: u64,
}

impl PostgresConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "iot_data".to_string(),
            username: "postgres".to_string(),
            password: "postgres".to_string(),
            min_pool_size: 1,
            max_pool_size: 10,
            acquire_timeout_secs: 5,
        }
    }
}
