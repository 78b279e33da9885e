use crate::postgres::PostgresConfig;
use anyhow::{bail, Result};
use deadpool_postgres::{
    Config, ManagerConfig, Pool, PoolConfig, PoolError, RecyclingMethod, Runtime, Timeouts,
};
use futures::future::try_join_all;
use tokio_postgres::NoTls;
use tracing::{debug, info};

/// PostgreSQL client wrapper with connection pooling
#[derive(Clone)]
pub struct PostgresClient {
    pool: Pool,
    min_pool_size: usize,
}

impl PostgresClient {
    /// Creates a new PostgreSQL client with a bounded connection pool.
    ///
    /// No connection is opened here; call [`PostgresClient::warm_up`] to
    /// establish the minimum number of connections.
    pub fn new(config: &PostgresConfig) -> Result<Self> {
        if config.min_pool_size == 0 || config.min_pool_size > config.max_pool_size {
            bail!(
                "invalid pool size range [{}, {}]",
                config.min_pool_size,
                config.max_pool_size
            );
        }

        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.dbname = Some(config.database.clone());
        cfg.user = Some(config.username.clone());
        cfg.password = Some(config.password.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig {
            max_size: config.max_pool_size,
            timeouts: Timeouts {
                wait: Some(config.acquire_timeout()),
                create: Some(config.acquire_timeout()),
                recycle: Some(config.acquire_timeout()),
            },
            ..Default::default()
        });

        let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;

        Ok(Self {
            pool,
            min_pool_size: config.min_pool_size,
        })
    }

    /// Opens `min_pool_size` connections and returns them to the pool idle.
    ///
    /// Fails if any of them cannot be established, which callers treat as a
    /// startup failure.
    pub async fn warm_up(&self) -> Result<()> {
        let connections = try_join_all((0..self.min_pool_size).map(|_| self.pool.get())).await?;
        info!(
            connections = connections.len(),
            max_pool_size = self.pool.status().max_size,
            "postgres pool warmed up"
        );
        Ok(())
    }

    /// Pings the database to verify connectivity
    pub async fn ping(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.execute("SELECT 1", &[]).await?;
        debug!("postgreSQL connection successful");
        Ok(())
    }

    /// Gets a connection from the pool.
    ///
    /// The connection goes back to the pool when the returned object is
    /// dropped, on every exit path.
    pub async fn get_connection(&self) -> Result<deadpool_postgres::Client, PoolError> {
        self.pool.get().await
    }

    /// Closes the pool; outstanding connections are dropped when returned
    pub fn close(&self) {
        self.pool.close();
        debug!("postgres pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}
