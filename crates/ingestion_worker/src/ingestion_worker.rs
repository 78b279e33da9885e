use crate::domain::{DeviceIdentityResolver, IngestionService, PersistenceGateway, RetryPolicy};
use crate::mqtt::{IngestionCoordinator, MqttSubscriberConfig};
use anyhow::Context;
use common::postgres::{
    PostgresClient, PostgresConfig, PostgresDeviceRepository, PostgresReadingRepository,
    SchemaMigrator,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Storage resources shared by every message, built once at startup
pub struct IngestionContext {
    postgres_client: PostgresClient,
    device_repository: Arc<PostgresDeviceRepository>,
    reading_repository: Arc<PostgresReadingRepository>,
    retry_policy: RetryPolicy,
}

impl IngestionContext {
    /// Create the pool, open its minimum connections and apply the schema.
    ///
    /// Any failure here means the service cannot start.
    pub async fn connect(config: &PostgresConfig, retry_policy: RetryPolicy) -> anyhow::Result<Self> {
        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            min_pool_size = config.min_pool_size,
            max_pool_size = config.max_pool_size,
            "initializing PostgreSQL"
        );

        let postgres_client = PostgresClient::new(config)?;
        postgres_client
            .warm_up()
            .await
            .context("failed to establish the PostgreSQL pool")?;
        postgres_client.ping().await?;
        SchemaMigrator::new(postgres_client.clone())
            .run_migrations()
            .await
            .context("failed to apply schema migrations")?;

        Ok(Self::from_client(postgres_client, retry_policy))
    }

    pub fn from_client(postgres_client: PostgresClient, retry_policy: RetryPolicy) -> Self {
        Self {
            device_repository: Arc::new(PostgresDeviceRepository::new(postgres_client.clone())),
            reading_repository: Arc::new(PostgresReadingRepository::new(postgres_client.clone())),
            postgres_client,
            retry_policy,
        }
    }

    pub fn ingestion_service(&self) -> IngestionService {
        IngestionService::new(
            DeviceIdentityResolver::new(self.device_repository.clone(), self.retry_policy),
            PersistenceGateway::new(self.reading_repository.clone(), self.retry_policy),
        )
    }

    pub fn postgres_client(&self) -> &PostgresClient {
        &self.postgres_client
    }

    /// Close the pool. Call only after in-flight messages have drained.
    pub fn close(&self) {
        self.postgres_client.close();
        info!("ingestion context closed");
    }
}

pub struct IngestionWorker {
    coordinator: IngestionCoordinator,
}

impl IngestionWorker {
    pub fn new(context: &IngestionContext, config: MqttSubscriberConfig) -> Self {
        info!("initializing ingestion worker");
        let service = Arc::new(context.ingestion_service());
        Self {
            coordinator: IngestionCoordinator::new(config, service),
        }
    }

    pub fn into_runner_process(
        self,
    ) -> Box<
        dyn FnOnce(
                CancellationToken,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
            > + Send,
    > {
        let coordinator = self.coordinator;
        Box::new(move |ctx| Box::pin(async move { coordinator.run(ctx).await }))
    }
}
