mod config;

use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryProviders};
use config::ServiceConfig;
use fieldlink_runner::Runner;
use ingestion_worker::{IngestionContext, IngestionWorker};
use std::time::Duration;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize telemetry (tracing + OpenTelemetry for traces and logs)
    let telemetry_providers: Option<TelemetryProviders> =
        match init_telemetry(&config.telemetry_config()) {
            Ok(providers) => providers,
            Err(e) => {
                eprintln!("Failed to initialize telemetry: {}", e);
                std::process::exit(1);
            }
        };

    info!(
        otel_enabled = config.otel_enabled,
        otel_endpoint = %config.otel_endpoint,
        "Starting fieldlink ingestion service"
    );
    debug!("Configuration: {:?}", config);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        shutdown_telemetry(telemetry_providers);
        std::process::exit(1);
    }

    let mqtt_config = match config.mqtt_subscriber_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Invalid MQTT configuration: {}", e);
            shutdown_telemetry(telemetry_providers);
            std::process::exit(1);
        }
    };

    let context =
        match IngestionContext::connect(&config.postgres_config(), config.retry_policy()).await {
            Ok(context) => context,
            Err(e) => {
                error!("Failed to initialize storage: {:#}", e);
                shutdown_telemetry(telemetry_providers);
                std::process::exit(1);
            }
        };

    let ingestion_worker = IngestionWorker::new(&context, mqtt_config);

    let runner = Runner::new()
        .with_named_process("ingestion_worker", ingestion_worker.into_runner_process())
        // Runs after the coordinator has drained its in-flight messages
        .with_closer(move || async move {
            info!("Running cleanup tasks...");
            context.close();

            // Shutdown telemetry and flush pending traces and logs
            shutdown_telemetry(telemetry_providers);

            info!("Cleanup complete");
            Ok(())
        })
        .with_closer_timeout(Duration::from_secs(config.shutdown_timeout_secs));

    if let Err(e) = runner.run().await {
        eprintln!("Service stopped with error: {:#}", e);
        std::process::exit(1);
    }
}
