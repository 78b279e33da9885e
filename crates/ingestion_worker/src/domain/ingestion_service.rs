use crate::domain::{payload_parser, DeviceIdentityResolver, PersistenceGateway};
use async_trait::async_trait;
use common::domain::{DeviceId, DomainError, InboundMessage};
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, info_span, Instrument, Span};

/// Step of the per-message cycle, reported when the cycle fails.
///
/// Parsing and key derivation are total, so only storage steps can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Upsert,
    WriteReading,
    WriteFlat,
}

impl IngestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStage::Upsert => "upsert",
            IngestStage::WriteReading => "write_reading",
            IngestStage::WriteFlat => "write_flat",
        }
    }
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("{stage} failed: {source}")]
pub struct IngestError {
    pub stage: IngestStage,
    #[source]
    pub source: DomainError,
}

impl IngestError {
    fn at(stage: IngestStage) -> impl FnOnce(DomainError) -> Self {
        move |source| Self { stage, source }
    }
}

/// Receives every message delivered by the transport.
///
/// Implementations log their own failures; nothing is reported back.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage);
}

/// What a successful cycle produced
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub device_key: String,
    pub device_id: DeviceId,
    pub parse_stage: &'static str,
    pub flat_written: bool,
}

/// Drives one message through parse, resolve, upsert and the two writes.
///
/// Holds no per-message state, so any number of messages may be handled
/// concurrently through a shared reference.
pub struct IngestionService {
    identity_resolver: DeviceIdentityResolver,
    persistence_gateway: PersistenceGateway,
}

impl IngestionService {
    pub fn new(
        identity_resolver: DeviceIdentityResolver,
        persistence_gateway: PersistenceGateway,
    ) -> Self {
        Self {
            identity_resolver,
            persistence_gateway,
        }
    }

    /// Run the full cycle for `message`, stopping at the first failing stage.
    ///
    /// A failed flat write leaves the already committed reading in place.
    pub async fn handle_message(&self, message: &InboundMessage) -> Result<IngestReport, IngestError> {
        let outcome = payload_parser::classify(&message.raw);
        let parse_stage = outcome.stage();
        let payload = outcome.into_payload();
        debug!(parse_stage, fields = payload.len(), "payload parsed");

        let device_key = self.identity_resolver.resolve(&message.topic, &payload);
        Span::current().record("device_key", device_key.as_str());

        let device = self
            .identity_resolver
            .upsert(&device_key, message.received_at)
            .await
            .map_err(IngestError::at(IngestStage::Upsert))?;

        self.persistence_gateway
            .write_reading(device.id, &message.topic, &payload, message.received_at)
            .await
            .map_err(IngestError::at(IngestStage::WriteReading))?;

        let flat_written = self
            .persistence_gateway
            .write_flat(device.id, &message.topic, &payload, message.received_at)
            .await
            .map_err(IngestError::at(IngestStage::WriteFlat))?;

        Ok(IngestReport {
            device_key,
            device_id: device.id,
            parse_stage,
            flat_written,
        })
    }

    /// Handle `message` inside its own root span and log the outcome.
    ///
    /// Never returns an error: a failed cycle is logged with the topic, the raw
    /// payload and the failing stage, and the message is dropped.
    pub async fn process(&self, message: &InboundMessage) {
        let span = info_span!(
            parent: Span::none(),
            "mqtt_message",
            topic = %message.topic,
            payload_size = message.raw.len(),
            device_key = tracing::field::Empty,
        );

        async {
            match self.handle_message(message).await {
                Ok(report) => {
                    debug!(
                        device_id = report.device_id,
                        parse_stage = report.parse_stage,
                        flat_written = report.flat_written,
                        "message ingested"
                    );
                }
                Err(err) => {
                    error!(
                        topic = %message.topic,
                        raw_payload = %message.raw_lossy(),
                        stage = %err.stage,
                        error = %err.source,
                        "failed to ingest message"
                    );
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl MessageHandler for IngestionService {
    async fn handle(&self, message: &InboundMessage) {
        self.process(message).await
    }
}
