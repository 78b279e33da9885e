mod identity_resolver;
mod ingestion_service;
pub mod payload_parser;
mod persistence_gateway;
mod retry_policy;

pub use identity_resolver::*;
pub use ingestion_service::*;
pub use payload_parser::{classify, parse, ParseOutcome};
pub use persistence_gateway::*;
pub use retry_policy::*;
