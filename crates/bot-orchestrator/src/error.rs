use crate::transport::TransportError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    /// No bot with this name has been discovered.
    #[error("Bot not found: {0}")]
    NotFound(String),

    #[error("No active bots found")]
    EmptyFleet,

    #[error("Broker unavailable: {0}")]
    TransportUnavailable(#[source] TransportError),

    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<TransportError> for FleetError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Encode(e) => Self::Encode(e),
            other => Self::TransportUnavailable(other),
        }
    }
}
