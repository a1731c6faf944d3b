//! Runtime-level errors: broker transport failures, malformed messages, and user
//! computation failures, unified so a worker loop can decide retry vs. DLQ vs. fatal.

use pybrook_broker::BrokerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("malformed message id '{0}'")]
    MalformedMessageId(String),

    #[error("message on stream '{stream}' is missing required field '{field}'")]
    MissingField { stream: String, field: String },

    #[error("failed to decode field value: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("computation for field '{field}' failed: {source}")]
    Computation {
        field: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("unknown report or field '{0}'")]
    UnknownTarget(String),
}

impl RuntimeError {
    /// Whether this failure should go to backoff-and-retry rather than the dead-letter
    /// queue. Broker transport errors are transient; everything else is a property of
    /// the message itself and retrying it verbatim would fail identically (§7.2, §7.4).
    pub fn is_retryable(&self) -> bool {
        matches!(self, RuntimeError::Broker(e) if e.is_transient())
    }
}
