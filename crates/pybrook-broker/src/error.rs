//! Broker-transient errors (§7.2): connection loss, timeout, protocol errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker transport error: {0}")]
    Transport(#[from] redis::RedisError),

    #[error("broker subscription closed unexpectedly for channel '{0}'")]
    SubscriptionClosed(String),

    #[error("malformed broker reply: {0}")]
    MalformedReply(String),
}

impl BrokerError {
    /// Whether this error is worth retrying with backoff rather than surfacing as a
    /// supervision-level failure. Parse/shape errors from a misbehaving broker are not
    /// retried; connectivity errors are.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transport(_) | BrokerError::SubscriptionClosed(_))
    }
}
