//! Broker transport boundary.

use std::collections::HashMap;

/// The broker send primitive consumed by the publisher.
///
/// Implementations must surface transport-level problems as errors, never as
/// silent drops: the retry/backoff machinery only works on failures it can
/// observe.
pub trait BrokerTransport: Send + Sync {
    fn send(
        &self,
        payload: &str,
        routing_key: &str,
        exchange: Option<&str>,
        headers: &HashMap<String, String>,
    ) -> Result<(), TransportError>;
}

/// Transport-level send failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}
