//! Consumer-side handler error.

use thiserror::Error;

/// Error returned by a message handler.
///
/// The `kind` is a stable string tag used by the retry filter's
/// handle/ignore lists; there is no downcasting over concrete error types.
/// Handlers pick their own kinds ("db-timeout", "validation", ...); the
/// [`ConsumeError::cancelled`] kind is conventionally placed on ignore lists
/// so shutdown-driven cancellation never burns retries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ConsumeError {
    kind: String,
    message: String,
}

/// Kind tag for cancellation-driven handler failures.
pub const CANCELLED_KIND: &str = "cancelled";

impl ConsumeError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// A failure caused by operation cancellation (shutdown, timeout abort).
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(CANCELLED_KIND, message)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
