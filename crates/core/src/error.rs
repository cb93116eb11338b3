//! Core error model.

use thiserror::Error;

/// Result type used for core-level parsing/validation.
pub type CoreResult<T> = Result<T, CoreError>;

/// Error raised by core primitives.
///
/// Keep this focused on deterministic failures (parsing, validation).
/// Storage and transport concerns live in their own crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A header value could not be interpreted.
    #[error("invalid header value for '{key}': {reason}")]
    InvalidHeader { key: String, reason: String },
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_header(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidHeader {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
