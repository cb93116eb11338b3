//! `courier-consumer` — inbound retry and dead-letter handling.
//!
//! The [`RetryFilter`] wraps business message handlers with a uniform policy:
//! classify the failure, schedule a backoff-delayed redelivery while attempts
//! remain, and route exhausted messages to the [`DeadLetterStore`].

pub mod context;
pub mod dead_letter;
pub mod error;
pub mod filter;

pub use context::ConsumeContext;
pub use dead_letter::{DeadLetterStore, DeadLetterStoreError, FailedMessage, InMemoryDeadLetterStore};
pub use error::ConsumeError;
pub use filter::{FilterOutcome, RetryFilter, RetryFilterConfig};
