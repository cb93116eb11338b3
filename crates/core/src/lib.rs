//! `courier-core` — shared primitives for the delivery subsystem.
//!
//! This crate contains **pure data** building blocks (no I/O, no background
//! machinery): strongly-typed identifiers, the correlation context, and the
//! wire-level header contract.

pub mod correlation;
pub mod error;
pub mod headers;
pub mod id;

pub use correlation::CorrelationContext;
pub use error::{CoreError, CoreResult};
pub use id::{MessageId, TenantId};
