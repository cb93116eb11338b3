//! Wire-level header keys.
//!
//! These key strings are an interoperability contract with other services and
//! must be preserved verbatim on the wire.

/// Ties an entire chain of related messages together.
pub const CORRELATION_ID: &str = "x-correlation-id";

/// Identifier of the message that caused the current message to be produced.
pub const CAUSATION_ID: &str = "x-causation-id";

/// Stable message type tag, used to resolve a deserializer on consumption.
pub const MESSAGE_TYPE: &str = "x-message-type";

/// Identifier of the outbox record carrying the message.
pub const OUTBOX_MESSAGE_ID: &str = "x-outbox-message-id";

/// Tenant boundary the message belongs to.
pub const TENANT_ID: &str = "x-tenant-id";

/// Dispatch priority (lower sorts first).
pub const PRIORITY: &str = "x-priority";
