//! Outbox store abstraction.

use chrono::{DateTime, Utc};

use courier_core::MessageId;

use crate::message::OutboxMessage;

/// Durable append/query/status-transition store for outbox records.
///
/// All mutation methods must be safe under concurrent callers and must apply
/// read-then-transition atomically so concurrent publishers cannot lose
/// updates. Implementations backing a real deployment must additionally keep
/// these guarantees across process restarts; the in-memory reference store
/// does not (see [`crate::InMemoryOutboxStore`]).
pub trait OutboxStore: Send + Sync {
    /// Append one record with status `Pending`.
    ///
    /// A duplicate id is a caller error, never a silent overwrite.
    fn add(&self, message: OutboxMessage) -> Result<(), OutboxStoreError>;

    /// Append a batch of records with status `Pending`.
    ///
    /// All-or-nothing: a duplicate id anywhere in the batch rejects the whole
    /// batch without persisting any of it.
    fn add_batch(&self, messages: Vec<OutboxMessage>) -> Result<(), OutboxStoreError>;

    /// Fetch a record by id.
    fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError>;

    /// Return up to `batch_size` records eligible for dispatch.
    ///
    /// Eligible means: status `Pending`, or `Failed` with the retry backoff
    /// elapsed, and any not-before time elapsed. Ordered by priority
    /// ascending, then creation time ascending, with the id as a
    /// deterministic tie-break.
    fn get_pending(&self, batch_size: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError>;

    /// Idempotent transition to `Published`; no-op for an unknown id.
    fn mark_published(&self, id: MessageId) -> Result<(), OutboxStoreError>;

    /// Record a failed dispatch attempt.
    ///
    /// Increments the retry count, then either schedules the next retry with
    /// exponential backoff or dead-letters the record once the configured
    /// maximum is reached. No-op for an unknown id (the record may already
    /// have been cleaned up).
    fn mark_failed(&self, id: MessageId, error: &str) -> Result<(), OutboxStoreError>;

    /// Number of records currently eligible or awaiting retry.
    fn pending_count(&self) -> Result<usize, OutboxStoreError>;

    /// Up to `batch_size` dead-lettered records, oldest first.
    fn dead_letters(&self, batch_size: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError>;

    /// Remove `Published` records created before `older_than`.
    ///
    /// Never removes Pending/Failed/DeadLetter records. Returns the number of
    /// records removed.
    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxStoreError>;
}

/// Outbox store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OutboxStoreError {
    #[error("outbox record already exists: {0}")]
    AlreadyExists(MessageId),
    #[error("storage error: {0}")]
    Storage(String),
}
