//! Dead-letter store for terminally failed inbound messages.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::MessageId;

/// Terminal-failure record for a message.
///
/// Immutable once added, except for operator-initiated removal or retry.
/// Uniquely keyed by message id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedMessage {
    pub id: MessageId,
    pub message_type: String,
    pub payload: String,
    /// Attempts made before dead-lettering.
    pub attempts: u32,
    /// The retry budget that was in force.
    pub max_attempts: u32,
    pub first_failed_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
    /// Human-readable triage summary; embeds the retry budget and the last
    /// error message verbatim.
    pub reason: String,
    pub last_error: String,
    pub error_kind: String,
    pub source_queue: String,
    pub priority: u8,
    pub metadata: HashMap<String, String>,
}

/// Dead-letter store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeadLetterStoreError {
    #[error("dead-letter record not found: {0}")]
    NotFound(MessageId),
    #[error("dead-letter record already exists: {0}")]
    AlreadyExists(MessageId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable holding area for dead-lettered messages, queryable and retryable
/// by operators.
pub trait DeadLetterStore: Send + Sync {
    /// Add a record; a duplicate id is a caller error.
    fn add(&self, failed: FailedMessage) -> Result<(), DeadLetterStoreError>;

    fn get(&self, id: MessageId) -> Result<Option<FailedMessage>, DeadLetterStoreError>;

    /// Up to `limit` records, oldest dead-lettered first.
    fn list(&self, limit: usize) -> Result<Vec<FailedMessage>, DeadLetterStoreError>;

    fn count(&self) -> Result<usize, DeadLetterStoreError>;

    /// Operator deletion.
    fn remove(&self, id: MessageId) -> Result<(), DeadLetterStoreError>;

    /// Operator-triggered retry: removes the record and returns it so the
    /// caller can re-inject it as a fresh pending item.
    fn retry(&self, id: MessageId) -> Result<FailedMessage, DeadLetterStoreError>;

    /// Age-based cleanup. Removes records dead-lettered before `older_than`
    /// and returns how many were removed.
    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, DeadLetterStoreError>;
}

/// In-memory dead-letter store for tests/dev. Process-local only.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    records: RwLock<HashMap<MessageId, FailedMessage>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<MessageId, FailedMessage>>, DeadLetterStoreError>
    {
        self.records
            .write()
            .map_err(|_| DeadLetterStoreError::Storage("lock poisoned".to_string()))
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<MessageId, FailedMessage>>, DeadLetterStoreError>
    {
        self.records
            .read()
            .map_err(|_| DeadLetterStoreError::Storage("lock poisoned".to_string()))
    }
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn add(&self, failed: FailedMessage) -> Result<(), DeadLetterStoreError> {
        let mut records = self.write()?;
        if records.contains_key(&failed.id) {
            return Err(DeadLetterStoreError::AlreadyExists(failed.id));
        }
        records.insert(failed.id, failed);
        Ok(())
    }

    fn get(&self, id: MessageId) -> Result<Option<FailedMessage>, DeadLetterStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    fn list(&self, limit: usize) -> Result<Vec<FailedMessage>, DeadLetterStoreError> {
        let records = self.read()?;
        let mut result: Vec<_> = records.values().cloned().collect();
        result.sort_by_key(|r| (r.dead_lettered_at, r.id));
        result.truncate(limit);
        Ok(result)
    }

    fn count(&self) -> Result<usize, DeadLetterStoreError> {
        Ok(self.read()?.len())
    }

    fn remove(&self, id: MessageId) -> Result<(), DeadLetterStoreError> {
        let mut records = self.write()?;
        records
            .remove(&id)
            .map(|_| ())
            .ok_or(DeadLetterStoreError::NotFound(id))
    }

    fn retry(&self, id: MessageId) -> Result<FailedMessage, DeadLetterStoreError> {
        let mut records = self.write()?;
        records.remove(&id).ok_or(DeadLetterStoreError::NotFound(id))
    }

    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, DeadLetterStoreError> {
        let mut records = self.write()?;
        let before = records.len();
        records.retain(|_, r| r.dead_lettered_at >= older_than);
        Ok(before - records.len())
    }
}
