//! In-memory outbox store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use courier_core::MessageId;

use crate::message::{OutboxMessage, OutboxStatus, RetrySchedule};
use crate::store::{OutboxStore, OutboxStoreError};

/// In-memory outbox store.
///
/// Process-local only: status transitions are atomic across threads of one
/// process, but nothing survives a restart and nothing coordinates multiple
/// processes. Not a deployment-ready shared store — a durable backend with
/// the same contract is required for production.
#[derive(Debug)]
pub struct InMemoryOutboxStore {
    messages: RwLock<HashMap<MessageId, OutboxMessage>>,
    schedule: RetrySchedule,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::with_schedule(RetrySchedule::default())
    }

    pub fn with_schedule(schedule: RetrySchedule) -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
            schedule,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn schedule(&self) -> &RetrySchedule {
        &self.schedule
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<MessageId, OutboxMessage>>, OutboxStoreError>
    {
        self.messages
            .write()
            .map_err(|_| OutboxStoreError::Storage("lock poisoned".to_string()))
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<MessageId, OutboxMessage>>, OutboxStoreError>
    {
        self.messages
            .read()
            .map_err(|_| OutboxStoreError::Storage("lock poisoned".to_string()))
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn add(&self, message: OutboxMessage) -> Result<(), OutboxStoreError> {
        let mut messages = self.write()?;
        if messages.contains_key(&message.id) {
            return Err(OutboxStoreError::AlreadyExists(message.id));
        }
        messages.insert(message.id, message);
        Ok(())
    }

    fn add_batch(&self, batch: Vec<OutboxMessage>) -> Result<(), OutboxStoreError> {
        let mut messages = self.write()?;

        // Reject the whole batch before inserting anything.
        for message in &batch {
            if messages.contains_key(&message.id) {
                return Err(OutboxStoreError::AlreadyExists(message.id));
            }
        }

        for message in batch {
            messages.insert(message.id, message);
        }
        Ok(())
    }

    fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    fn get_pending(&self, batch_size: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        let messages = self.read()?;
        let now = Utc::now();

        let mut due: Vec<_> = messages
            .values()
            .filter(|m| m.is_due(now))
            .cloned()
            .collect();

        // Oldest-highest-priority first, id as deterministic tie-break.
        due.sort_by_key(|m| (m.priority, m.created_at, m.id));
        due.truncate(batch_size);
        Ok(due)
    }

    fn mark_published(&self, id: MessageId) -> Result<(), OutboxStoreError> {
        let mut messages = self.write()?;
        if let Some(message) = messages.get_mut(&id) {
            message.mark_published(Utc::now());
        }
        Ok(())
    }

    fn mark_failed(&self, id: MessageId, error: &str) -> Result<(), OutboxStoreError> {
        let mut messages = self.write()?;
        if let Some(message) = messages.get_mut(&id) {
            message.mark_failed(error, &self.schedule, Utc::now());
            if message.status == OutboxStatus::DeadLetter {
                debug!(message_id = %id, error, "outbox record dead-lettered");
            }
        }
        Ok(())
    }

    fn pending_count(&self) -> Result<usize, OutboxStoreError> {
        let messages = self.read()?;
        Ok(messages
            .values()
            .filter(|m| matches!(m.status, OutboxStatus::Pending | OutboxStatus::Failed))
            .count())
    }

    fn dead_letters(&self, batch_size: usize) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        let messages = self.read()?;
        let mut dead: Vec<_> = messages
            .values()
            .filter(|m| m.status == OutboxStatus::DeadLetter)
            .cloned()
            .collect();

        dead.sort_by_key(|m| (m.created_at, m.id));
        dead.truncate(batch_size);
        Ok(dead)
    }

    fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, OutboxStoreError> {
        let mut messages = self.write()?;
        let before = messages.len();
        messages.retain(|_, m| !(m.status == OutboxStatus::Published && m.created_at < older_than));
        Ok(before - messages.len())
    }
}
