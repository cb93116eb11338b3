//! Unit-of-work integration: commit the business data, then flush staged
//! messages.
//!
//! The two steps are sequential calls, not one physical transaction. A crash
//! between them loses staged messages, so for production use the durable
//! [`crate::OutboxStore`] backend must participate in the same transaction as
//! the business data (outbox table co-located in the business store). That is
//! a deployment requirement, not an optional enhancement; the in-memory
//! reference store is test/dev only.

use tracing::warn;

use crate::bus::{StagingScope, TransactionalBus};
use crate::store::OutboxStoreError;

/// Business data store commit/rollback seam.
pub trait UnitOfWork {
    /// Commit pending business changes, returning the number of affected
    /// entities.
    fn commit(&mut self) -> Result<u64, UnitOfWorkError>;

    /// Discard pending business changes.
    fn rollback(&mut self);
}

/// Error surfaced by the business data store on commit.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unit of work commit failed: {0}")]
pub struct UnitOfWorkError(pub String);

impl UnitOfWorkError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Error from [`save_with_messages`].
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    /// The business commit failed. Staged messages were discarded.
    #[error(transparent)]
    Commit(#[from] UnitOfWorkError),

    /// The commit succeeded but the outbox flush failed. Staged messages are
    /// preserved on the scope so the caller can retry the flush alone.
    #[error("outbox flush failed after successful commit: {0}")]
    Flush(#[from] OutboxStoreError),
}

/// Commit the unit of work, then flush the scope's staged messages.
///
/// - commit fails: the scope is cleared and the commit error propagates; no
///   flush is attempted.
/// - flush fails after a successful commit: the error propagates and the
///   staged messages stay on the scope for a caller-directed flush retry —
///   they are never silently dropped.
pub fn save_with_messages(
    uow: &mut dyn UnitOfWork,
    bus: &TransactionalBus,
    scope: &mut StagingScope,
) -> Result<u64, SaveError> {
    let committed = match uow.commit() {
        Ok(count) => count,
        Err(e) => {
            scope.clear_pending();
            return Err(SaveError::Commit(e));
        }
    };

    match bus.flush_to_outbox(scope) {
        Ok(_) => Ok(committed),
        Err(e) => {
            warn!(
                staged = scope.pending_count(),
                error = %e,
                "commit succeeded but outbox flush failed; staged messages retained"
            );
            Err(SaveError::Flush(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::OutboundMessage;
    use crate::in_memory::InMemoryOutboxStore;
    use crate::store::OutboxStore;
    use serde::Serialize;
    use std::sync::Arc;

    #[derive(Serialize)]
    struct OrderCreated {
        order_id: u64,
    }

    impl OutboundMessage for OrderCreated {
        const MESSAGE_TYPE: &'static str = "OrderCreated";
    }

    struct FakeUow {
        fail: bool,
        rolled_back: bool,
    }

    impl FakeUow {
        fn ok() -> Self {
            Self {
                fail: false,
                rolled_back: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                rolled_back: false,
            }
        }
    }

    impl UnitOfWork for FakeUow {
        fn commit(&mut self) -> Result<u64, UnitOfWorkError> {
            if self.fail {
                Err(UnitOfWorkError::new("constraint violation"))
            } else {
                Ok(1)
            }
        }

        fn rollback(&mut self) {
            self.rolled_back = true;
        }
    }

    #[test]
    fn successful_commit_flushes_messages() {
        let store = InMemoryOutboxStore::arc();
        let bus = TransactionalBus::new(store.clone());
        let mut scope = StagingScope::new();
        let mut uow = FakeUow::ok();

        bus.publish(&mut scope, &OrderCreated { order_id: 1 }).unwrap();

        let committed = save_with_messages(&mut uow, &bus, &mut scope).unwrap();
        assert_eq!(committed, 1);
        assert_eq!(scope.pending_count(), 0);
        assert_eq!(store.pending_count().unwrap(), 1);
    }

    #[test]
    fn failed_commit_discards_staged_messages() {
        let store = InMemoryOutboxStore::arc();
        let bus = TransactionalBus::new(store.clone());
        let mut scope = StagingScope::new();
        let mut uow = FakeUow::failing();

        bus.publish(&mut scope, &OrderCreated { order_id: 1 }).unwrap();

        let result = save_with_messages(&mut uow, &bus, &mut scope);
        assert!(matches!(result, Err(SaveError::Commit(_))));
        assert_eq!(scope.pending_count(), 0);
        assert_eq!(store.pending_count().unwrap(), 0);

        // A later flush of the cleared scope persists nothing.
        let bus2 = TransactionalBus::new(store.clone());
        assert_eq!(bus2.flush_to_outbox(&mut scope).unwrap(), 0);
        assert_eq!(store.pending_count().unwrap(), 0);
    }

    #[test]
    fn failed_flush_preserves_staged_messages() {
        let store = InMemoryOutboxStore::arc();
        let bus = TransactionalBus::new(store.clone());
        let mut scope = StagingScope::new();
        let mut uow = FakeUow::ok();

        bus.publish(&mut scope, &OrderCreated { order_id: 1 }).unwrap();

        // Occupy the staged id so the flush is rejected after the commit.
        let staged = scope.pending_messages()[0].clone();
        store.add(staged).unwrap();

        let result = save_with_messages(&mut uow, &bus, &mut scope);
        assert!(matches!(result, Err(SaveError::Flush(_))));
        assert_eq!(scope.pending_count(), 1);
    }
}
