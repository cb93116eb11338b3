//! `courier-outbox` — transactional staging and the durable outbox.
//!
//! Producers stage outgoing messages on a [`StagingScope`] via the
//! [`TransactionalBus`]; a successful business commit flushes the scope into
//! an [`OutboxStore`] as `Pending` records, which the publisher crate later
//! drains toward the broker.

pub mod bus;
pub mod in_memory;
pub mod message;
pub mod registry;
pub mod store;
pub mod uow;

pub use bus::{OutboundMessage, PublishOptions, StagingError, StagingScope, TransactionalBus};
pub use in_memory::InMemoryOutboxStore;
pub use message::{OutboxMessage, OutboxStatus, RetrySchedule};
pub use registry::{MessageTypeRegistry, RegistryError};
pub use store::{OutboxStore, OutboxStoreError};
pub use uow::{SaveError, UnitOfWork, UnitOfWorkError, save_with_messages};
