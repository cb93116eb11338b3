//! `courier-publisher` — background draining of the outbox toward the broker.

pub mod publisher;
pub mod transport;

pub use publisher::{CycleOutcome, OutboxPublisher, PublisherConfig, PublisherHandle, PublisherStatus};
pub use transport::{BrokerTransport, TransportError};
