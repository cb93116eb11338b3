//! Transactional staging of outgoing messages.
//!
//! [`TransactionalBus::publish`] does no I/O: it serializes the message,
//! resolves routing, stamps correlation headers, and appends the record to a
//! [`StagingScope`]. The scope is a plain value owned by the current unit of
//! work, so concurrent transactions are isolated by ownership rather than by
//! any thread-local or task-local storage. Records reach the outbox store
//! only through [`TransactionalBus::flush_to_outbox`], after the business
//! commit succeeded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use courier_core::{CorrelationContext, MessageId, TenantId, headers};

use crate::message::OutboxMessage;
use crate::store::{OutboxStore, OutboxStoreError};

/// A message that can be staged for delivery.
///
/// The type tag must be stable across deployments: consumers use it to look
/// up a deserializer in their type registry.
pub trait OutboundMessage: Serialize {
    const MESSAGE_TYPE: &'static str;

    fn message_type(&self) -> &'static str {
        Self::MESSAGE_TYPE
    }
}

/// Staging error.
///
/// These surface synchronously to the caller; nothing is partially persisted.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("failed to serialize message of type '{message_type}': {source}")]
    Serialization {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid publish argument: {0}")]
    InvalidArgument(String),
}

/// Per-message publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Extra headers merged into the staged record.
    pub headers: HashMap<String, String>,
    /// Overrides the resolved routing key.
    pub routing_key: Option<String>,
    /// Overrides the resolved exchange.
    pub exchange: Option<String>,
    /// Tenant stamped into the `x-tenant-id` header.
    pub tenant_id: Option<TenantId>,
    /// Dispatch priority; lower sorts first.
    pub priority: Option<u8>,
    /// Delay first delivery by this much.
    pub delay: Option<Duration>,
}

impl PublishOptions {
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Scope-local pending list for one logical unit of work.
///
/// Create one per transaction, publish into it, then either flush it through
/// the bus on commit or discard it on rollback. Dropping an unflushed scope
/// drops its staged messages.
#[derive(Debug, Default)]
pub struct StagingScope {
    staged: Vec<OutboxMessage>,
    context: Option<CorrelationContext>,
}

impl StagingScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope for work happening while handling an inbound message; staged
    /// messages inherit the context's correlation id and record the inbound
    /// message as their causation.
    pub fn with_context(context: CorrelationContext) -> Self {
        Self {
            staged: Vec::new(),
            context: Some(context),
        }
    }

    pub fn context(&self) -> Option<&CorrelationContext> {
        self.context.as_ref()
    }

    pub fn pending_count(&self) -> usize {
        self.staged.len()
    }

    pub fn pending_messages(&self) -> &[OutboxMessage] {
        &self.staged
    }

    /// Explicit discard, used on rollback.
    pub fn clear_pending(&mut self) {
        self.staged.clear();
    }
}

type RoutingKeyFn = dyn Fn(&str) -> String + Send + Sync;
type ExchangeFn = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Producer-facing staging API.
///
/// One bus instance can serve any number of concurrent transactions; all
/// per-transaction state lives in the [`StagingScope`] each caller owns.
pub struct TransactionalBus {
    store: Arc<dyn OutboxStore>,
    routing_key_resolver: Box<RoutingKeyFn>,
    exchange_resolver: Box<ExchangeFn>,
}

impl TransactionalBus {
    /// Default routing: the routing key is the message type tag itself and no
    /// exchange is set.
    pub fn new(store: Arc<dyn OutboxStore>) -> Self {
        Self {
            store,
            routing_key_resolver: Box::new(|message_type| message_type.to_string()),
            exchange_resolver: Box::new(|_| None),
        }
    }

    pub fn with_routing_key_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.routing_key_resolver = Box::new(resolver);
        self
    }

    pub fn with_exchange_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.exchange_resolver = Box::new(resolver);
        self
    }

    /// Stage a message on the scope. Returns the generated id synchronously;
    /// no I/O happens here.
    pub fn publish<M: OutboundMessage>(
        &self,
        scope: &mut StagingScope,
        message: &M,
    ) -> Result<MessageId, StagingError> {
        self.publish_with(scope, message, PublishOptions::default())
    }

    /// Stage a message with explicit options.
    pub fn publish_with<M: OutboundMessage>(
        &self,
        scope: &mut StagingScope,
        message: &M,
        options: PublishOptions,
    ) -> Result<MessageId, StagingError> {
        let record = self.build_record(scope.context.as_ref(), message, options)?;
        let id = record.id;
        scope.staged.push(record);
        Ok(id)
    }

    /// Stage a batch, preserving input order.
    ///
    /// Fails fast: a serialization error on one item leaves the scope exactly
    /// as it was before the call.
    pub fn publish_batch<M: OutboundMessage>(
        &self,
        scope: &mut StagingScope,
        messages: &[M],
    ) -> Result<Vec<MessageId>, StagingError> {
        let mut records = Vec::with_capacity(messages.len());
        for message in messages {
            records.push(self.build_record(
                scope.context.as_ref(),
                message,
                PublishOptions::default(),
            )?);
        }

        let ids = records.iter().map(|r| r.id).collect();
        scope.staged.extend(records);
        Ok(ids)
    }

    /// Move every staged message into the outbox store as a single batch,
    /// then clear the scope.
    ///
    /// If the store call fails the scope is left untouched so the caller can
    /// retry the flush.
    pub fn flush_to_outbox(&self, scope: &mut StagingScope) -> Result<usize, OutboxStoreError> {
        if scope.staged.is_empty() {
            return Ok(0);
        }

        let count = scope.staged.len();
        self.store.add_batch(scope.staged.clone())?;
        scope.staged.clear();

        debug!(count, "flushed staged messages to outbox");
        Ok(count)
    }

    fn build_record<M: OutboundMessage>(
        &self,
        context: Option<&CorrelationContext>,
        message: &M,
        options: PublishOptions,
    ) -> Result<OutboxMessage, StagingError> {
        let message_type = message.message_type();
        if message_type.is_empty() {
            return Err(StagingError::InvalidArgument(
                "message type tag must not be empty".to_string(),
            ));
        }

        let payload =
            serde_json::to_string(message).map_err(|source| StagingError::Serialization {
                message_type: message_type.to_string(),
                source,
            })?;

        let routing_key = options
            .routing_key
            .unwrap_or_else(|| (self.routing_key_resolver)(message_type));
        let exchange = options
            .exchange
            .or_else(|| (self.exchange_resolver)(message_type));

        let mut record = OutboxMessage::new(message_type, payload, routing_key);
        record.exchange = exchange;

        // Caller headers first, injected headers on top so the wire contract
        // keys cannot be spoofed.
        record.headers = options.headers;
        match context {
            Some(ctx) => {
                record.headers.extend(ctx.header_map());
            }
            None => {
                record.headers.insert(
                    headers::CORRELATION_ID.to_string(),
                    uuid::Uuid::now_v7().to_string(),
                );
            }
        }
        record
            .headers
            .insert(headers::MESSAGE_TYPE.to_string(), message_type.to_string());
        record
            .headers
            .insert(headers::OUTBOX_MESSAGE_ID.to_string(), record.id.to_string());
        if let Some(tenant_id) = options.tenant_id {
            record
                .headers
                .insert(headers::TENANT_ID.to_string(), tenant_id.to_string());
        }
        if let Some(priority) = options.priority {
            record.priority = priority;
            record
                .headers
                .insert(headers::PRIORITY.to_string(), priority.to_string());
        }
        if let Some(delay) = options.delay {
            record.scheduled_at =
                Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        }

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryOutboxStore;
    use serde::Serialize;

    #[derive(Serialize)]
    struct OrderCreated {
        order_id: u64,
    }

    impl OutboundMessage for OrderCreated {
        const MESSAGE_TYPE: &'static str = "OrderCreated";
    }

    // serde_json cannot serialize a map with non-string keys at the top level.
    #[derive(Serialize)]
    struct Unserializable {
        bad: HashMap<Vec<u8>, String>,
    }

    impl OutboundMessage for Unserializable {
        const MESSAGE_TYPE: &'static str = "Unserializable";
    }

    fn bus() -> (TransactionalBus, Arc<InMemoryOutboxStore>) {
        let store = InMemoryOutboxStore::arc();
        (TransactionalBus::new(store.clone()), store)
    }

    #[test]
    fn publish_stages_without_storing() {
        let (bus, store) = bus();
        let mut scope = StagingScope::new();

        let id = bus.publish(&mut scope, &OrderCreated { order_id: 7 }).unwrap();

        assert_eq!(scope.pending_count(), 1);
        assert_eq!(scope.pending_messages()[0].id, id);
        assert_eq!(store.pending_count().unwrap(), 0);
    }

    #[test]
    fn staged_record_carries_injected_headers() {
        let (bus, _) = bus();
        let mut scope = StagingScope::new();

        let id = bus
            .publish_with(
                &mut scope,
                &OrderCreated { order_id: 7 },
                PublishOptions::default()
                    .with_header("x-custom", "yes")
                    .with_priority(3),
            )
            .unwrap();

        let record = &scope.pending_messages()[0];
        assert_eq!(record.headers["x-custom"], "yes");
        assert_eq!(record.headers[headers::MESSAGE_TYPE], "OrderCreated");
        assert_eq!(record.headers[headers::OUTBOX_MESSAGE_ID], id.to_string());
        assert_eq!(record.headers[headers::PRIORITY], "3");
        assert!(record.headers.contains_key(headers::CORRELATION_ID));
        assert_eq!(record.priority, 3);
    }

    #[test]
    fn context_drives_correlation_and_causation() {
        let (bus, _) = bus();
        let inbound_id = MessageId::new();
        let ctx = CorrelationContext::for_inbound(inbound_id, &HashMap::new());
        let correlation = ctx.correlation_id();
        let mut scope = StagingScope::with_context(ctx);

        bus.publish(&mut scope, &OrderCreated { order_id: 7 }).unwrap();

        let record = &scope.pending_messages()[0];
        assert_eq!(record.headers[headers::CORRELATION_ID], correlation.to_string());
        assert_eq!(record.headers[headers::CAUSATION_ID], inbound_id.to_string());
    }

    #[test]
    fn default_routing_derives_from_type_tag() {
        let (bus, _) = bus();
        let mut scope = StagingScope::new();

        bus.publish(&mut scope, &OrderCreated { order_id: 7 }).unwrap();
        assert_eq!(scope.pending_messages()[0].routing_key, "OrderCreated");
        assert!(scope.pending_messages()[0].exchange.is_none());
    }

    #[test]
    fn resolvers_and_overrides_take_precedence() {
        let store = InMemoryOutboxStore::arc();
        let bus = TransactionalBus::new(store)
            .with_routing_key_resolver(|t| format!("events.{t}"))
            .with_exchange_resolver(|_| Some("domain-events".to_string()));
        let mut scope = StagingScope::new();

        bus.publish(&mut scope, &OrderCreated { order_id: 1 }).unwrap();
        bus.publish_with(
            &mut scope,
            &OrderCreated { order_id: 2 },
            PublishOptions::default()
                .with_routing_key("audit.orders")
                .with_exchange("audit"),
        )
        .unwrap();

        let records = scope.pending_messages();
        assert_eq!(records[0].routing_key, "events.OrderCreated");
        assert_eq!(records[0].exchange.as_deref(), Some("domain-events"));
        assert_eq!(records[1].routing_key, "audit.orders");
        assert_eq!(records[1].exchange.as_deref(), Some("audit"));
    }

    #[test]
    fn batch_preserves_order_and_fails_fast() {
        let (bus, _) = bus();
        let mut scope = StagingScope::new();

        let ids = bus
            .publish_batch(
                &mut scope,
                &[
                    OrderCreated { order_id: 1 },
                    OrderCreated { order_id: 2 },
                    OrderCreated { order_id: 3 },
                ],
            )
            .unwrap();
        assert_eq!(scope.pending_count(), 3);
        let staged_ids: Vec<_> = scope.pending_messages().iter().map(|m| m.id).collect();
        assert_eq!(ids, staged_ids);

        // A failing batch leaves earlier staging untouched.
        let mut bad = HashMap::new();
        bad.insert(vec![1u8], "x".to_string());
        let result = bus.publish_batch(&mut scope, &[Unserializable { bad }]);
        assert!(matches!(result, Err(StagingError::Serialization { .. })));
        assert_eq!(scope.pending_count(), 3);
    }

    #[test]
    fn concurrent_scopes_are_isolated() {
        let (bus, _) = bus();
        let mut scope_a = StagingScope::new();
        let mut scope_b = StagingScope::new();

        bus.publish(&mut scope_a, &OrderCreated { order_id: 1 }).unwrap();
        bus.publish(&mut scope_b, &OrderCreated { order_id: 2 }).unwrap();
        bus.publish(&mut scope_a, &OrderCreated { order_id: 3 }).unwrap();

        assert_eq!(scope_a.pending_count(), 2);
        assert_eq!(scope_b.pending_count(), 1);
    }

    #[test]
    fn flush_moves_everything_in_one_batch_and_clears_scope() {
        let (bus, store) = bus();
        let mut scope = StagingScope::new();

        bus.publish(&mut scope, &OrderCreated { order_id: 1 }).unwrap();
        bus.publish(&mut scope, &OrderCreated { order_id: 2 }).unwrap();

        let flushed = bus.flush_to_outbox(&mut scope).unwrap();
        assert_eq!(flushed, 2);
        assert_eq!(scope.pending_count(), 0);
        assert_eq!(store.pending_count().unwrap(), 2);

        // A second flush of the empty scope is a no-op.
        assert_eq!(bus.flush_to_outbox(&mut scope).unwrap(), 0);
    }

    #[test]
    fn failed_flush_preserves_the_scope_for_retry() {
        let (bus, store) = bus();
        let mut scope = StagingScope::new();

        bus.publish(&mut scope, &OrderCreated { order_id: 1 }).unwrap();

        // Occupy the id in the store so the flush is rejected.
        let staged = scope.pending_messages()[0].clone();
        store.add(staged).unwrap();

        assert!(bus.flush_to_outbox(&mut scope).is_err());
        assert_eq!(scope.pending_count(), 1);
    }

    #[test]
    fn flushed_message_round_trips_payload_and_headers() {
        let (bus, store) = bus();
        let mut scope = StagingScope::new();

        bus.publish_with(
            &mut scope,
            &OrderCreated { order_id: 42 },
            PublishOptions::default().with_header("x-origin", "unit-test"),
        )
        .unwrap();
        bus.flush_to_outbox(&mut scope).unwrap();

        let fetched = store.get_pending(1).unwrap().remove(0);
        assert_eq!(fetched.payload, r#"{"order_id":42}"#);
        assert_eq!(fetched.headers["x-origin"], "unit-test");
        for key in [
            headers::CORRELATION_ID,
            headers::MESSAGE_TYPE,
            headers::OUTBOX_MESSAGE_ID,
        ] {
            assert!(fetched.headers.contains_key(key), "missing header {key}");
        }
    }
}
