//! Per-message processing context.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use courier_core::{CorrelationContext, MessageId, headers};

use crate::error::ConsumeError;
use crate::filter::FilterOutcome;

/// State carried through the filter chain for one inbound message.
///
/// The redelivery count is supplied by the transport (it owns redelivery),
/// not by the filter. Accumulated errors stay on the context for downstream
/// filters and loggers to read.
#[derive(Debug)]
pub struct ConsumeContext {
    pub message_id: MessageId,
    pub message_type: String,
    pub payload: String,
    pub headers: HashMap<String, String>,
    /// How many times the transport has redelivered this message (0 on the
    /// first delivery).
    pub redelivery_count: u32,
    /// Queue the message arrived on.
    pub source_queue: String,
    /// Explicitly passed correlation context for this consume operation.
    pub correlation: CorrelationContext,
    /// Errors from this and previous attempts, oldest first.
    pub errors: Vec<ConsumeError>,
    /// When the first failed attempt happened.
    pub first_failed_at: Option<DateTime<Utc>>,
    /// What the retry filter decided for the most recent attempt, for
    /// downstream filters and loggers.
    pub outcome: Option<FilterOutcome>,
}

impl ConsumeContext {
    pub fn new(
        message_id: MessageId,
        message_type: impl Into<String>,
        payload: impl Into<String>,
        headers: HashMap<String, String>,
        source_queue: impl Into<String>,
    ) -> Self {
        let correlation = CorrelationContext::for_inbound(message_id, &headers);
        Self {
            message_id,
            message_type: message_type.into(),
            payload: payload.into(),
            headers,
            redelivery_count: 0,
            source_queue: source_queue.into(),
            correlation,
            errors: Vec::new(),
            first_failed_at: None,
            outcome: None,
        }
    }

    /// Build a context straight from wire headers (id and type come from the
    /// `x-outbox-message-id` / `x-message-type` keys when present).
    pub fn from_wire(
        payload: impl Into<String>,
        headers: HashMap<String, String>,
        source_queue: impl Into<String>,
    ) -> Self {
        let message_id = headers
            .get(headers::OUTBOX_MESSAGE_ID)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        let message_type = headers
            .get(headers::MESSAGE_TYPE)
            .cloned()
            .unwrap_or_default();
        Self::new(message_id, message_type, payload, headers, source_queue)
    }

    pub fn with_redelivery_count(mut self, count: u32) -> Self {
        self.redelivery_count = count;
        self
    }

    /// Priority from the `x-priority` header, when present and well-formed.
    pub fn priority(&self) -> Option<u8> {
        self.headers.get(headers::PRIORITY).and_then(|v| v.parse().ok())
    }

    pub(crate) fn record_failure(&mut self, error: ConsumeError, now: DateTime<Utc>) {
        self.first_failed_at.get_or_insert(now);
        self.errors.push(error);
    }

    pub fn last_error(&self) -> Option<&ConsumeError> {
        self.errors.last()
    }
}
