//! Correlation/causation propagation.
//!
//! The context is **passed explicitly** — as a field on the producer's staging
//! scope or the consumer's processing context — rather than stashed in any
//! thread-local or task-local cell. It is owned by the in-flight operation and
//! discarded when that operation completes.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::headers;
use crate::id::MessageId;

/// Ambient metadata for one in-flight operation.
///
/// `correlation_id` ties a whole chain of messages together; `message_id` is
/// the inbound message currently being handled (if any) and becomes the
/// causation id of anything published while handling it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationContext {
    correlation_id: Uuid,
    causation_id: Option<Uuid>,
    message_id: Option<MessageId>,
    created_at: DateTime<Utc>,
}

impl CorrelationContext {
    /// Start a fresh chain (no inbound message caused this operation).
    pub fn new_root() -> Self {
        Self {
            correlation_id: Uuid::now_v7(),
            causation_id: None,
            message_id: None,
            created_at: Utc::now(),
        }
    }

    /// Build the context for handling an inbound message.
    ///
    /// Unknown or malformed correlation headers fall back to a fresh chain so
    /// a bad upstream header never blocks consumption.
    pub fn for_inbound(message_id: MessageId, headers: &HashMap<String, String>) -> Self {
        let correlation_id = headers
            .get(headers::CORRELATION_ID)
            .and_then(|v| Uuid::from_str(v).ok())
            .unwrap_or_else(Uuid::now_v7);
        let causation_id = headers
            .get(headers::CAUSATION_ID)
            .and_then(|v| Uuid::from_str(v).ok());

        Self {
            correlation_id,
            causation_id,
            message_id: Some(message_id),
            created_at: Utc::now(),
        }
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn causation_id(&self) -> Option<Uuid> {
        self.causation_id
    }

    /// The inbound message this operation is handling, if any.
    pub fn message_id(&self) -> Option<MessageId> {
        self.message_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Headers to stamp onto an outgoing message produced under this context.
    ///
    /// The outgoing causation id is the id of the message currently being
    /// handled; for a root context there is no causation header.
    pub fn header_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(
            headers::CORRELATION_ID.to_string(),
            self.correlation_id.to_string(),
        );
        if let Some(id) = self.message_id {
            map.insert(headers::CAUSATION_ID.to_string(), id.to_string());
        }
        map
    }
}
