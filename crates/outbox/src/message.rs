//! Outbox message record, status state machine, and retry schedule.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::MessageId;

/// Delivery status of an outbox record.
///
/// `Pending → Published` on successful dispatch; `Pending | Failed → Failed`
/// while attempts remain; `Pending | Failed → DeadLetter` once attempts are
/// exhausted. `Published` and `DeadLetter` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Staged and waiting for first dispatch.
    Pending,
    /// Dispatched successfully. Terminal.
    Published,
    /// Dispatch failed, retry scheduled.
    Failed,
    /// Retries exhausted. Terminal.
    DeadLetter,
}

impl OutboxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Published | OutboxStatus::DeadLetter)
    }
}

/// Exponential retry schedule for dispatch failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySchedule {
    /// Attempts after which a record is dead-lettered.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on every further failure.
    pub base_delay: Duration,
    /// Optional ceiling on the computed delay. `None` leaves it uncapped.
    pub max_delay: Option<Duration>,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: None,
        }
    }
}

impl RetrySchedule {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Delay before the `retry_count`-th retry (1-indexed): `base * 2^(n-1)`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let exp = 2_f64.powi((retry_count - 1).min(i32::MAX as u32) as i32);
        let mut delay_ms = base_ms * exp;

        if let Some(max) = self.max_delay {
            delay_ms = delay_ms.min(max.as_millis() as f64);
        }

        Duration::from_millis(delay_ms as u64)
    }

    /// Whether another retry is allowed after `retry_count` failures.
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

/// One staged/queued outbound message.
///
/// Created by the transactional bus, persisted by the outbox store on flush,
/// and thereafter mutated exclusively by the publisher (status, retry and
/// error fields). Business code never touches a record after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Unique id, immutable once created.
    pub id: MessageId,
    /// Stable type tag for deserialization on replay.
    pub message_type: String,
    /// Serialized payload.
    pub payload: String,
    /// Destination routing key (opaque to this subsystem).
    pub routing_key: String,
    /// Destination exchange/topic, when the broker distinguishes one.
    pub exchange: Option<String>,
    /// Header map (correlation, causation, tenant, priority, ...).
    pub headers: HashMap<String, String>,
    /// Current delivery status.
    pub status: OutboxStatus,
    /// Dispatch priority; lower sorts first.
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    /// Optional not-before time for delayed delivery.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Set on successful dispatch.
    pub published_at: Option<DateTime<Utc>>,
    /// Number of failed dispatch attempts so far. Only increases.
    pub retry_count: u32,
    /// Set only while status is `Failed`.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Error text from the most recent failed attempt.
    pub last_error: Option<String>,
}

pub const DEFAULT_PRIORITY: u8 = 100;

impl OutboxMessage {
    pub fn new(
        message_type: impl Into<String>,
        payload: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            message_type: message_type.into(),
            payload: payload.into(),
            routing_key: routing_key.into(),
            exchange: None,
            headers: HashMap::new(),
            status: OutboxStatus::Pending,
            priority: DEFAULT_PRIORITY,
            created_at: Utc::now(),
            scheduled_at: None,
            published_at: None,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Delay first delivery until `at`.
    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Whether the record is eligible for dispatch at `now`.
    ///
    /// Pending records are due once any not-before time has elapsed; Failed
    /// records additionally wait for their retry backoff to expire.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if let Some(at) = self.scheduled_at {
            if now < at {
                return false;
            }
        }
        match self.status {
            OutboxStatus::Pending => true,
            OutboxStatus::Failed => self.next_retry_at.map_or(true, |at| now >= at),
            OutboxStatus::Published | OutboxStatus::DeadLetter => false,
        }
    }

    /// Transition to `Published`.
    ///
    /// Idempotent: a record already in a terminal state is left untouched, so
    /// a second call never changes the published timestamp.
    pub fn mark_published(&mut self, now: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = OutboxStatus::Published;
        self.published_at = Some(now);
        self.next_retry_at = None;
    }

    /// Record a failed dispatch attempt.
    ///
    /// Increments the retry count and either schedules the next retry with
    /// exponential backoff or, once the schedule is exhausted, dead-letters
    /// the record. No-op for records already in a terminal state.
    pub fn mark_failed(&mut self, error: impl Into<String>, schedule: &RetrySchedule, now: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        self.retry_count += 1;
        self.last_error = Some(error.into());

        if schedule.allows_retry(self.retry_count) {
            let delay = schedule.delay_for(self.retry_count);
            self.status = OutboxStatus::Failed;
            self.next_retry_at =
                Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
        } else {
            self.status = OutboxStatus::DeadLetter;
            self.next_retry_at = None;
        }
    }
}
