//! Consumer retry/dead-letter filter.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::context::ConsumeContext;
use crate::dead_letter::{DeadLetterStore, FailedMessage};
use crate::error::ConsumeError;

/// Retry filter configuration.
#[derive(Debug, Clone)]
pub struct RetryFilterConfig {
    /// Redeliveries allowed before dead-lettering.
    pub max_retries: u32,
    /// Delay before the first redelivery.
    pub initial_delay: Duration,
    /// Ceiling on the redelivery delay.
    pub max_delay: Duration,
    /// Exponential backoff when true, fixed `initial_delay` otherwise.
    pub exponential: bool,
    /// Jitter fraction (0.0-1.0) perturbing the delay.
    pub jitter: f64,
    /// Return the original error after handling (for acknowledgement-based
    /// transports). When false the filter fully owns the outcome.
    pub rethrow: bool,
    /// Dead-letter errors whose kind is outside a non-empty handle list;
    /// when false such errors propagate instead.
    pub dead_letter_on_unhandled: bool,
    /// When non-empty, only these kinds are retried.
    pub handle_kinds: Vec<String>,
    /// Kinds that bypass retry and dead-lettering entirely.
    pub ignore_kinds: Vec<String>,
}

impl Default for RetryFilterConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential: true,
            jitter: 0.0,
            rethrow: false,
            dead_letter_on_unhandled: true,
            handle_kinds: Vec::new(),
            ignore_kinds: Vec::new(),
        }
    }
}

impl RetryFilterConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_exponential(mut self, exponential: bool) -> Self {
        self.exponential = exponential;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_rethrow(mut self, rethrow: bool) -> Self {
        self.rethrow = rethrow;
        self
    }

    pub fn with_dead_letter_on_unhandled(mut self, enabled: bool) -> Self {
        self.dead_letter_on_unhandled = enabled;
        self
    }

    pub fn handle_kind(mut self, kind: impl Into<String>) -> Self {
        self.handle_kinds.push(kind.into());
        self
    }

    pub fn ignore_kind(mut self, kind: impl Into<String>) -> Self {
        self.ignore_kinds.push(kind.into());
        self
    }

    /// Redelivery delay for the given redelivery count (0 on first failure).
    pub fn delay_for(&self, redelivery_count: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let mut delay_ms = if self.exponential {
            let exp = 2_f64.powi(redelivery_count.min(i32::MAX as u32) as i32);
            (base_ms * exp).min(max_ms)
        } else {
            base_ms.min(max_ms)
        };

        if self.jitter > 0.0 {
            // Deterministic pseudo-jitter derived from the attempt number;
            // good enough to de-synchronize retry storms without a rand dep.
            let pseudo_random = (((redelivery_count + 1) as f64 * 17.0) % 100.0) / 100.0;
            delay_ms += delay_ms * self.jitter * (pseudo_random - 0.5) * 2.0;
        }

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}

/// What the transport layer should do with the message next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Handler succeeded; acknowledge the message.
    Completed,
    /// Redeliver after the given delay.
    Redeliver { delay: Duration },
    /// The message was routed to the dead-letter store; stop the filter
    /// chain for this message.
    DeadLettered,
}

/// Wraps inbound message handling with uniform retry and dead-letter policy.
pub struct RetryFilter {
    config: RetryFilterConfig,
    dead_letters: Arc<dyn DeadLetterStore>,
}

impl RetryFilter {
    pub fn new(config: RetryFilterConfig, dead_letters: Arc<dyn DeadLetterStore>) -> Self {
        Self {
            config,
            dead_letters,
        }
    }

    pub fn config(&self) -> &RetryFilterConfig {
        &self.config
    }

    /// Run a handler under the retry/dead-letter policy.
    ///
    /// On failure the outcome is recorded on the context; the returned error
    /// (when `rethrow` is set, or for ignored/unhandled kinds) is the
    /// original handler error, untouched.
    pub fn handle<H>(
        &self,
        ctx: &mut ConsumeContext,
        handler: H,
    ) -> Result<FilterOutcome, ConsumeError>
    where
        H: FnOnce(&mut ConsumeContext) -> Result<(), ConsumeError>,
    {
        let err = match handler(ctx) {
            Ok(()) => {
                ctx.outcome = Some(FilterOutcome::Completed);
                return Ok(FilterOutcome::Completed);
            }
            Err(e) => e,
        };

        // Ignorable kinds bypass retry and dead-lettering entirely: the
        // error propagates without touching the context's failure state.
        if self.config.ignore_kinds.iter().any(|k| k == err.kind()) {
            debug!(
                message_id = %ctx.message_id,
                kind = err.kind(),
                "ignorable consume error, propagating"
            );
            return Err(err);
        }

        let handled = self.config.handle_kinds.is_empty()
            || self.config.handle_kinds.iter().any(|k| k == err.kind());
        if !handled {
            if self.config.dead_letter_on_unhandled {
                ctx.record_failure(err.clone(), Utc::now());
                let reason = format!(
                    "error kind '{}' is outside the handled set (max retries {}); last error: {}",
                    err.kind(),
                    self.config.max_retries,
                    err.message()
                );
                self.dead_letter(ctx, &err, reason);
                ctx.outcome = Some(FilterOutcome::DeadLettered);
                return self.finish(FilterOutcome::DeadLettered, err);
            }
            return Err(err);
        }

        ctx.record_failure(err.clone(), Utc::now());

        if ctx.redelivery_count < self.config.max_retries {
            let delay = self.config.delay_for(ctx.redelivery_count);
            debug!(
                message_id = %ctx.message_id,
                redelivery_count = ctx.redelivery_count,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "scheduling redelivery"
            );
            let outcome = FilterOutcome::Redeliver { delay };
            ctx.outcome = Some(outcome);
            return self.finish(outcome, err);
        }

        let reason = format!(
            "exhausted {} redeliveries; last error: {}",
            self.config.max_retries,
            err.message()
        );
        warn!(
            message_id = %ctx.message_id,
            message_type = %ctx.message_type,
            reason = %reason,
            "message dead-lettered"
        );
        self.dead_letter(ctx, &err, reason);
        ctx.outcome = Some(FilterOutcome::DeadLettered);
        self.finish(FilterOutcome::DeadLettered, err)
    }

    fn finish(
        &self,
        outcome: FilterOutcome,
        err: ConsumeError,
    ) -> Result<FilterOutcome, ConsumeError> {
        if self.config.rethrow {
            Err(err)
        } else {
            Ok(outcome)
        }
    }

    fn dead_letter(&self, ctx: &ConsumeContext, err: &ConsumeError, reason: String) {
        let now = Utc::now();
        let failed = FailedMessage {
            id: ctx.message_id,
            message_type: ctx.message_type.clone(),
            payload: ctx.payload.clone(),
            attempts: ctx.redelivery_count + 1,
            max_attempts: self.config.max_retries,
            first_failed_at: ctx.first_failed_at.unwrap_or(now),
            dead_lettered_at: now,
            reason,
            last_error: err.message().to_string(),
            error_kind: err.kind().to_string(),
            source_queue: ctx.source_queue.clone(),
            priority: ctx.priority().unwrap_or(100),
            metadata: ctx.headers.clone(),
        };

        if let Err(e) = self.dead_letters.add(failed) {
            error!(
                message_id = %ctx.message_id,
                error = %e,
                "failed to persist dead-letter record"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::InMemoryDeadLetterStore;
    use courier_core::MessageId;
    use std::collections::HashMap;

    fn ctx(redelivery_count: u32) -> ConsumeContext {
        ConsumeContext::new(
            MessageId::new(),
            "OrderCreated",
            "{}",
            HashMap::new(),
            "orders",
        )
        .with_redelivery_count(redelivery_count)
    }

    fn filter(config: RetryFilterConfig) -> (RetryFilter, Arc<InMemoryDeadLetterStore>) {
        let store = InMemoryDeadLetterStore::arc();
        (RetryFilter::new(config, store.clone()), store)
    }

    #[test]
    fn success_completes() {
        let (filter, store) = filter(RetryFilterConfig::default());
        let mut ctx = ctx(0);

        let outcome = filter.handle(&mut ctx, |_| Ok(())).unwrap();
        assert_eq!(outcome, FilterOutcome::Completed);
        assert_eq!(ctx.outcome, Some(FilterOutcome::Completed));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn failure_below_budget_schedules_backoff_redelivery() {
        let config = RetryFilterConfig::default()
            .with_max_retries(5)
            .with_initial_delay(Duration::from_secs(1));
        let (filter, store) = filter(config);
        let mut ctx = ctx(2);

        let outcome = filter
            .handle(&mut ctx, |_| Err(ConsumeError::new("db", "timeout")))
            .unwrap();

        // initial 1s * 2^2 redeliveries.
        assert_eq!(
            outcome,
            FilterOutcome::Redeliver { delay: Duration::from_secs(4) }
        );
        assert_eq!(ctx.errors.len(), 1);
        assert!(ctx.first_failed_at.is_some());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn exhausted_budget_dead_letters_with_triage_reason() {
        let config = RetryFilterConfig::default().with_max_retries(3);
        let (filter, store) = filter(config);
        let mut ctx = ctx(3);

        let outcome = filter
            .handle(&mut ctx, |_| Err(ConsumeError::new("db", "still down")))
            .unwrap();
        assert_eq!(outcome, FilterOutcome::DeadLettered);

        let records = store.list(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempts, 4);
        assert_eq!(records[0].max_attempts, 3);
        assert_eq!(records[0].last_error, "still down");
        assert!(records[0].reason.contains('3'));
        assert!(records[0].reason.contains("still down"));
    }

    #[test]
    fn handler_succeeding_within_budget_is_never_dead_lettered() {
        // Max redeliveries 2: the handler fails on attempts 0 and 1 and
        // succeeds on attempt 2.
        let config = RetryFilterConfig::default().with_max_retries(2);
        let (filter, store) = filter(config);

        for attempt in 0..3u32 {
            let mut ctx = ctx(attempt);
            let outcome = filter
                .handle(&mut ctx, |_| {
                    if attempt < 2 {
                        Err(ConsumeError::new("flaky", "not yet"))
                    } else {
                        Ok(())
                    }
                })
                .unwrap();

            if attempt < 2 {
                assert!(matches!(outcome, FilterOutcome::Redeliver { .. }));
            } else {
                assert_eq!(outcome, FilterOutcome::Completed);
            }
        }

        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn ignored_kinds_propagate_untouched() {
        let config = RetryFilterConfig::default().ignore_kind("cancelled");
        let (filter, store) = filter(config);
        let mut ctx = ctx(0);

        let result = filter.handle(&mut ctx, |_| Err(ConsumeError::cancelled("shutting down")));

        let err = result.unwrap_err();
        assert_eq!(err.kind(), "cancelled");
        assert!(ctx.errors.is_empty());
        assert!(ctx.first_failed_at.is_none());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn unhandled_kind_is_dead_lettered_when_flag_is_set() {
        let config = RetryFilterConfig::default().handle_kind("db");
        let (filter, store) = filter(config);
        let mut ctx = ctx(0);

        let outcome = filter
            .handle(&mut ctx, |_| Err(ConsumeError::new("validation", "bad payload")))
            .unwrap();
        assert_eq!(outcome, FilterOutcome::DeadLettered);

        let records = store.list(10).unwrap();
        assert_eq!(records[0].error_kind, "validation");
        assert!(records[0].reason.contains("validation"));
        assert!(records[0].reason.contains("bad payload"));
    }

    #[test]
    fn unhandled_kind_propagates_when_flag_is_unset() {
        let config = RetryFilterConfig::default()
            .handle_kind("db")
            .with_dead_letter_on_unhandled(false);
        let (filter, store) = filter(config);
        let mut ctx = ctx(0);

        let result = filter.handle(&mut ctx, |_| Err(ConsumeError::new("validation", "bad")));
        assert!(result.is_err());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn rethrow_returns_the_original_error_after_handling() {
        let config = RetryFilterConfig::default().with_rethrow(true);
        let (filter, store) = filter(config.clone());

        // Within budget: redelivery is recorded on the context, error returns.
        let mut retry_ctx = ctx(0);
        let err = filter
            .handle(&mut retry_ctx, |_| Err(ConsumeError::new("db", "down")))
            .unwrap_err();
        assert_eq!(err.kind(), "db");
        assert!(matches!(retry_ctx.outcome, Some(FilterOutcome::Redeliver { .. })));

        // Exhausted: dead-letter happens, error still returns.
        let mut dead_ctx = ctx(config.max_retries);
        let err = filter
            .handle(&mut dead_ctx, |_| Err(ConsumeError::new("db", "down")))
            .unwrap_err();
        assert_eq!(err.kind(), "db");
        assert_eq!(dead_ctx.outcome, Some(FilterOutcome::DeadLettered));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let config = RetryFilterConfig::default()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10));

        assert_eq!(config.delay_for(0), Duration::from_secs(1));
        assert_eq!(config.delay_for(1), Duration::from_secs(2));
        assert_eq!(config.delay_for(2), Duration::from_secs(4));
        assert_eq!(config.delay_for(3), Duration::from_secs(8));
        assert_eq!(config.delay_for(4), Duration::from_secs(10));
        assert_eq!(config.delay_for(10), Duration::from_secs(10));
    }

    #[test]
    fn fixed_delay_when_exponential_is_off() {
        let config = RetryFilterConfig::default()
            .with_exponential(false)
            .with_initial_delay(Duration::from_secs(2));

        assert_eq!(config.delay_for(0), Duration::from_secs(2));
        assert_eq!(config.delay_for(5), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_the_configured_fraction() {
        let config = RetryFilterConfig::default()
            .with_initial_delay(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(3600))
            .with_jitter(0.2);

        for count in 0..8u32 {
            let nominal = RetryFilterConfig::default()
                .with_initial_delay(Duration::from_secs(10))
                .with_max_delay(Duration::from_secs(3600))
                .delay_for(count);
            let jittered = config.delay_for(count);

            let lower = nominal.as_millis() as f64 * 0.8;
            let upper = nominal.as_millis() as f64 * 1.2;
            let actual = jittered.as_millis() as f64;
            assert!(
                actual >= lower && actual <= upper,
                "count {count}: {actual} outside [{lower}, {upper}]"
            );
        }
    }
}
