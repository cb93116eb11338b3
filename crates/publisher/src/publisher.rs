//! Outbox publisher: poll, dispatch, transition.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use courier_core::headers;
use courier_outbox::{MessageTypeRegistry, OutboxMessage, OutboxStore, OutboxStoreError};

use crate::transport::BrokerTransport;

/// Publisher configuration.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Name for logging and the worker thread.
    pub name: String,
    /// How often to poll the outbox for due records.
    pub poll_interval: Duration,
    /// Maximum records fetched per poll cycle.
    pub batch_size: usize,
    /// Whether to purge old published records periodically.
    pub cleanup_enabled: bool,
    /// How often the cleanup pass runs.
    pub cleanup_interval: Duration,
    /// How long published records are retained before cleanup.
    pub retention: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            name: "outbox-publisher".to_string(),
            poll_interval: Duration::from_secs(1),
            batch_size: 50,
            cleanup_enabled: true,
            cleanup_interval: Duration::from_secs(60),
            retention: Duration::from_secs(60 * 60 * 24),
        }
    }
}

impl PublisherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_cleanup(mut self, enabled: bool) -> Self {
        self.cleanup_enabled = enabled;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Point-in-time publisher status snapshot.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PublisherStatus {
    pub running: bool,
    pub published: u64,
    pub failed: u64,
    pub last_published_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub pending: usize,
}

/// Result of one poll/dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub dispatched: usize,
    pub published: usize,
    pub failed: usize,
}

/// Handle to control a running publisher.
pub struct PublisherHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<PublisherStatus>>,
    store: Arc<dyn OutboxStore>,
}

impl PublisherHandle {
    /// Request graceful shutdown and wait for the loop to stop.
    ///
    /// An in-flight dispatch finishes; no new records are started.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Current status snapshot, including the live pending count.
    pub fn status(&self) -> PublisherStatus {
        let mut status = self
            .stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        status.pending = self.store.pending_count().unwrap_or(0);
        status
    }
}

/// Background loop that drains the outbox store toward the broker.
///
/// One logical thread of control per instance; each record is dispatched
/// synchronously and transitioned before the next one starts. Multiple
/// instances require a store whose claim/transition pair is safe across
/// processes, which the in-memory reference store is not.
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    transport: Arc<dyn BrokerTransport>,
    registry: Option<Arc<MessageTypeRegistry>>,
    stats: Arc<Mutex<PublisherStatus>>,
}

impl OutboxPublisher {
    pub fn new(store: Arc<dyn OutboxStore>, transport: Arc<dyn BrokerTransport>) -> Self {
        Self {
            store,
            transport,
            registry: None,
            stats: Arc::new(Mutex::new(PublisherStatus::default())),
        }
    }

    /// Validate type tags against a registry before dispatching. An unknown
    /// tag then counts as a dispatch failure and goes through the normal
    /// retry/dead-letter path.
    pub fn with_registry(mut self, registry: Arc<MessageTypeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Run one poll/dispatch cycle synchronously.
    ///
    /// One record's failure never aborts the batch. Used by tests and by the
    /// background loop.
    pub fn run_once(&self, batch_size: usize) -> Result<CycleOutcome, OutboxStoreError> {
        let batch = self.store.get_pending(batch_size)?;
        let mut outcome = CycleOutcome::default();

        for record in batch {
            outcome.dispatched += 1;
            match self.dispatch(&record) {
                Ok(()) => outcome.published += 1,
                Err(_) => outcome.failed += 1,
            }
        }

        Ok(outcome)
    }

    /// Dispatch a single record and transition its status.
    fn dispatch(&self, record: &OutboxMessage) -> Result<(), String> {
        let result = self.try_send(record);

        match &result {
            Ok(()) => {
                if let Err(e) = self.store.mark_published(record.id) {
                    error!(message_id = %record.id, error = %e, "failed to mark record published");
                }
                let mut stats = self.stats.lock().unwrap();
                stats.published += 1;
                stats.last_published_at = Some(Utc::now());
                debug!(
                    message_id = %record.id,
                    message_type = %record.message_type,
                    routing_key = %record.routing_key,
                    "outbox record published"
                );
            }
            Err(e) => {
                if let Err(store_err) = self.store.mark_failed(record.id, e) {
                    error!(message_id = %record.id, error = %store_err, "failed to mark record failed");
                }
                let mut stats = self.stats.lock().unwrap();
                stats.failed += 1;
                stats.last_error = Some(e.clone());
                stats.last_error_at = Some(Utc::now());
                warn!(
                    message_id = %record.id,
                    message_type = %record.message_type,
                    retry_count = record.retry_count,
                    error = %e,
                    "outbox dispatch failed"
                );
            }
        }

        result
    }

    fn try_send(&self, record: &OutboxMessage) -> Result<(), String> {
        if let Some(registry) = &self.registry {
            if !registry.contains(&record.message_type) {
                return Err(format!(
                    "unknown message type tag: '{}'",
                    record.message_type
                ));
            }
        }

        // The bus stamps these at staging; re-assert them here so records
        // inserted by other producers still honor the wire contract.
        let mut wire_headers = record.headers.clone();
        wire_headers
            .entry(headers::MESSAGE_TYPE.to_string())
            .or_insert_with(|| record.message_type.clone());
        wire_headers
            .entry(headers::OUTBOX_MESSAGE_ID.to_string())
            .or_insert_with(|| record.id.to_string());

        self.transport
            .send(
                &record.payload,
                &record.routing_key,
                record.exchange.as_deref(),
                &wire_headers,
            )
            .map_err(|e| e.to_string())
    }

    /// Spawn the publisher loop in a background thread.
    pub fn spawn(self, config: PublisherConfig) -> PublisherHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();
        let store = self.store.clone();

        let name = config.name.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || publisher_loop(self, config, shutdown_rx))
            .expect("failed to spawn outbox publisher thread");

        PublisherHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
            store,
        }
    }
}

fn publisher_loop(
    publisher: OutboxPublisher,
    config: PublisherConfig,
    shutdown_rx: mpsc::Receiver<()>,
) {
    info!(publisher = %config.name, "outbox publisher started");
    if let Ok(mut stats) = publisher.stats.lock() {
        stats.running = true;
    }

    let mut last_cleanup = Instant::now();

    'outer: loop {
        // The poll tick doubles as the shutdown wait.
        match shutdown_rx.recv_timeout(config.poll_interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        let batch = match publisher.store.get_pending(config.batch_size) {
            Ok(batch) => batch,
            Err(e) => {
                // A failed poll cycle is not fatal to the publisher.
                error!(publisher = %config.name, error = %e, "outbox poll failed");
                if let Ok(mut stats) = publisher.stats.lock() {
                    stats.last_error = Some(e.to_string());
                    stats.last_error_at = Some(Utc::now());
                }
                continue;
            }
        };

        for record in batch {
            // Stop starting new records once shutdown is signaled; the
            // record currently in flight always runs to completion.
            if shutdown_rx.try_recv().is_ok() {
                break 'outer;
            }
            let _ = publisher.dispatch(&record);
        }

        if config.cleanup_enabled && last_cleanup.elapsed() >= config.cleanup_interval {
            let cutoff = Utc::now()
                - chrono::Duration::from_std(config.retention).unwrap_or_default();
            match publisher.store.cleanup(cutoff) {
                Ok(removed) if removed > 0 => {
                    debug!(publisher = %config.name, removed, "purged published outbox records");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(publisher = %config.name, error = %e, "outbox cleanup failed");
                }
            }
            last_cleanup = Instant::now();
        }
    }

    if let Ok(mut stats) = publisher.stats.lock() {
        stats.running = false;
    }
    info!(publisher = %config.name, "outbox publisher stopped");
}
