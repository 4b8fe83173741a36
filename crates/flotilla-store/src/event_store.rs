//! Append-only event persistence: the backend trait, an indexed in-memory
//! backend, and the batching front-end every producer talks to.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use flotilla_bus::{EventBus, PublishOptions};
use flotilla_types::{Event, StoreConfig};

use crate::{StoreError, PERSISTENCE_ERROR_EVENT};

//─────────────────────────────
//  Backend trait
//─────────────────────────────

/// Abstraction over an append-only event sink with indexed reads.
///
/// Batches must commit atomically: either every event in the batch is
/// durable or none is. Implementations may be slow; the buffered front-end
/// keeps producers decoupled from commit latency.
#[async_trait]
pub trait EventStoreBackend: Send + Sync {
    /// Persist a batch of events atomically, in order.
    async fn commit(&self, batch: &[Event]) -> Result<()>;

    /// Every event in a correlation chain, ascending by timestamp.
    async fn get_stream(&self, correlation_id: Uuid) -> Result<Vec<Event>>;

    /// All events after the given timestamp (exclusive), ascending.
    async fn get_all(&self, after: Option<DateTime<Utc>>, limit: Option<usize>)
        -> Result<Vec<Event>>;

    /// Events of one type, optionally bounded below by `since` (inclusive).
    async fn get_by_type(
        &self,
        event_type: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>>;

    /// Events from one source, optionally bounded below by `since`.
    async fn get_by_source(
        &self,
        source: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>>;
}

//─────────────────────────────
//  In-memory backend
//─────────────────────────────

#[derive(Default)]
struct MemoryIndexes {
    by_type: HashMap<String, Vec<usize>>,
    by_source: HashMap<String, Vec<usize>>,
    by_correlation: HashMap<Uuid, Vec<usize>>,
}

/// Indexed, non-durable event backend for tests and development.
#[derive(Default)]
pub struct MemoryEventStore {
    log: RwLock<(Vec<Event>, MemoryIndexes)>,
}

impl MemoryEventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed events.
    pub async fn len(&self) -> usize {
        self.log.read().await.0.len()
    }

    /// Whether nothing has been committed yet.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn collect(
        log: &[Event],
        indices: &[usize],
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Vec<Event> {
        let mut events: Vec<Event> = indices
            .iter()
            .map(|&i| log[i].clone())
            .filter(|e| since.map_or(true, |s| e.timestamp >= s))
            .collect();
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        events
    }
}

#[async_trait]
impl EventStoreBackend for MemoryEventStore {
    async fn commit(&self, batch: &[Event]) -> Result<()> {
        let mut guard = self.log.write().await;
        let (log, indexes) = &mut *guard;
        for event in batch {
            let index = log.len();
            indexes
                .by_type
                .entry(event.event_type.clone())
                .or_default()
                .push(index);
            indexes
                .by_source
                .entry(event.source.clone())
                .or_default()
                .push(index);
            indexes
                .by_correlation
                .entry(event.metadata.correlation_id)
                .or_default()
                .push(index);
            log.push(event.clone());
        }
        Ok(())
    }

    async fn get_stream(&self, correlation_id: Uuid) -> Result<Vec<Event>> {
        let guard = self.log.read().await;
        let (log, indexes) = &*guard;
        let mut events = match indexes.by_correlation.get(&correlation_id) {
            Some(indices) => Self::collect(log, indices, None, None),
            None => Vec::new(),
        };
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    async fn get_all(
        &self,
        after: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>> {
        let guard = self.log.read().await;
        let mut events: Vec<Event> = guard
            .0
            .iter()
            .filter(|e| after.map_or(true, |a| e.timestamp > a))
            .cloned()
            .collect();
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn get_by_type(
        &self,
        event_type: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>> {
        let guard = self.log.read().await;
        let (log, indexes) = &*guard;
        Ok(match indexes.by_type.get(event_type) {
            Some(indices) => Self::collect(log, indices, since, limit),
            None => Vec::new(),
        })
    }

    async fn get_by_source(
        &self,
        source: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>> {
        let guard = self.log.read().await;
        let (log, indexes) = &*guard;
        Ok(match indexes.by_source.get(source) {
            Some(indices) => Self::collect(log, indices, since, limit),
            None => Vec::new(),
        })
    }
}

//─────────────────────────────
//  Buffered front-end
//─────────────────────────────

struct BufferedInner {
    backend: Arc<dyn EventStoreBackend>,
    buffer: Mutex<VecDeque<Event>>,
    // Guarantees at most one flush in flight.
    flush_gate: Mutex<()>,
    config: StoreConfig,
    bus: Option<EventBus>,
    closed: AtomicBool,
}

/// Batching write-path in front of an [`EventStoreBackend`].
///
/// Writes are buffered up to `batch_size` events or `flush_interval_ms`
/// and then committed atomically. A failed commit re-queues the batch at the
/// head of the buffer and is retried on the next flush, so no event is ever
/// silently dropped. Reads flush first for read-your-writes consistency.
pub struct BufferedEventStore {
    inner: Arc<BufferedInner>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedEventStore {
    /// Create the store and start its interval flusher.
    ///
    /// When a bus is supplied, flush failures are surfaced as
    /// `persistence:error` events in addition to being retried.
    pub fn new(
        backend: Arc<dyn EventStoreBackend>,
        config: StoreConfig,
        bus: Option<EventBus>,
    ) -> Self {
        let inner = Arc::new(BufferedInner {
            backend,
            buffer: Mutex::new(VecDeque::new()),
            flush_gate: Mutex::new(()),
            config,
            bus,
            closed: AtomicBool::new(false),
        });
        let flusher_inner = Arc::clone(&inner);
        let flusher = tokio::spawn(async move {
            let period = std::time::Duration::from_millis(flusher_inner.config.flush_interval_ms);
            let mut ticker = tokio::time::interval(period.max(std::time::Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if flusher_inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(error) = Self::flush_inner(&flusher_inner).await {
                    debug!(%error, "interval flush failed; batch re-queued");
                }
            }
        });
        Self {
            inner,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    /// Append one event to the write buffer.
    ///
    /// Triggers an immediate flush when the buffer reaches the configured
    /// batch size; that flush failing is not an append failure: the batch
    /// stays buffered and is retried.
    pub async fn append(&self, event: Event) -> Result<(), StoreError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let should_flush = {
            let mut buffer = self.inner.buffer.lock().await;
            buffer.push_back(event);
            buffer.len() >= self.inner.config.batch_size
        };
        if should_flush {
            if let Err(error) = Self::flush_inner(&self.inner).await {
                debug!(%error, "size-triggered flush failed; batch re-queued");
            }
        }
        Ok(())
    }

    /// Commit everything currently buffered.
    pub async fn flush(&self) -> Result<(), StoreError> {
        Self::flush_inner(&self.inner).await
    }

    async fn flush_inner(inner: &Arc<BufferedInner>) -> Result<(), StoreError> {
        let _gate = inner.flush_gate.lock().await;
        let batch: Vec<Event> = {
            let mut buffer = inner.buffer.lock().await;
            buffer.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(());
        }
        match inner.backend.commit(&batch).await {
            Ok(()) => {
                debug!(count = batch.len(), "flushed event batch");
                Ok(())
            }
            Err(error) => {
                let message = error.to_string();
                warn!(%message, count = batch.len(), "event batch commit failed; re-queueing");
                {
                    let mut buffer = inner.buffer.lock().await;
                    for event in batch.into_iter().rev() {
                        buffer.push_front(event);
                    }
                }
                if let Some(bus) = &inner.bus {
                    let _ = bus
                        .publish(
                            PERSISTENCE_ERROR_EVENT,
                            json!({ "component": "event-store", "error": message }),
                            PublishOptions::from_source("event-store"),
                        )
                        .await;
                }
                Err(StoreError::FlushFailed(message))
            }
        }
    }

    /// Number of events waiting in the buffer.
    pub async fn buffered(&self) -> usize {
        self.inner.buffer.lock().await.len()
    }

    /// Stop the interval flusher and perform a final flush.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.flusher.lock().await.take() {
            handle.abort();
        }
        Self::flush_inner(&self.inner).await
    }

    //───────────── reads ─────────────

    /// Every event in a correlation chain, ascending by timestamp.
    pub async fn get_stream(&self, correlation_id: Uuid) -> Result<Vec<Event>, StoreError> {
        self.flush().await?;
        self.inner
            .backend
            .get_stream(correlation_id)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    /// All events after the given timestamp.
    pub async fn get_all(
        &self,
        after: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, StoreError> {
        self.flush().await?;
        self.inner
            .backend
            .get_all(after, limit)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    /// Events of one type.
    pub async fn get_by_type(
        &self,
        event_type: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, StoreError> {
        self.flush().await?;
        self.inner
            .backend
            .get_by_type(event_type, since, limit)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    /// Events from one source.
    pub async fn get_by_source(
        &self,
        source: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, StoreError> {
        self.flush().await?;
        self.inner
            .backend
            .get_by_source(source, since, limit)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))
    }
}
