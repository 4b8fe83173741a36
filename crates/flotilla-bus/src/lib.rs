#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **flotilla-bus** – In-process event bus for Flotilla.
//!
//! The bus provides durable-feeling pub/sub without any I/O: pattern
//! subscriptions (exact, `*`-glob, regex), async middleware that can veto a
//! publication, a bounded history ring with drop-oldest eviction,
//! correlation-chain queries, and a `wait_for` primitive for tests and
//! coordination code.
//!
//! Delivery contract: all matching subscribers of one publish run
//! concurrently and `publish` resolves only when every handler has settled.
//! A failing handler never aborts delivery to the others; the failure is
//! surfaced as a `handler:error` event. For a single subscriber, events
//! arrive in publish order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use flotilla_types::{BusConfig, Event, EventMetadata, EventPriority};

mod pattern;

pub use pattern::SubscriptionPattern;

/// Boxed future returned by event handlers.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A subscriber callback. Handlers receive their own clone of the event.
pub type EventHandler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// A delivery-time predicate attached to a subscription.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Event type used to surface handler failures.
pub const HANDLER_ERROR_EVENT: &str = "handler:error";

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// `wait_for` gave up before a matching event arrived.
    #[error("timed out after {timeout_ms} ms waiting for pattern `{pattern}`")]
    WaitTimeout {
        /// The pattern that was awaited.
        pattern: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },
    /// The awaited subscription was dropped before a match arrived.
    #[error("subscription dropped while waiting for pattern `{pattern}`")]
    WaitAborted {
        /// The pattern that was awaited.
        pattern: String,
    },
    /// The event could not be constructed.
    #[error(transparent)]
    InvalidEvent(#[from] flotilla_types::ValidationError),
}

//─────────────────────────────
//  Middleware
//─────────────────────────────

/// Middleware hooked around every publish.
///
/// `before_publish` returning `false` cancels the publication: the event is
/// still returned to the caller but is neither delivered nor recorded in
/// history.
#[async_trait::async_trait]
pub trait BusMiddleware: Send + Sync {
    /// Stable name, used for removal.
    fn name(&self) -> &str;

    /// Inspect (and possibly veto) an event before delivery.
    async fn before_publish(&self, event: &Event) -> bool {
        let _ = event;
        true
    }

    /// Observe an event after delivery has settled.
    async fn after_publish(&self, event: &Event) {
        let _ = event;
    }
}

//─────────────────────────────
//  Subscriptions
//─────────────────────────────

struct Subscription {
    id: Uuid,
    pattern: SubscriptionPattern,
    handler: EventHandler,
    filter: Option<EventFilter>,
    once: bool,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

/// Options accepted by [`EventBus::subscribe_with`].
#[derive(Default)]
pub struct SubscribeOptions {
    /// Delivery-time predicate; non-matching events are skipped silently.
    pub filter: Option<EventFilter>,
    /// Remove the subscription after its first delivery.
    pub once: bool,
}

//─────────────────────────────
//  Publish options
//─────────────────────────────

/// Options accepted by [`EventBus::publish`].
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Producing agent or component; defaults to `bus`.
    pub source: Option<String>,
    /// Optional addressee.
    pub target: Option<String>,
    /// Correlation to inherit; a fresh id is assigned when absent.
    pub correlation_id: Option<Uuid>,
    /// Event that caused this one.
    pub causation_id: Option<Uuid>,
    /// Delivery priority.
    pub priority: Option<EventPriority>,
    /// Time-to-live in milliseconds.
    pub ttl_ms: Option<u64>,
}

impl PublishOptions {
    /// Options with only a source set.
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::default()
        }
    }

    /// Inherit a correlation chain.
    pub fn correlated(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Record the causing event.
    pub fn caused_by(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Set the delivery priority.
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = Some(priority);
        self
    }
}

//─────────────────────────────
//  History query
//─────────────────────────────

/// Filters applied by [`EventBus::query_history`].
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    /// Exact event type.
    pub event_type: Option<String>,
    /// Producing source.
    pub source: Option<String>,
    /// Addressee.
    pub target: Option<String>,
    /// Inclusive lower timestamp bound.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper timestamp bound.
    pub until: Option<DateTime<Utc>>,
    /// Correlation chain.
    pub correlation_id: Option<Uuid>,
    /// Keep only the most recent `limit` matches (still ascending).
    pub limit: Option<usize>,
}

//─────────────────────────────
//  The bus
//─────────────────────────────

struct BusInner {
    subscriptions: DashMap<Uuid, Subscription>,
    history: StdRwLock<VecDeque<Event>>,
    middleware: StdRwLock<Vec<Arc<dyn BusMiddleware>>>,
    tap: broadcast::Sender<Event>,
    max_history: usize,
    last_timestamp_ms: StdMutex<i64>,
}

/// Cloneable handle to an in-process event bus.
///
/// Clones share state; components hold their own handle the way the
/// orchestration layers share a kernel bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    /// Create a bus with the given history capacity.
    pub fn new(config: BusConfig) -> Self {
        let (tap, _rx) = broadcast::channel(config.max_history_size.max(16));
        Self {
            inner: Arc::new(BusInner {
                subscriptions: DashMap::new(),
                history: StdRwLock::new(VecDeque::with_capacity(config.max_history_size)),
                middleware: StdRwLock::new(Vec::new()),
                tap,
                max_history: config.max_history_size,
                last_timestamp_ms: StdMutex::new(0),
            }),
        }
    }

    //───────────── publish ─────────────

    /// Publish an event.
    ///
    /// Assigns the id, a monotonic timestamp, and a correlation id (fresh
    /// unless inherited via `opts`). Middleware runs first; if any
    /// `before_publish` returns `false` the event is returned without being
    /// delivered or recorded. Delivery fans out to all matching subscribers
    /// concurrently and resolves when every handler has settled.
    pub async fn publish(
        &self,
        event_type: &str,
        payload: Value,
        opts: PublishOptions,
    ) -> Result<Event, BusError> {
        let source = opts.source.unwrap_or_else(|| "bus".to_string());
        let mut event = Event::new(event_type, source, payload)?;
        event.target = opts.target;
        event.timestamp = self.monotonic_now();
        event.metadata = EventMetadata {
            correlation_id: opts.correlation_id.unwrap_or_else(Uuid::new_v4),
            causation_id: opts.causation_id,
            version: 1,
            priority: opts.priority.unwrap_or_default(),
            ttl_ms: opts.ttl_ms,
        };

        let middleware: Vec<Arc<dyn BusMiddleware>> = {
            let guard = self
                .inner
                .middleware
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.clone()
        };
        for mw in &middleware {
            if !mw.before_publish(&event).await {
                debug!(event_type = %event.event_type, middleware = mw.name(), "publication cancelled");
                return Ok(event);
            }
        }

        self.record(&event);
        let failures = self.deliver(&event).await;
        for (subscription_id, error) in failures {
            self.emit_handler_error(&event, subscription_id, &error).await;
        }

        for mw in &middleware {
            mw.after_publish(&event).await;
        }
        Ok(event)
    }

    fn monotonic_now(&self) -> DateTime<Utc> {
        let now_ms = Utc::now().timestamp_millis();
        let mut last = self
            .inner
            .last_timestamp_ms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let assigned = if now_ms > *last { now_ms } else { *last + 1 };
        *last = assigned;
        Utc.timestamp_millis_opt(assigned)
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn record(&self, event: &Event) {
        let mut history = self
            .inner
            .history
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if history.len() >= self.inner.max_history {
            history.pop_front();
        }
        history.push_back(event.clone());
        drop(history);
        let _ = self.inner.tap.send(event.clone());
    }

    async fn deliver(&self, event: &Event) -> Vec<(Uuid, String)> {
        let mut claimed: Vec<(Uuid, EventHandler)> = Vec::new();
        let mut once_ids: Vec<Uuid> = Vec::new();
        for entry in self.inner.subscriptions.iter() {
            let sub = entry.value();
            if !sub.pattern.matches(&event.event_type) {
                continue;
            }
            if let Some(filter) = &sub.filter {
                if !filter(event) {
                    continue;
                }
            }
            if sub.once {
                once_ids.push(sub.id);
            } else {
                claimed.push((sub.id, Arc::clone(&sub.handler)));
            }
        }
        // Claim once-subscriptions by removal so they fire exactly once even
        // when two publishes race.
        for id in once_ids {
            if let Some((_, sub)) = self.inner.subscriptions.remove(&id) {
                claimed.push((id, sub.handler));
            }
        }

        let handler_runs = claimed.into_iter().map(|(id, handler)| {
            let event = event.clone();
            async move { (id, handler(event).await) }
        });
        join_all(handler_runs)
            .await
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e.to_string())))
            .collect()
    }

    async fn emit_handler_error(&self, failed_event: &Event, subscription_id: Uuid, error: &str) {
        warn!(
            subscription = %subscription_id,
            event_type = %failed_event.event_type,
            error,
            "event handler failed"
        );
        if failed_event.event_type == HANDLER_ERROR_EVENT {
            // A failing handler *of* handler:error is only logged.
            return;
        }
        let payload = json!({
            "subscriptionId": subscription_id,
            "eventId": failed_event.id,
            "eventType": failed_event.event_type,
            "error": error,
        });
        let Ok(mut event) = Event::new(HANDLER_ERROR_EVENT, "event-bus", payload) else {
            return;
        };
        event.timestamp = self.monotonic_now();
        event.metadata.correlation_id = failed_event.metadata.correlation_id;
        event.metadata.causation_id = Some(failed_event.id);
        self.record(&event);
        // Failures here are logged by deliver's caller path ending; ignore.
        let _ = self.deliver(&event).await;
    }

    //───────────── subscribe ─────────────

    /// Subscribe a handler to a pattern. Returns the subscription id.
    pub fn subscribe<P, F, Fut>(&self, pattern: P, handler: F) -> Uuid
    where
        P: Into<SubscriptionPattern>,
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe_with(pattern, handler, SubscribeOptions::default())
    }

    /// Subscribe with a filter and/or once semantics.
    pub fn subscribe_with<P, F, Fut>(
        &self,
        pattern: P,
        handler: F,
        options: SubscribeOptions,
    ) -> Uuid
    where
        P: Into<SubscriptionPattern>,
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let handler: EventHandler =
            Arc::new(move |event| -> HandlerFuture { Box::pin(handler(event)) });
        self.inner.subscriptions.insert(
            id,
            Subscription {
                id,
                pattern: pattern.into(),
                handler,
                filter: options.filter,
                once: options.once,
                created_at: Utc::now(),
            },
        );
        id
    }

    /// Subscribe to exactly one delivery of an exact event type.
    pub fn subscribe_once<F, Fut>(&self, event_type: &str, handler: F) -> Uuid
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe_with(
            SubscriptionPattern::Exact(event_type.to_string()),
            handler,
            SubscribeOptions {
                filter: None,
                once: true,
            },
        )
    }

    /// Remove a subscription. Idempotent: returns `false` when the id is
    /// unknown and never delivers further events afterwards.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        self.inner.subscriptions.remove(&id).is_some()
    }

    /// Remove every subscription registered under the given raw pattern.
    /// Returns how many were removed.
    pub fn unsubscribe_pattern(&self, pattern: &str) -> usize {
        let ids: Vec<Uuid> = self
            .inner
            .subscriptions
            .iter()
            .filter(|entry| entry.value().pattern.raw() == pattern)
            .map(|entry| entry.value().id)
            .collect();
        let mut removed = 0;
        for id in ids {
            if self.inner.subscriptions.remove(&id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Live stream of every recorded event, in publish order.
    ///
    /// Subscribers that fall behind may miss events when the broadcast
    /// buffer overflows; pattern subscriptions remain the lossless path.
    pub fn tap(&self) -> broadcast::Receiver<Event> {
        self.inner.tap.subscribe()
    }

    //───────────── wait_for ─────────────

    /// Resolve on the first event matching `pattern` (and `filter`, if
    /// given); reject after `timeout_ms` when provided.
    pub async fn wait_for(
        &self,
        pattern: &str,
        timeout_ms: Option<u64>,
        filter: Option<EventFilter>,
    ) -> Result<Event, BusError> {
        let (tx, rx) = oneshot::channel::<Event>();
        let slot = Arc::new(StdMutex::new(Some(tx)));
        let handler_slot = Arc::clone(&slot);
        let id = self.subscribe_with(
            SubscriptionPattern::parse(pattern),
            move |event| {
                let slot = Arc::clone(&handler_slot);
                async move {
                    if let Some(tx) = slot.lock().unwrap_or_else(|p| p.into_inner()).take() {
                        let _ = tx.send(event);
                    }
                    Ok(())
                }
            },
            SubscribeOptions { filter, once: true },
        );

        match timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(std::time::Duration::from_millis(ms), rx).await {
                    Ok(Ok(event)) => Ok(event),
                    Ok(Err(_)) => Err(BusError::WaitAborted {
                        pattern: pattern.to_string(),
                    }),
                    Err(_) => {
                        self.unsubscribe(id);
                        Err(BusError::WaitTimeout {
                            pattern: pattern.to_string(),
                            timeout_ms: ms,
                        })
                    }
                }
            }
            None => rx.await.map_err(|_| BusError::WaitAborted {
                pattern: pattern.to_string(),
            }),
        }
    }

    //───────────── history ─────────────

    /// Query the bounded history ring. Matches are returned in ascending
    /// publish order; `limit` keeps only the most recent matches.
    pub fn query_history(&self, query: &HistoryQuery) -> Vec<Event> {
        let history = self
            .inner
            .history
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut matches: Vec<Event> = history
            .iter()
            .filter(|event| {
                query
                    .event_type
                    .as_ref()
                    .map_or(true, |t| &event.event_type == t)
                    && query.source.as_ref().map_or(true, |s| &event.source == s)
                    && query
                        .target
                        .as_ref()
                        .map_or(true, |t| event.target.as_ref() == Some(t))
                    && query.since.map_or(true, |since| event.timestamp >= since)
                    && query.until.map_or(true, |until| event.timestamp <= until)
                    && query
                        .correlation_id
                        .map_or(true, |c| event.metadata.correlation_id == c)
            })
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            if matches.len() > limit {
                matches.drain(..matches.len() - limit);
            }
        }
        matches
    }

    /// All events in a correlation chain, ascending by timestamp.
    pub fn correlation_chain(&self, correlation_id: Uuid) -> Vec<Event> {
        let mut chain = self.query_history(&HistoryQuery {
            correlation_id: Some(correlation_id),
            ..HistoryQuery::default()
        });
        chain.sort_by_key(|event| event.timestamp);
        chain
    }

    /// Current number of events retained in history.
    pub fn history_len(&self) -> usize {
        self.inner
            .history
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    //───────────── middleware ─────────────

    /// Install middleware; runs in installation order.
    pub fn use_middleware(&self, middleware: Arc<dyn BusMiddleware>) {
        self.inner
            .middleware
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(middleware);
    }

    /// Remove middleware by name. Returns whether anything was removed.
    pub fn unuse_middleware(&self, name: &str) -> bool {
        let mut guard = self
            .inner
            .middleware
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = guard.len();
        guard.retain(|mw| mw.name() != name);
        guard.len() != before
    }
}
