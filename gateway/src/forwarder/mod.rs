//! EventForwarder - policy layer between domain events and the hub
//!
//! ```text
//! forward(event)
//!   ├─ type disabled?        → drop ("disabled")
//!   ├─ no token in bucket?   → drop ("rate_limited")
//!   ├─ batching on?          → slot[event type] ─► timer / size flush ─┐
//!   └─ otherwise ──────────────────────────────────────────────────────┤
//!                                                                      ▼
//!        circuit breaker ─► hub.broadcast_matching(frame, client.wants(event))
//! ```
//!
//! Rate limiting is global to the forwarder; slow individual clients are the
//! hub's concern. Batches preserve arrival order within an event type.

mod batch;
mod stats;

pub use stats::{ForwardingErrorRecord, ForwardingStats};

use crate::client::Client;
use crate::error::{ForwardError, HubError};
use crate::hub::{ClientFilter, DeliveryReport, HubHandle};
use crate::metrics::Metrics;
use crate::rate_limit::TokenBucket;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, RetryPolicy};
use batch::{Batches, Push};
use hearth_core::{Data, Event, EventType};
use parking_lot::RwLock;
use serde_json::Value;
use stats::StatsRecorder;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Name of the breaker guarding hub delivery
pub const DELIVERY_BREAKER: &str = "event_delivery";

/// Forwarder settings
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Token refill rate; 0 disables rate limiting
    pub max_events_per_second: u64,
    /// Token bucket capacity
    pub event_burst: u64,
    /// Accumulate events per type before delivery
    pub batch_events: bool,
    /// How long a batch waits for more events
    pub batch_window: Duration,
    /// A batch this large is flushed immediately
    pub max_batch_size: usize,
    /// Event types enabled at construction
    pub default_event_types: Vec<EventType>,
    /// Size of the recent-error ring
    pub max_errors_retained: usize,
    /// Breaker around hub delivery
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry schedule for timer-driven flushes
    pub retry: RetryPolicy,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_events_per_second: 50,
            event_burst: 50,
            batch_events: true,
            batch_window: Duration::from_millis(100),
            max_batch_size: 100,
            default_event_types: vec![EventType::StateChanged, EventType::SyncStatus],
            max_errors_retained: 100,
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ForwarderConfig {
    /// Token bucket refill rate and capacity (rate 0 = unlimited)
    pub fn rate_limit(mut self, per_second: u64, burst: u64) -> Self {
        self.max_events_per_second = per_second;
        self.event_burst = burst;
        self
    }

    /// Enable batching
    pub fn batching(mut self, window: Duration, max_batch_size: usize) -> Self {
        self.batch_events = true;
        self.batch_window = window;
        self.max_batch_size = max_batch_size;
        self
    }

    /// Deliver every event immediately
    pub fn without_batching(mut self) -> Self {
        self.batch_events = false;
        self
    }

    /// Event types enabled at construction
    pub fn event_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.default_event_types = types.into_iter().collect();
        self
    }
}

/// What [`EventForwarder::forward`] did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Event type is globally disabled
    Disabled,
    /// No token available; the event was dropped
    RateLimited,
    /// Held in a batch awaiting its window
    Batched,
    /// Delivered now (alone, or as the flush of a full batch)
    Delivered(DeliveryReport),
}

/// Cloneable handle to the forwarding pipeline
#[derive(Clone)]
pub struct EventForwarder {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventForwarder")
            .field("running", &self.is_running())
            .field("enabled", &self.enabled_event_types())
            .finish()
    }
}

struct Inner {
    hub: HubHandle,
    config: ForwarderConfig,
    enabled: RwLock<HashSet<EventType>>,
    /// entity id → room id
    rooms: RwLock<HashMap<String, String>>,
    limiter: Option<TokenBucket>,
    breaker: CircuitBreaker,
    batches: Batches,
    stats: StatsRecorder,
    running: AtomicBool,
}

impl EventForwarder {
    /// Create a stopped forwarder in front of `hub`
    pub fn new(hub: HubHandle, config: ForwarderConfig) -> Self {
        let limiter = (config.max_events_per_second > 0)
            .then(|| TokenBucket::new(config.max_events_per_second, config.event_burst));
        let breaker = CircuitBreaker::new(DELIVERY_BREAKER, config.circuit_breaker.clone());

        Self {
            inner: Arc::new(Inner {
                hub,
                enabled: RwLock::new(config.default_event_types.iter().copied().collect()),
                rooms: RwLock::new(HashMap::new()),
                limiter,
                breaker,
                batches: Batches::default(),
                stats: StatsRecorder::new(config.max_errors_retained),
                running: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Begin accepting batched events
    ///
    /// Refill is lazy and timers are armed per batch, so nothing is spawned
    /// here. Until started, every event is delivered immediately.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let config = &self.inner.config;
        info!(
            max_events_per_second = config.max_events_per_second,
            batch_events = config.batch_events,
            batch_window_ms = config.batch_window.as_millis() as u64,
            max_batch_size = config.max_batch_size,
            enabled = ?self.enabled_event_types(),
            "Event forwarder started"
        );
    }

    /// Stop batching and flush whatever is pending
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        let mut flushed = 0;
        for event_type in EventType::ALL {
            let cell = self.inner.batches.slot(event_type);
            let mut slot = cell.lock().await;
            let events = slot.take_all();
            if events.is_empty() {
                continue;
            }
            flushed += events.len();
            // Failures are already recorded in the stats
            let _ = self.inner.flush(events, true).await;
        }
        info!(flushed, "Event forwarder stopped");
    }

    /// Whether [`start`](Self::start) has run without a later stop
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Filter, rate limit, batch or deliver one event
    ///
    /// Dropped events are not errors. An error means delivery was attempted
    /// and failed; [`ForwardError::Unavailable`] carries the time until the
    /// delivery circuit admits a trial call again.
    pub async fn forward(&self, event: Event) -> Result<ForwardOutcome, ForwardError> {
        let inner = &self.inner;
        let event_type = event.event_type;

        if !self.is_event_type_enabled(event_type) {
            inner.record_drop("disabled");
            debug!(event_type = %event_type, "Event type disabled, dropping");
            return Ok(ForwardOutcome::Disabled);
        }

        if let Some(limiter) = &inner.limiter {
            if !limiter.try_acquire() {
                inner.record_drop("rate_limited");
                debug!(event_type = %event_type, "Event rate limit exceeded, dropping");
                return Ok(ForwardOutcome::RateLimited);
            }
        }

        inner.stats.record_accepted(event_type);

        if inner.config.batch_events && self.is_running() {
            return self.batch(event).await;
        }

        match inner.deliver(&event).await {
            Ok(report) => Ok(ForwardOutcome::Delivered(report)),
            Err(e) => {
                inner.record_failure(event_type, &e, 1);
                Err(e)
            }
        }
    }

    async fn batch(&self, event: Event) -> Result<ForwardOutcome, ForwardError> {
        let event_type = event.event_type;
        let cell = self.inner.batches.slot(event_type);
        let mut slot = cell.lock().await;

        match slot.push(event, self.inner.config.max_batch_size) {
            Push::Armed(generation) => {
                slot.set_timer(Inner::arm_timer(&self.inner, event_type, generation));
                Ok(ForwardOutcome::Batched)
            }
            Push::Queued => Ok(ForwardOutcome::Batched),
            // Slot stays locked through delivery so a later window can't overtake
            Push::Full(events) => {
                let report = self.inner.flush(events, false).await?;
                Ok(ForwardOutcome::Delivered(report))
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Typed ingestion
    // ─────────────────────────────────────────────────────────────────────────

    /// An entity changed state
    pub async fn forward_state_changed(
        &self,
        entity_id: &str,
        old_state: Value,
        new_state: Value,
        attributes: Data,
    ) -> Result<ForwardOutcome, ForwardError> {
        let mut payload = Data::new();
        payload.insert("entity_id".into(), Value::from(entity_id));
        payload.insert("old_state".into(), old_state);
        payload.insert("new_state".into(), new_state);
        payload.insert("attributes".into(), Value::Object(attributes));
        self.forward(Event::new(EventType::StateChanged, payload).with_entity(entity_id))
            .await
    }

    /// An entity appeared upstream
    pub async fn forward_entity_added(
        &self,
        entity_id: &str,
        entity: Value,
    ) -> Result<ForwardOutcome, ForwardError> {
        let mut payload = Data::new();
        payload.insert("entity_id".into(), Value::from(entity_id));
        payload.insert("entity".into(), entity);
        self.forward(Event::new(EventType::EntityAdded, payload).with_entity(entity_id))
            .await
    }

    /// An entity was removed upstream
    pub async fn forward_entity_removed(
        &self,
        entity_id: &str,
    ) -> Result<ForwardOutcome, ForwardError> {
        let mut payload = Data::new();
        payload.insert("entity_id".into(), Value::from(entity_id));
        self.forward(Event::new(EventType::EntityRemoved, payload).with_entity(entity_id))
            .await
    }

    /// An area (room) changed; room filters apply to `area_id`
    pub async fn forward_area_updated(
        &self,
        area_id: &str,
        area: Value,
    ) -> Result<ForwardOutcome, ForwardError> {
        let mut payload = Data::new();
        payload.insert("area_id".into(), Value::from(area_id));
        payload.insert("area".into(), area);
        self.forward(Event::new(EventType::AreaUpdated, payload).with_room(area_id))
            .await
    }

    /// Upstream synchronisation progress
    pub async fn forward_sync_status(
        &self,
        status: &str,
        message: &str,
        entity_count: usize,
    ) -> Result<ForwardOutcome, ForwardError> {
        let mut payload = Data::new();
        payload.insert("status".into(), Value::from(status));
        payload.insert("message".into(), Value::from(message));
        payload.insert("entity_count".into(), Value::from(entity_count));
        self.forward(Event::new(EventType::SyncStatus, payload)).await
    }

    /// A service was invoked upstream
    pub async fn forward_service_called(
        &self,
        service: &str,
        service_data: Data,
        entity_id: Option<&str>,
    ) -> Result<ForwardOutcome, ForwardError> {
        let mut payload = Data::new();
        payload.insert("service".into(), Value::from(service));
        payload.insert("service_data".into(), Value::Object(service_data));
        let mut event = Event::new(EventType::ServiceCalled, payload);
        if let Some(entity_id) = entity_id {
            event = event.with_entity(entity_id);
        }
        self.forward(event).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Filtering and administration
    // ─────────────────────────────────────────────────────────────────────────

    /// Per-recipient filter with the event's room resolved from the entity map
    pub fn should_forward_to_client(&self, client: &Client, event: &Event) -> bool {
        client.wants(&self.inner.resolve(event))
    }

    /// Globally enable or disable an event type
    pub fn set_event_type_enabled(&self, event_type: EventType, enabled: bool) {
        let changed = {
            let mut set = self.inner.enabled.write();
            if enabled {
                set.insert(event_type)
            } else {
                set.remove(&event_type)
            }
        };
        if changed {
            info!(event_type = %event_type, enabled, "Event type toggled");
        }
    }

    /// Whether `event_type` is globally enabled
    pub fn is_event_type_enabled(&self, event_type: EventType) -> bool {
        self.inner.enabled.read().contains(&event_type)
    }

    /// Enabled event types, sorted
    pub fn enabled_event_types(&self) -> Vec<EventType> {
        let mut types: Vec<EventType> = self.inner.enabled.read().iter().copied().collect();
        types.sort();
        types
    }

    /// Replace the entity → room mapping
    pub fn update_room_filters(&self, mapping: HashMap<String, String>) {
        let entities = mapping.len();
        *self.inner.rooms.write() = mapping;
        info!(entities, "Room mapping updated");
    }

    /// Room an entity is mapped to
    pub fn room_for(&self, entity_id: &str) -> Option<String> {
        self.inner.rooms.read().get(entity_id).cloned()
    }

    /// Events waiting in batches
    pub async fn pending_events(&self) -> usize {
        self.inner.batches.pending().await
    }

    /// Delivery breaker, for inspection
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// Counters plus current hub and filter state
    pub fn stats(&self) -> ForwardingStats {
        let mut stats = self.inner.stats.snapshot();
        stats.connected_clients = self.inner.hub.client_count();
        stats.subscribed_clients = self.inner.hub.subscribed_client_count();
        stats.enabled_event_types = self.enabled_event_types();
        stats.circuit_state = self.inner.breaker.current_state().as_str();
        stats
    }
}

impl Inner {
    fn arm_timer(this: &Arc<Self>, event_type: EventType, generation: u64) -> JoinHandle<()> {
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.batch_window).await;
            inner.flush_expired(event_type, generation).await;
        })
    }

    async fn flush_expired(&self, event_type: EventType, generation: u64) {
        let cell = self.batches.slot(event_type);
        let mut slot = cell.lock().await;
        let Some(events) = slot.take_expired(generation) else {
            return;
        };
        // Nobody to report to; failures land in the stats
        let _ = self.flush(events, true).await;
    }

    /// Deliver a batch in arrival order
    ///
    /// The first failure drops the rest of the batch. Timer and shutdown
    /// flushes pass `retry` to go through the retry policy.
    async fn flush(&self, events: Vec<Event>, retry: bool) -> Result<DeliveryReport, ForwardError> {
        let size = events.len();
        self.stats.record_batch(size);
        if let Some(metrics) = Metrics::get() {
            metrics.record_batch(size);
        }

        let mut total = DeliveryReport::default();
        for (index, event) in events.iter().enumerate() {
            let result = if retry {
                self.config
                    .retry
                    .execute("batch_flush", || self.deliver(event))
                    .await
            } else {
                self.deliver(event).await
            };
            match result {
                Ok(report) => {
                    total.delivered += report.delivered;
                    total.evicted += report.evicted;
                }
                Err(e) => {
                    self.record_failure(event.event_type, &e, size - index);
                    return Err(e);
                }
            }
        }

        debug!(size, delivered = total.delivered, "Batch flushed");
        Ok(total)
    }

    /// One event through the breaker to every matching client
    async fn deliver(&self, event: &Event) -> Result<DeliveryReport, ForwardError> {
        let resolved = self.resolve(event);
        let frame = resolved
            .to_envelope()
            .to_bytes()
            .map_err(|e| HubError::Serialization(e.to_string()))?;
        let filter: ClientFilter = Arc::new(move |client: &Client| client.wants(&resolved));

        let hub = &self.hub;
        let report = self
            .breaker
            .call(|| hub.broadcast_matching(frame, filter))
            .await?;

        self.stats.record_delivered(report.delivered);
        if let Some(metrics) = Metrics::get() {
            metrics.record_forwarded(event.event_type.as_str(), report.delivered as u64);
        }
        Ok(report)
    }

    /// Copy of `event` with its room filled from the entity map
    ///
    /// An explicit room wins; an unmapped entity stays room-less and so
    /// passes every room filter.
    fn resolve(&self, event: &Event) -> Event {
        let mut resolved = event.clone();
        if resolved.room().is_none() {
            let mapped = event
                .entity()
                .and_then(|entity| self.rooms.read().get(entity).cloned());
            if mapped.is_some() {
                resolved.room_id = mapped;
            }
        }
        resolved
    }

    fn record_drop(&self, reason: &str) {
        self.stats.record_dropped(1);
        if let Some(metrics) = Metrics::get() {
            metrics.record_dropped(reason, 1);
        }
    }

    fn record_failure(&self, event_type: EventType, error: &ForwardError, lost: usize) {
        warn!(event_type = %event_type, lost, error = %error, "Event delivery failed");
        self.stats.record_dropped(lost);
        self.stats.record_error(event_type, error.to_string());
        if let Some(metrics) = Metrics::get() {
            metrics.record_dropped("delivery_failed", lost as u64);
        }
    }
}
