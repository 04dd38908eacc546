//! Prometheus metrics for hearth
//!
//! Metrics are process-global and opt-in: until [`Metrics::init`] runs,
//! [`Metrics::get`] returns `None` and every recording site is skipped.

use crate::error::{GatewayError, Result};
use crate::resilience::CircuitState;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, TextEncoder, register_counter,
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram,
};
use std::sync::OnceLock;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// All hearth metrics
pub struct Metrics {
    // ─────────────────────────────────────────────────────────────────────────
    // Connections
    // ─────────────────────────────────────────────────────────────────────────
    /// Currently registered clients
    pub clients_connected: Gauge,

    /// Registrations accepted
    pub connections_total: Counter,

    /// Registrations refused (capacity or auth)
    pub connections_rejected: CounterVec,

    /// Clients removed by the hub (by reason)
    pub clients_evicted: CounterVec,

    /// Topics with at least one member
    pub topics: Gauge,

    // ─────────────────────────────────────────────────────────────────────────
    // Frames
    // ─────────────────────────────────────────────────────────────────────────
    /// Frames enqueued to clients
    pub messages_sent: Counter,

    /// Bytes enqueued to clients
    pub bytes_sent: Counter,

    /// Frames read from clients
    pub messages_received: Counter,

    /// Control messages handled (by type)
    pub control_messages: CounterVec,

    // ─────────────────────────────────────────────────────────────────────────
    // Forwarding
    // ─────────────────────────────────────────────────────────────────────────
    /// Client deliveries of domain events (by event type)
    pub events_forwarded: CounterVec,

    /// Events not delivered (by reason)
    pub events_dropped: CounterVec,

    /// Batches flushed
    pub batches_flushed: Counter,

    /// Events per flushed batch
    pub batch_size: Histogram,

    /// Circuit breaker state per breaker (0=closed, 1=open, 2=half-open)
    pub circuit_breaker_state: GaugeVec,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    ///
    /// Subsequent calls return the existing instance.
    pub fn init() -> Result<&'static Metrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            clients_connected: register_gauge!(
                "hearth_clients_connected",
                "Currently connected clients"
            )
            .map_err(|e| GatewayError::Metrics(format!("clients_connected: {e}")))?,

            connections_total: register_counter!(
                "hearth_connections_total",
                "Total client registrations accepted"
            )
            .map_err(|e| GatewayError::Metrics(format!("connections_total: {e}")))?,

            connections_rejected: register_counter_vec!(
                "hearth_connections_rejected_total",
                "Client connections refused",
                &["reason"]
            )
            .map_err(|e| GatewayError::Metrics(format!("connections_rejected: {e}")))?,

            clients_evicted: register_counter_vec!(
                "hearth_clients_evicted_total",
                "Clients removed by the hub",
                &["reason"]
            )
            .map_err(|e| GatewayError::Metrics(format!("clients_evicted: {e}")))?,

            topics: register_gauge!("hearth_topics", "Topics with at least one subscriber")
                .map_err(|e| GatewayError::Metrics(format!("topics: {e}")))?,

            messages_sent: register_counter!(
                "hearth_messages_sent_total",
                "Frames enqueued to clients"
            )
            .map_err(|e| GatewayError::Metrics(format!("messages_sent: {e}")))?,

            bytes_sent: register_counter!("hearth_bytes_sent_total", "Bytes enqueued to clients")
                .map_err(|e| GatewayError::Metrics(format!("bytes_sent: {e}")))?,

            messages_received: register_counter!(
                "hearth_messages_received_total",
                "Frames read from clients"
            )
            .map_err(|e| GatewayError::Metrics(format!("messages_received: {e}")))?,

            control_messages: register_counter_vec!(
                "hearth_control_messages_total",
                "Inbound control messages handled",
                &["type"]
            )
            .map_err(|e| GatewayError::Metrics(format!("control_messages: {e}")))?,

            events_forwarded: register_counter_vec!(
                "hearth_events_forwarded_total",
                "Domain event deliveries to clients",
                &["type"]
            )
            .map_err(|e| GatewayError::Metrics(format!("events_forwarded: {e}")))?,

            events_dropped: register_counter_vec!(
                "hearth_events_dropped_total",
                "Domain events not delivered",
                &["reason"]
            )
            .map_err(|e| GatewayError::Metrics(format!("events_dropped: {e}")))?,

            batches_flushed: register_counter!(
                "hearth_batches_flushed_total",
                "Event batches flushed"
            )
            .map_err(|e| GatewayError::Metrics(format!("batches_flushed: {e}")))?,

            batch_size: register_histogram!(
                "hearth_batch_size",
                "Events per flushed batch",
                vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0]
            )
            .map_err(|e| GatewayError::Metrics(format!("batch_size: {e}")))?,

            circuit_breaker_state: register_gauge_vec!(
                "hearth_circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half-open)",
                &["breaker"]
            )
            .map_err(|e| GatewayError::Metrics(format!("circuit_breaker_state: {e}")))?,
        };

        // Only the first set wins if two threads race here
        let _ = METRICS.set(metrics);

        METRICS
            .get()
            .ok_or_else(|| GatewayError::Metrics("failed to initialize metrics".to_string()))
    }

    /// Get the global metrics instance
    ///
    /// Returns None if metrics haven't been initialized yet.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    /// Record an accepted registration
    pub fn record_connected(&self, total: usize) {
        self.connections_total.inc();
        self.clients_connected.set(total as f64);
    }

    /// Record a refused connection
    pub fn record_rejected(&self, reason: &str) {
        self.connections_rejected.with_label_values(&[reason]).inc();
    }

    /// Record a hub eviction or unregistration
    pub fn record_evicted(&self, reason: &str, remaining: usize) {
        self.clients_evicted.with_label_values(&[reason]).inc();
        self.clients_connected.set(remaining as f64);
    }

    /// Update registry gauges
    pub fn set_registry_size(&self, clients: usize, topics: usize) {
        self.clients_connected.set(clients as f64);
        self.topics.set(topics as f64);
    }

    /// Record `count` frames of `bytes` each enqueued
    pub fn record_sent(&self, count: u64, bytes: usize) {
        self.messages_sent.inc_by(count as f64);
        self.bytes_sent.inc_by((count as f64) * bytes as f64);
    }

    /// Record a frame read from a client
    pub fn record_received(&self) {
        self.messages_received.inc();
    }

    /// Record a handled control message
    pub fn record_control(&self, message_type: &str) {
        self.control_messages
            .with_label_values(&[message_type])
            .inc();
    }

    /// Record client deliveries of one event
    pub fn record_forwarded(&self, event_type: &str, deliveries: u64) {
        self.events_forwarded
            .with_label_values(&[event_type])
            .inc_by(deliveries as f64);
    }

    /// Record events dropped
    pub fn record_dropped(&self, reason: &str, count: u64) {
        self.events_dropped
            .with_label_values(&[reason])
            .inc_by(count as f64);
    }

    /// Record a batch flush
    pub fn record_batch(&self, size: usize) {
        self.batches_flushed.inc();
        self.batch_size.observe(size as f64);
    }

    /// Update circuit breaker state
    pub fn set_circuit_state(&self, breaker: &str, state: CircuitState) {
        self.circuit_breaker_state
            .with_label_values(&[breaker])
            .set(state.as_metric_value());
    }
}

/// Gather all metrics and encode as Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let first = Metrics::init().map(|m| m as *const Metrics);
        let second = Metrics::init().map(|m| m as *const Metrics);
        if let (Ok(a), Ok(b)) = (first, second) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn recorded_values_show_up_in_gather() {
        let _ = Metrics::init();
        if let Some(metrics) = Metrics::get() {
            metrics.record_forwarded("state_changed", 3);
            metrics.record_dropped("rate_limited", 1);
            metrics.set_circuit_state("events", CircuitState::Open);

            let text = gather();
            assert!(text.contains("hearth_events_forwarded_total"));
            assert!(text.contains("hearth_events_dropped_total"));
            assert!(text.contains("hearth_circuit_breaker_state"));
        }
    }
}
