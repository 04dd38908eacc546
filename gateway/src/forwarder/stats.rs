//! Forwarding counters and the recent-error ring

use chrono::{DateTime, Utc};
use hearth_core::EventType;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// One failed delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardingErrorRecord {
    /// When it failed
    pub at: DateTime<Utc>,
    /// Type of the event that was lost
    pub event_type: EventType,
    /// Rendered error
    pub error: String,
}

/// Snapshot returned by [`EventForwarder::stats`](super::EventForwarder::stats)
#[derive(Debug, Clone, Serialize)]
pub struct ForwardingStats {
    /// Client deliveries (one event to three clients counts three)
    pub events_forwarded: u64,
    /// Events discarded: disabled type, rate limited or failed delivery
    pub events_dropped: u64,
    /// Events accepted for delivery, by type
    pub events_by_type: BTreeMap<EventType, u64>,
    /// Events that went through a batch
    pub batched_events: u64,
    /// Batches flushed
    pub batches_processed: u64,
    /// Last event accepted
    pub last_event_time: Option<DateTime<Utc>>,
    /// Clients registered with the hub
    pub connected_clients: usize,
    /// Clients with at least one event type enabled
    pub subscribed_clients: usize,
    /// Globally enabled event types
    pub enabled_event_types: Vec<EventType>,
    /// Delivery circuit state
    pub circuit_state: &'static str,
    /// Most recent failures, oldest first
    pub recent_errors: Vec<ForwardingErrorRecord>,
}

#[derive(Debug)]
pub(crate) struct StatsRecorder {
    forwarded: AtomicU64,
    dropped: AtomicU64,
    batched: AtomicU64,
    batches: AtomicU64,
    by_type: Mutex<BTreeMap<EventType, u64>>,
    last_event: Mutex<Option<DateTime<Utc>>>,
    errors: Mutex<VecDeque<ForwardingErrorRecord>>,
    max_errors: usize,
}

impl StatsRecorder {
    pub(crate) fn new(max_errors: usize) -> Self {
        Self {
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            batched: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            by_type: Mutex::new(BTreeMap::new()),
            last_event: Mutex::new(None),
            errors: Mutex::new(VecDeque::with_capacity(max_errors.min(1024))),
            max_errors,
        }
    }

    pub(crate) fn record_accepted(&self, event_type: EventType) {
        *self.by_type.lock().entry(event_type).or_insert(0) += 1;
        *self.last_event.lock() = Some(Utc::now());
    }

    pub(crate) fn record_delivered(&self, deliveries: usize) {
        self.forwarded
            .fetch_add(deliveries as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, count: usize) {
        self.dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_batch(&self, size: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.batched.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self, event_type: EventType, error: String) {
        if self.max_errors == 0 {
            return;
        }
        let mut errors = self.errors.lock();
        while errors.len() >= self.max_errors {
            errors.pop_front();
        }
        errors.push_back(ForwardingErrorRecord {
            at: Utc::now(),
            event_type,
            error,
        });
    }

    /// Counter part of the snapshot; the caller fills in hub and config state
    pub(crate) fn snapshot(&self) -> ForwardingStats {
        ForwardingStats {
            events_forwarded: self.forwarded.load(Ordering::Relaxed),
            events_dropped: self.dropped.load(Ordering::Relaxed),
            events_by_type: self.by_type.lock().clone(),
            batched_events: self.batched.load(Ordering::Relaxed),
            batches_processed: self.batches.load(Ordering::Relaxed),
            last_event_time: *self.last_event.lock(),
            connected_clients: 0,
            subscribed_clients: 0,
            enabled_event_types: Vec::new(),
            circuit_state: "closed",
            recent_errors: self.errors.lock().iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_ring_keeps_the_newest() {
        let stats = StatsRecorder::new(2);
        stats.record_error(EventType::StateChanged, "one".into());
        stats.record_error(EventType::StateChanged, "two".into());
        stats.record_error(EventType::SyncStatus, "three".into());

        let errors = stats.snapshot().recent_errors;
        let messages: Vec<&str> = errors.iter().map(|e| e.error.as_str()).collect();
        assert_eq!(messages, vec!["two", "three"]);
    }

    #[test]
    fn zero_retention_keeps_nothing() {
        let stats = StatsRecorder::new(0);
        stats.record_error(EventType::StateChanged, "lost".into());
        assert!(stats.snapshot().recent_errors.is_empty());
    }

    #[test]
    fn counters_accumulate() {
        let stats = StatsRecorder::new(10);
        stats.record_accepted(EventType::StateChanged);
        stats.record_accepted(EventType::StateChanged);
        stats.record_delivered(3);
        stats.record_batch(2);
        stats.record_dropped(1);

        let snap = stats.snapshot();
        assert_eq!(snap.events_by_type[&EventType::StateChanged], 2);
        assert_eq!(snap.events_forwarded, 3);
        assert_eq!(snap.batches_processed, 1);
        assert_eq!(snap.batched_events, 2);
        assert_eq!(snap.events_dropped, 1);
        assert!(snap.last_event_time.is_some());
    }
}
