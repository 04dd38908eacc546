//! Time-windowed event batches, one slot per event type
//!
//! A slot's mutex is held for the whole flush, so a size-triggered flush and
//! a timer-triggered flush of the same type can never overlap or reorder.

use hearth_core::{Event, EventType};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// What the caller must do after a push
#[derive(Debug)]
pub(crate) enum Push {
    /// First event of a window; arm a timer for this generation
    Armed(u64),
    /// Appended to a window whose timer is already armed
    Queued,
    /// Batch reached its size limit; deliver these now
    Full(Vec<Event>),
}

/// Pending events for one event type
#[derive(Debug, Default)]
pub(crate) struct Slot {
    pending: Vec<Event>,
    /// Bumped whenever the window is taken, so a stale timer finds nothing
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Slot {
    pub(crate) fn push(&mut self, event: Event, max_batch_size: usize) -> Push {
        self.pending.push(event);
        if self.pending.len() >= max_batch_size.max(1) {
            return Push::Full(self.take_all());
        }
        if self.pending.len() == 1 {
            self.generation += 1;
            return Push::Armed(self.generation);
        }
        Push::Queued
    }

    pub(crate) fn set_timer(&mut self, timer: JoinHandle<()>) {
        self.timer = Some(timer);
    }

    /// Events of the window armed as `generation`, if still pending
    ///
    /// Called by that window's own timer, which is therefore not aborted.
    pub(crate) fn take_expired(&mut self, generation: u64) -> Option<Vec<Event>> {
        if generation != self.generation || self.pending.is_empty() {
            return None;
        }
        self.timer = None;
        self.generation += 1;
        Some(std::mem::take(&mut self.pending))
    }

    /// Everything pending, disarming the timer
    pub(crate) fn take_all(&mut self) -> Vec<Event> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// One slot per [`EventType`]
#[derive(Debug)]
pub(crate) struct Batches {
    slots: [Arc<Mutex<Slot>>; EventType::ALL.len()],
}

impl Default for Batches {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| Arc::new(Mutex::new(Slot::default()))),
        }
    }
}

impl Batches {
    pub(crate) fn slot(&self, event_type: EventType) -> Arc<Mutex<Slot>> {
        Arc::clone(&self.slots[event_type as usize])
    }

    /// Events waiting in every slot
    pub(crate) async fn pending(&self) -> usize {
        let mut total = 0;
        for slot in &self.slots {
            total += slot.lock().await.len();
        }
        total
    }
}
