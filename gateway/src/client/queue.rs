//! Bounded outbound frame queue
//!
//! One per client. Producers (the hub loop, the client's own reader for
//! replies) push serialized frames without ever blocking; the writer pump is
//! the single consumer and parks on a [`Notify`] when the queue is empty.
//!
//! A full queue is never waited on. The caller gets [`PushError::Full`] back
//! and decides what to do (the hub evicts the client).

use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

/// Why a frame was not enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// Queue is at capacity
    Full,
    /// Queue was closed; the client is going away
    Closed,
}

/// Lock-free bounded MPSC queue of outbound frames
#[derive(Debug)]
pub struct OutboundQueue {
    frames: ArrayQueue<Bytes>,
    ready: Notify,
    closed: AtomicBool,
    pushed: AtomicU64,
    rejected: AtomicU64,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` frames
    ///
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: ArrayQueue::new(capacity.max(1)),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            pushed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Enqueue a frame without blocking
    pub fn try_push(&self, frame: Bytes) -> Result<(), PushError> {
        if self.is_closed() {
            return Err(PushError::Closed);
        }
        match self.frames.push(frame) {
            Ok(()) => {
                self.pushed.fetch_add(1, Ordering::Relaxed);
                // notify_one stores a permit if the writer isn't parked yet
                self.ready.notify_one();
                Ok(())
            }
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(PushError::Full)
            }
        }
    }

    /// Dequeue the oldest frame
    pub fn pop(&self) -> Option<Bytes> {
        self.frames.pop()
    }

    /// Move up to `max` frames into `out`, oldest first
    ///
    /// Returns the number of frames moved.
    pub fn drain_into(&self, out: &mut Vec<Bytes>, max: usize) -> usize {
        let mut moved = 0;
        while moved < max {
            match self.frames.pop() {
                Some(frame) => {
                    out.push(frame);
                    moved += 1;
                }
                None => break,
            }
        }
        moved
    }

    /// Wait until a frame is pushed or the queue is closed
    ///
    /// Returns immediately if a push happened since the last wait.
    pub async fn ready(&self) {
        self.ready.notified().await;
    }

    /// Close the queue and wake the consumer
    ///
    /// Returns `true` for the call that actually closed it.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.ready.notify_one();
        }
        first
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Frames currently queued
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frames are queued
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Whether the queue is at capacity
    pub fn is_full(&self) -> bool {
        self.frames.is_full()
    }

    /// Maximum frames
    pub fn capacity(&self) -> usize {
        self.frames.capacity()
    }

    /// Frames accepted so far
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Pushes refused because the queue was full
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn frame(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn fifo_order() {
        let q = OutboundQueue::new(4);
        q.try_push(frame("a")).unwrap();
        q.try_push(frame("b")).unwrap();
        q.try_push(frame("c")).unwrap();

        let mut out = Vec::new();
        assert_eq!(q.drain_into(&mut out, 2), 2);
        assert_eq!(out, vec![frame("a"), frame("b")]);
        assert_eq!(q.pop(), Some(frame("c")));
        assert!(q.is_empty());
    }

    #[test]
    fn full_queue_refuses_without_blocking() {
        let q = OutboundQueue::new(2);
        q.try_push(frame("a")).unwrap();
        q.try_push(frame("b")).unwrap();
        assert!(q.is_full());
        assert_eq!(q.try_push(frame("c")), Err(PushError::Full));
        assert_eq!(q.rejected(), 1);
        assert_eq!(q.pushed(), 2);
    }

    #[test]
    fn closed_queue_refuses() {
        let q = OutboundQueue::new(2);
        assert!(q.close());
        assert!(!q.close());
        assert_eq!(q.try_push(frame("a")), Err(PushError::Closed));
    }

    #[tokio::test]
    async fn push_before_wait_is_not_lost() {
        let q = OutboundQueue::new(2);
        q.try_push(frame("a")).unwrap();
        tokio::time::timeout(Duration::from_millis(100), q.ready())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn close_wakes_consumer() {
        let q = Arc::new(OutboundQueue::new(2));
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                q.ready().await;
                q.is_closed()
            })
        };
        tokio::task::yield_now().await;
        q.close();
        assert!(waiter.await.unwrap());
    }
}
