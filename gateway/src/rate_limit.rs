//! Lock-free token bucket
//!
//! Used globally by the [`EventForwarder`](crate::forwarder::EventForwarder)
//! to cap event admission, and per client to cap inbound control messages.
//! Refill is lazy: tokens are topped up from elapsed time on each admission
//! check, never by a background task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Fixed-point scale: 1000 units = 1 token
const SCALE: u64 = 1000;

/// Lock-free token bucket
///
/// Allows `rate` operations per second with a burst capacity of `burst`.
/// Token count lives in `[0, burst]` at all times.
pub struct TokenBucket {
    /// Max tokens (scaled)
    capacity: u64,
    /// Nanoseconds per whole token
    refill_nanos: u64,
    /// Current token count (scaled)
    tokens: AtomicU64,
    /// Last refill timestamp (nanos since `start`)
    last_refill: AtomicU64,
    start: Instant,
    /// Admissions refused
    rejected: AtomicU64,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

impl TokenBucket {
    /// Create a full bucket
    ///
    /// * `rate` - tokens per second (0 = never refills)
    /// * `burst` - capacity; 0 admits nothing
    pub fn new(rate: u64, burst: u64) -> Self {
        let refill_nanos = if rate == 0 {
            u64::MAX
        } else {
            (1_000_000_000 / rate).max(1)
        };
        let capacity = burst.saturating_mul(SCALE);

        Self {
            capacity,
            refill_nanos,
            tokens: AtomicU64::new(capacity),
            last_refill: AtomicU64::new(0),
            start: Instant::now(),
            rejected: AtomicU64::new(0),
        }
    }

    /// Take one token if available
    pub fn try_acquire(&self) -> bool {
        self.refill();

        loop {
            let current = self.tokens.load(Ordering::Acquire);
            if current < SCALE {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            if self
                .tokens
                .compare_exchange_weak(current, current - SCALE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Tokens currently available, after a lazy refill
    pub fn available(&self) -> f64 {
        self.refill();
        self.tokens.load(Ordering::Acquire) as f64 / SCALE as f64
    }

    /// Maximum tokens
    pub fn capacity(&self) -> f64 {
        self.capacity as f64 / SCALE as f64
    }

    /// Admissions refused so far
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Add whole tokens for every elapsed refill interval
    ///
    /// Only the thread that wins the `last_refill` CAS adds tokens for a
    /// given span, so concurrent callers never double-count.
    fn refill(&self) {
        let now_nanos = self.start.elapsed().as_nanos() as u64;

        loop {
            let last = self.last_refill.load(Ordering::Acquire);
            let elapsed = now_nanos.saturating_sub(last);
            if elapsed < self.refill_nanos {
                return;
            }

            let intervals = elapsed / self.refill_nanos;
            let new_last = last + intervals * self.refill_nanos;

            if self
                .last_refill
                .compare_exchange_weak(last, new_last, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            let to_add = intervals.saturating_mul(SCALE);
            let _ = self
                .tokens
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    let next = current.saturating_add(to_add).min(self.capacity);
                    (next != current).then_some(next)
                });
            return;
        }
    }
}
