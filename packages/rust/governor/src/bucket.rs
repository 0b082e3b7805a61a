//! Token bucket with continuous refill.

use std::time::{Duration, Instant};

/// Tolerance for float drift when a waiter sleeps exactly the reported wait.
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
pub(crate) struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
    last_used: Instant,
}

impl TokenBucket {
    /// A full bucket refilling at `rate` tokens per second.
    pub(crate) fn new(rate: f64, burst: u32, now: Instant) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            tokens: capacity,
            capacity,
            rate,
            last_refill: now,
            last_used: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available.
    pub(crate) fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        self.last_used = now;
        if self.tokens + EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            Ok(())
        } else {
            Err(self.wait_for_one())
        }
    }

    /// Time until a token is available, without taking it.
    pub(crate) fn peek_wait(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens + EPSILON >= 1.0 {
            Duration::ZERO
        } else {
            self.wait_for_one()
        }
    }

    /// Return a token taken by [`try_take`](Self::try_take).
    pub(crate) fn refund(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }

    pub(crate) fn last_used(&self) -> Instant {
        self.last_used
    }

    fn wait_for_one(&self) -> Duration {
        let secs = ((1.0 - self.tokens) / self.rate).max(0.0);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}
