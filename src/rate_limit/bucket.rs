//! Lazily refilled token bucket.
//!
//! No background tasks: tokens accumulate as a function of elapsed time,
//! computed on each access. Uses `tokio::time::Instant` so paused-clock
//! tests see exact refill arithmetic.

use std::time::Duration;

use tokio::time::Instant;

/// A token bucket bounding call rate for one scope.
///
/// Invariant: `0 <= tokens <= capacity` after every operation.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket, starting full.
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: refill_per_sec.max(0.0),
            last_refill: Instant::now(),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Credit tokens for elapsed time since the last refill.
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Refill, then consume `n` tokens if available. No side effect when
    /// insufficient.
    pub fn try_consume(&mut self, n: f64) -> bool {
        self.refill();
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Refill and report whether `n` tokens are available, without consuming.
    pub fn has(&mut self, n: f64) -> bool {
        self.refill();
        self.tokens >= n
    }

    /// Consume `n` tokens that a prior `has()` check confirmed. Saturates at
    /// zero rather than going negative.
    pub fn consume(&mut self, n: f64) {
        self.tokens = (self.tokens - n).max(0.0);
    }

    /// Current token count and time until one full token is available,
    /// without mutating state.
    pub fn peek(&self) -> (f64, Duration) {
        let projected = self.projected();
        (projected, self.eta_for(1.0, projected))
    }

    /// Time until `n` tokens will be available.
    pub fn eta_until(&self, n: f64) -> Duration {
        self.eta_for(n, self.projected())
    }

    /// Token count as of now, computed without writing.
    fn projected(&self) -> f64 {
        let elapsed = Instant::now().duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_per_sec).min(self.capacity)
    }

    fn eta_for(&self, n: f64, available: f64) -> Duration {
        if available >= n {
            return Duration::ZERO;
        }
        if self.refill_per_sec <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64((n - available) / self.refill_per_sec)
    }
}
