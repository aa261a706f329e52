//! Multi-scope admission control.
//!
//! Each request draws one token from every implicated scope bucket
//! (global, per-guild, per-user). Buckets refill lazily on access; the
//! admission controller commits consumption all-or-nothing so a request
//! never half-charges a shared bucket.

mod admission;
mod bucket;

use std::fmt;
use std::time::Duration;

pub use admission::{AdmissionController, BucketStatus};
pub use bucket::TokenBucket;

/// A rate-limiting dimension. Every request draws from `Global`; guild and
/// user scopes apply when the caller supplies those identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeKey {
    Global,
    Guild(String),
    User(String),
}

impl ScopeKey {
    /// Stable string form used as the bucket map key.
    pub fn as_key(&self) -> String {
        match self {
            ScopeKey::Global => "global".to_string(),
            ScopeKey::Guild(id) => format!("guild:{}", id),
            ScopeKey::User(id) => format!("user:{}", id),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

/// Parse Retry-After header value (seconds).
/// Returns duration to wait, or None if header is missing/invalid.
pub fn parse_retry_after(header_value: Option<&str>) -> Option<Duration> {
    let value = header_value?;
    value
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs.min(60)))
}

/// Exponential backoff delay for a given attempt, capped at `max`, with
/// uniform random jitter in `[0, jitter)` added on top.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration, jitter: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    let delay = base.saturating_mul(factor).min(max);
    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        delay
    } else {
        delay + Duration::from_millis(fastrand::u64(0..jitter_ms))
    }
}
