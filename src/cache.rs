//! Response cache keyed by request fingerprints.
//!
//! Bounded-lifetime, in-memory TTL map. Expired entries are treated as
//! absent and evicted lazily on lookup or insert; there is no periodic
//! sweep.

use std::collections::HashMap;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::upstream::AgentReply;

/// Upper bound on the normalized content considered for the cache key.
/// Longer prompts that share a 500-char prefix will collide; acceptable
/// since hits only short-circuit idempotent calls.
pub const FINGERPRINT_MAX_CHARS: usize = 500;

struct CacheEntry {
    value: AgentReply,
    expires_at: Instant,
}

/// Maps a request fingerprint to a prior successful result for a bounded
/// time. Written only on successful completion; read by all call paths.
#[derive(Default)]
pub struct ResponseCache {
    entries: HashMap<String, CacheEntry>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a fresh entry. An expired entry is removed and reported
    /// absent.
    pub fn get(&mut self, key: &str) -> Option<AgentReply> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert a result, evicting whatever has expired by now.
    pub fn put(&mut self, key: String, value: AgentReply, ttl: Duration) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires_at > now);
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Derive a cache key from the semantic content of a request.
///
/// Whitespace runs are collapsed so trivially reformatted prompts collide,
/// the result is bounded at [`FINGERPRINT_MAX_CHARS`] characters, and the
/// bounded form is hashed so keys stay fixed-size.
pub fn fingerprint(content: &str) -> String {
    let normalized: String = content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(FINGERPRINT_MAX_CHARS)
        .collect();
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn reply(content: &str) -> AgentReply {
        AgentReply {
            content: content.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_roundtrip_within_ttl() {
        let mut cache = ResponseCache::new();
        cache.put("k".into(), reply("v"), Duration::from_secs(60));

        advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get("k").map(|r| r.content), Some("v".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_absent_and_evicted() {
        let mut cache = ResponseCache::new();
        cache.put("k".into(), reply("v"), Duration::from_secs(60));

        advance(Duration::from_secs(61)).await;
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_evicts_expired_entries() {
        let mut cache = ResponseCache::new();
        cache.put("old".into(), reply("a"), Duration::from_secs(10));
        advance(Duration::from_secs(11)).await;

        cache.put("new".into(), reply("b"), Duration::from_secs(10));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_fingerprint_normalizes_whitespace() {
        assert_eq!(
            fingerprint("hello   world"),
            fingerprint("hello\n\tworld ")
        );
        assert_ne!(fingerprint("hello world"), fingerprint("hello worlds"));
    }

    #[test]
    fn test_fingerprint_is_length_bounded() {
        let prefix = "x".repeat(FINGERPRINT_MAX_CHARS);
        let a = format!("{} tail one", prefix);
        let b = format!("{} tail two", prefix);
        // Beyond the bound the content no longer distinguishes keys
        assert_eq!(fingerprint(&a), fingerprint(&b));
        // Fixed-size hex digest
        assert_eq!(fingerprint(&a).len(), 64);
    }
}
