//! Composes per-scope token buckets into a single admit/deny decision.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use super::{ScopeKey, TokenBucket};
use crate::config::LimitsConfig;

/// Snapshot of one bucket, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct BucketStatus {
    pub scope: String,
    pub capacity: f64,
    pub remaining: f64,
    pub reset_eta_ms: u64,
}

/// Owns every bucket for the life of the process. Buckets are created
/// lazily the first time a scope key is seen, from the per-class limits.
///
/// Not internally synchronized: the gateway serializes access through one
/// lock so a check-then-commit cannot interleave with another admission
/// check on the same scopes.
pub struct AdmissionController {
    limits: LimitsConfig,
    buckets: HashMap<String, TokenBucket>,
}

impl AdmissionController {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            limits,
            buckets: HashMap::new(),
        }
    }

    fn bucket_mut(&mut self, scope: &ScopeKey) -> &mut TokenBucket {
        let limit = match scope {
            ScopeKey::Global => &self.limits.global,
            ScopeKey::Guild(_) => &self.limits.guild,
            ScopeKey::User(_) => &self.limits.user,
        };
        self.buckets
            .entry(scope.as_key())
            .or_insert_with(|| TokenBucket::new(limit.capacity, limit.refill_per_sec))
    }

    /// Admit a request drawing one token from every given scope.
    ///
    /// All-or-nothing: if any bucket lacks a token, no bucket is
    /// decremented and the request must be queued.
    pub fn admit(&mut self, scopes: &[ScopeKey]) -> bool {
        for scope in scopes {
            if !self.bucket_mut(scope).has(1.0) {
                return false;
            }
        }
        for scope in scopes {
            self.bucket_mut(scope).consume(1.0);
        }
        true
    }

    /// Time until every given scope will have a token available.
    pub fn next_ready_eta(&mut self, scopes: &[ScopeKey]) -> Duration {
        scopes
            .iter()
            .map(|scope| self.bucket_mut(scope).eta_until(1.0))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Per-scope status for the global bucket plus any requested guild/user
    /// scopes. Read-only: never consumes tokens or creates buckets.
    pub fn status(&self, guild_id: Option<&str>, user_id: Option<&str>) -> Vec<BucketStatus> {
        let mut scopes = vec![ScopeKey::Global];
        if let Some(id) = guild_id {
            scopes.push(ScopeKey::Guild(id.to_string()));
        }
        if let Some(id) = user_id {
            scopes.push(ScopeKey::User(id.to_string()));
        }

        scopes
            .into_iter()
            .map(|scope| {
                let limit = match &scope {
                    ScopeKey::Global => &self.limits.global,
                    ScopeKey::Guild(_) => &self.limits.guild,
                    ScopeKey::User(_) => &self.limits.user,
                };
                match self.buckets.get(&scope.as_key()) {
                    Some(bucket) => {
                        let (remaining, eta) = bucket.peek();
                        BucketStatus {
                            scope: scope.as_key(),
                            capacity: bucket.capacity(),
                            remaining,
                            reset_eta_ms: eta.as_millis().min(u128::from(u64::MAX)) as u64,
                        }
                    }
                    // Never touched: report a full bucket.
                    None => BucketStatus {
                        scope: scope.as_key(),
                        capacity: limit.capacity,
                        remaining: limit.capacity,
                        reset_eta_ms: 0,
                    },
                }
            })
            .collect()
    }
}
