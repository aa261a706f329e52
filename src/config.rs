//! Gateway configuration.
//!
//! Everything has a usable default; a TOML file and a handful of
//! environment variables (secrets, endpoint) override it. Built once at
//! startup and handed to the gateway instance; no globals.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Token bucket parameters for one scope class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeLimit {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl Default for ScopeLimit {
    fn default() -> Self {
        Self {
            capacity: 5.0,
            refill_per_sec: 0.1,
        }
    }
}

/// Per-class rate limits. Buckets are created from these lazily, one per
/// observed scope key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub global: ScopeLimit,
    pub guild: ScopeLimit,
    pub user: ScopeLimit,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            global: ScopeLimit {
                capacity: 60.0,
                refill_per_sec: 1.0,
            },
            guild: ScopeLimit {
                capacity: 15.0,
                refill_per_sec: 0.25,
            },
            user: ScopeLimit {
                capacity: 5.0,
                refill_per_sec: 0.1,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum waiting requests before enqueue is rejected outright.
    pub max_len: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_len: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 300 }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub attempt_timeout_secs: u64,
    /// Attempts per call when the caller doesn't specify a budget.
    pub default_attempt_budget: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_ms: 250,
            attempt_timeout_secs: 60,
            default_attempt_budget: 3,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: Duration::from_millis(self.jitter_ms),
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs),
        }
    }
}

/// Identity and agent the provisioner ensures upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Fixed identifier of the service account.
    pub user_id: String,
    pub user_name: String,
    /// Fixed slug the agent is resolved and created under.
    pub agent_slug: String,
    pub agent_name: String,
    pub model: String,
    pub system_message: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_id: "gateway-service-user".to_string(),
            user_name: "Gateway Service User".to_string(),
            agent_slug: "gateway-assistant".to_string(),
            agent_name: "Gateway Assistant".to_string(),
            model: "claude-3-7-sonnet-latest".to_string(),
            system_message: "You are a helpful assistant.".to_string(),
        }
    }
}

/// Transport settings for the upstream API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_version: String,
    /// Organization secret; normally supplied via `LLMGATE_ORG_SECRET`.
    #[serde(skip_serializing)]
    pub org_secret: String,
    /// Acting user id sent on authenticated requests. Matches the session
    /// service account.
    pub user_id: String,
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.sensay.io".to_string(),
            api_version: "2025-03-25".to_string(),
            org_secret: String::new(),
            user_id: "gateway-service-user".to_string(),
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub limits: LimitsConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub session: SessionConfig,
    pub upstream: UpstreamConfig,
}

impl GatewayConfig {
    /// Load from a TOML file (when given), apply environment overrides,
    /// and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config: Self = match path {
            Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables override file values: secrets never belong in
    /// config files.
    pub fn apply_env(&mut self) {
        if let Ok(secret) = std::env::var("LLMGATE_ORG_SECRET") {
            self.upstream.org_secret = secret;
        }
        if let Ok(url) = std::env::var("LLMGATE_BASE_URL") {
            self.upstream.base_url = url;
        }
        if let Ok(id) = std::env::var("LLMGATE_USER_ID") {
            self.upstream.user_id = id.clone();
            self.session.user_id = id;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, limit) in [
            ("global", &self.limits.global),
            ("guild", &self.limits.guild),
            ("user", &self.limits.user),
        ] {
            if limit.capacity < 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} capacity must be at least 1",
                    name
                )));
            }
            if limit.refill_per_sec <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} refill rate must be positive",
                    name
                )));
            }
        }
        if self.queue.max_len == 0 {
            return Err(ConfigError::Invalid(
                "queue max_len must be at least 1".to_string(),
            ));
        }
        if !self.upstream.base_url.starts_with("http") {
            return Err(ConfigError::Invalid(format!(
                "upstream base_url \"{}\" is not an HTTP endpoint",
                self.upstream.base_url
            )));
        }
        Ok(())
    }
}
