//! Upstream transport seam.
//!
//! The gateway never talks HTTP directly; it goes through [`UpstreamClient`],
//! which reports every failure pre-classified into an
//! [`ErrorKind`](crate::error::ErrorKind). Retry and provisioning logic
//! depend on that classification, not on status codes or message text.

mod http;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorKind;

pub use http::HttpUpstream;

/// Result type for upstream operations.
pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// A classified upstream failure.
///
/// `retry_after` carries the server's `Retry-After` hint when one was
/// present; the retry executor honors it when it exceeds the computed
/// backoff delay.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct UpstreamError {
    pub kind: ErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl UpstreamError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Classify an HTTP status code. This is the single place where status
    /// codes become error kinds.
    pub fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        let kind = match status {
            400 | 422 => ErrorKind::Malformed,
            401 => ErrorKind::Unauthorized,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Unknown,
        };
        Self {
            kind,
            message: format!("HTTP {}: {}", status, message),
            retry_after,
        }
    }

    pub fn timeout(deadline: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("attempt exceeded {}ms deadline", deadline.as_millis()),
        )
    }
}

/// A provisioned upstream account record.
#[derive(Debug, Clone, Deserialize)]
pub struct UserRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// An agent (replica) owned by the service account.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentRecord {
    pub uuid: Uuid,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Payload for creating a new agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub name: String,
    pub slug: String,
    #[serde(rename = "ownerID")]
    pub owner_id: String,
    pub llm: AgentLlmSpec,
}

/// Model configuration carried in the agent creation payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentLlmSpec {
    pub model: String,
    pub system_message: String,
}

/// A successful chat response.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentReply {
    pub content: String,
}

/// Operations the gateway requires from the upstream service.
///
/// Implementations must classify every failure (success / conflict /
/// rate-limited / unauthorized / server-error) via [`UpstreamError`];
/// retry and provisioning logic depend on it. All operations must be
/// safe to call concurrently.
#[async_trait]
pub trait UpstreamClient: Send + Sync + 'static {
    /// Look up an account by its fixed identifier. `Ok(None)` means the
    /// account does not exist (as opposed to a lookup failure).
    async fn get_user(&self, id: &str) -> UpstreamResult<Option<UserRecord>>;

    /// Create an account. A conflict means it already exists, which callers
    /// treat as success (idempotent ensure).
    async fn create_user(&self, id: &str, name: &str) -> UpstreamResult<UserRecord>;

    /// List agents owned by the authenticated account.
    async fn list_agents(&self) -> UpstreamResult<Vec<AgentRecord>>;

    /// Create a new agent. A conflict means the slug is already taken.
    async fn create_agent(&self, spec: &AgentSpec) -> UpstreamResult<AgentRecord>;

    /// Invoke the agent with one message and return its reply.
    async fn chat(&self, agent: Uuid, content: &str) -> UpstreamResult<AgentReply>;
}
