//! Failure taxonomy and call outcome types.
//!
//! Every upstream failure is classified exactly once, at the transport
//! boundary, into an [`ErrorKind`]. Retry and provisioning logic branch on
//! that data instead of re-parsing messages further up the stack.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::upstream::{AgentReply, UpstreamError};

/// Classification of a call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid or expired credentials (HTTP 401). Never retried.
    Unauthorized,
    /// Credentials lack permission for the operation (HTTP 403). Never retried.
    Forbidden,
    /// The request itself is malformed (HTTP 400/422). Never retried.
    Malformed,
    /// Referenced resource does not exist (HTTP 404). Never retried.
    NotFound,
    /// Naming/idempotency race (HTTP 409). Resolved by re-resolution during
    /// provisioning, surfaced only if resolution fails.
    Conflict,
    /// Upstream throttled the request (HTTP 429). Retried with backoff.
    RateLimited,
    /// Upstream server-side failure (HTTP 5xx). Retried with backoff.
    Server,
    /// Attempt deadline elapsed. Retried with backoff.
    Timeout,
    /// Connection-level failure. Retried with backoff.
    Network,
    /// The request queue was full; the request was rejected without queueing.
    CapacityExceeded,
    Unknown,
}

impl ErrorKind {
    /// Retried with backoff up to the attempt budget.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::Server | ErrorKind::Timeout | ErrorKind::Network
        )
    }

    /// Surfaced immediately, never retried.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::Unauthorized
                | ErrorKind::Forbidden
                | ErrorKind::Malformed
                | ErrorKind::NotFound
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Malformed => "malformed",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Server => "server",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified call failure, carried in the [`CallResult`].
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct CallError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CallError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<UpstreamError> for CallError {
    fn from(e: UpstreamError) -> Self {
        Self {
            kind: e.kind,
            message: e.message,
        }
    }
}

/// Outcome of one gateway call, with observability metadata.
///
/// Immutable once produced. `queue_wait_ms` is 0 for requests admitted
/// without queueing; `attempt_count` is 0 when no upstream attempt ran
/// (cache hits, queue rejection, provisioning failure).
#[derive(Debug, Clone)]
pub struct CallResult {
    pub outcome: Result<AgentReply, CallError>,
    pub from_cache: bool,
    pub queue_wait_ms: u64,
    pub attempt_count: u32,
}

impl CallResult {
    pub fn cached(reply: AgentReply) -> Self {
        Self {
            outcome: Ok(reply),
            from_cache: true,
            queue_wait_ms: 0,
            attempt_count: 0,
        }
    }

    pub fn failure(error: CallError, queue_wait_ms: u64, attempt_count: u32) -> Self {
        Self {
            outcome: Err(error),
            from_cache: false,
            queue_wait_ms,
            attempt_count,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Error kind, if this result is a failure.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.outcome.as_ref().err().map(|e| e.kind)
    }
}
