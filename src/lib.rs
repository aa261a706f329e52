//! Rate-limited gateway for session-oriented upstream AI services.
//!
//! Sits between application callers and an upstream AI API that requires a
//! provisioned session (user account plus agent) before any chat call.
//! Every submission passes through the same pipeline: response cache,
//! multi-scope token bucket admission, a bounded FIFO queue when capacity
//! is exhausted, and a retrying executor that classifies upstream failures
//! as transient or fatal.
//!
//! Construct a [`Gateway`] with a [`GatewayConfig`] and an
//! [`UpstreamClient`] implementation (normally
//! [`HttpUpstream`](upstream::HttpUpstream)), then call
//! [`Gateway::chat`] or [`Gateway::submit`].

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod session;
pub mod upstream;

pub use config::GatewayConfig;
pub use error::{CallError, CallResult, ErrorKind};
pub use gateway::{CallOptions, CallWork, Gateway, GatewayStatus};
pub use retry::RetryPolicy;
pub use session::{SessionHandle, SessionPhase};
pub use upstream::{AgentReply, UpstreamClient, UpstreamError};
