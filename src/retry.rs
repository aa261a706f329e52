//! Retry execution with exponential backoff.
//!
//! Runs after the session is ready. Failures are classified data
//! ([`ErrorKind`](crate::error::ErrorKind)), so the loop branches on the
//! kind: fatal errors surface immediately, transient ones back off and
//! retry until the attempt budget runs out.

use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::CallError;
use crate::gateway::CallWork;
use crate::rate_limit::backoff_delay;
use crate::session::SessionHandle;
use crate::upstream::{AgentReply, UpstreamError};

/// Backoff and deadline policy for upstream attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
    /// Deadline applied to each individual attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following failed attempt number `attempt`
    /// (0-based). A server-provided Retry-After wins when it is longer.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let delay = backoff_delay(attempt, self.base_delay, self.max_delay, self.jitter);
        match retry_after {
            Some(hint) if hint > delay => hint,
            _ => delay,
        }
    }
}

/// Execute `work` up to `budget` times, returning the final outcome and the
/// number of attempts made.
pub(crate) async fn run_with_retry(
    work: &dyn CallWork,
    session: &SessionHandle,
    budget: u32,
    policy: &RetryPolicy,
) -> (Result<AgentReply, CallError>, u32) {
    let budget = budget.max(1);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let outcome = match timeout(policy.attempt_timeout, work.invoke(session.clone())).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::timeout(policy.attempt_timeout)),
        };

        match outcome {
            Ok(reply) => {
                debug!(attempts, "upstream attempt succeeded");
                return (Ok(reply), attempts);
            }
            Err(e) if e.kind.is_transient() && attempts < budget => {
                let delay = policy.delay_for(attempts - 1, e.retry_after);
                warn!(
                    kind = %e.kind,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "transient upstream failure, backing off: {}",
                    e.message
                );
                sleep(delay).await;
            }
            Err(e) => return (Err(e.into()), attempts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::Utc;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct FlakyWork {
        calls: AtomicU32,
        fail_first: u32,
        kind: ErrorKind,
    }

    impl CallWork for FlakyWork {
        fn invoke(
            &self,
            _session: SessionHandle,
        ) -> BoxFuture<'static, Result<AgentReply, UpstreamError>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let kind = self.kind;
            let fail = call < self.fail_first;
            Box::pin(async move {
                if fail {
                    Err(UpstreamError::new(kind, "boom"))
                } else {
                    Ok(AgentReply {
                        content: "ok".into(),
                    })
                }
            })
        }
    }

    fn session() -> SessionHandle {
        SessionHandle {
            replica: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_delay_honors_longer_retry_after() {
        let policy = RetryPolicy {
            jitter: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(10))),
            Duration::from_secs(10)
        );
        // A shorter hint never shortens the computed backoff
        assert_eq!(
            policy.delay_for(2, Some(Duration::from_millis(1))),
            Duration::from_secs(2)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_budget_on_persistent_transient_failure() {
        let work = FlakyWork {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            kind: ErrorKind::Server,
        };
        let (outcome, attempts) =
            run_with_retry(&work, &session(), 3, &RetryPolicy::default()).await;

        assert_eq!(attempts, 3);
        assert_eq!(work.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.unwrap_err().kind, ErrorKind::Server);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_is_not_retried() {
        let work = FlakyWork {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            kind: ErrorKind::Forbidden,
        };
        let (outcome, attempts) =
            run_with_retry(&work, &session(), 5, &RetryPolicy::default()).await;

        assert_eq!(attempts, 1);
        assert_eq!(outcome.unwrap_err().kind, ErrorKind::Forbidden);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let work = FlakyWork {
            calls: AtomicU32::new(0),
            fail_first: 2,
            kind: ErrorKind::RateLimited,
        };
        let (outcome, attempts) =
            run_with_retry(&work, &session(), 5, &RetryPolicy::default()).await;

        assert_eq!(attempts, 3);
        assert_eq!(outcome.unwrap().content, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_budget_still_makes_one_attempt() {
        let work = FlakyWork {
            calls: AtomicU32::new(0),
            fail_first: 0,
            kind: ErrorKind::Server,
        };
        let (outcome, attempts) =
            run_with_retry(&work, &session(), 0, &RetryPolicy::default()).await;

        assert_eq!(attempts, 1);
        assert!(outcome.is_ok());
    }
}
