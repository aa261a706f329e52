//! End-to-end gateway behavior against a scripted upstream: admission,
//! queueing, caching, retry, and session provisioning working together.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use llm_gateway::config::{GatewayConfig, ScopeLimit};
use llm_gateway::error::ErrorKind;
use llm_gateway::gateway::{CallOptions, Gateway};
use llm_gateway::session::SessionPhase;
use llm_gateway::upstream::{
    AgentRecord, AgentReply, AgentSpec, UpstreamClient, UpstreamError, UpstreamResult, UserRecord,
};

#[derive(Default)]
struct MockState {
    chat_calls: AtomicUsize,
    chat_log: Mutex<Vec<String>>,
    /// Errors consumed one per chat call; empty means success.
    chat_errors: Mutex<VecDeque<ErrorKind>>,
    get_user_calls: AtomicUsize,
}

/// Upstream double. The service user and agent already exist, so
/// provisioning resolves without creating anything; chat calls echo their
/// content unless a scripted error is queued. Cloning shares the state, so
/// tests keep a handle to what the gateway owns.
#[derive(Clone)]
struct MockUpstream {
    agent_uuid: Uuid,
    state: Arc<MockState>,
}

impl MockUpstream {
    fn new() -> Self {
        Self {
            agent_uuid: Uuid::new_v4(),
            state: Arc::new(MockState::default()),
        }
    }

    fn fail_next_chats(&self, kind: ErrorKind, count: usize) {
        let mut errors = self.state.chat_errors.lock().unwrap();
        for _ in 0..count {
            errors.push_back(kind);
        }
    }

    fn chat_calls(&self) -> usize {
        self.state.chat_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamClient for MockUpstream {
    async fn get_user(&self, id: &str) -> UpstreamResult<Option<UserRecord>> {
        self.state.get_user_calls.fetch_add(1, Ordering::SeqCst);
        // Let concurrent first callers pile up on the in-flight attempt.
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(Some(UserRecord {
            id: id.to_string(),
            name: None,
        }))
    }

    async fn create_user(&self, id: &str, _name: &str) -> UpstreamResult<UserRecord> {
        Ok(UserRecord {
            id: id.to_string(),
            name: None,
        })
    }

    async fn list_agents(&self) -> UpstreamResult<Vec<AgentRecord>> {
        Ok(vec![AgentRecord {
            uuid: self.agent_uuid,
            slug: "gateway-assistant".to_string(),
            name: None,
        }])
    }

    async fn create_agent(&self, _spec: &AgentSpec) -> UpstreamResult<AgentRecord> {
        Ok(AgentRecord {
            uuid: self.agent_uuid,
            slug: "gateway-assistant".to_string(),
            name: None,
        })
    }

    async fn chat(&self, _agent: Uuid, content: &str) -> UpstreamResult<AgentReply> {
        self.state.chat_calls.fetch_add(1, Ordering::SeqCst);
        self.state.chat_log.lock().unwrap().push(content.to_string());
        if let Some(kind) = self.state.chat_errors.lock().unwrap().pop_front() {
            return Err(UpstreamError::new(kind, "scripted failure"));
        }
        Ok(AgentReply {
            content: format!("echo: {}", content),
        })
    }
}

fn config(global_capacity: f64, refill_per_sec: f64, queue_max: usize) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.limits.global = ScopeLimit {
        capacity: global_capacity,
        refill_per_sec,
    };
    config.queue.max_len = queue_max;
    config
}

fn gateway(config: GatewayConfig) -> (Arc<Gateway<MockUpstream>>, MockUpstream) {
    let upstream = MockUpstream::new();
    (Gateway::new(config, upstream.clone()), upstream)
}

/// Let spawned submissions progress to their suspension point.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_chat_succeeds_and_reports_metadata() {
    let (g, _upstream) = gateway(config(10.0, 1.0, 10));

    let result = g.chat("hello", CallOptions::default()).await;
    assert!(result.is_success());
    assert!(!result.from_cache);
    assert_eq!(result.queue_wait_ms, 0);
    assert_eq!(result.attempt_count, 1);
    assert_eq!(result.outcome.unwrap().content, "echo: hello");
}

#[tokio::test(start_paused = true)]
async fn test_identical_prompt_is_served_from_cache() {
    let (g, upstream) = gateway(config(10.0, 1.0, 10));

    let first = g.chat("what is rust?", CallOptions::default()).await;
    assert!(!first.from_cache);

    // Same content modulo whitespace: same fingerprint
    let second = g.chat("what  is\nrust?", CallOptions::default()).await;
    assert!(second.from_cache);
    assert_eq!(second.attempt_count, 0);
    assert_eq!(upstream.chat_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_cache_option_always_goes_upstream() {
    let (g, upstream) = gateway(config(10.0, 1.0, 10));
    let options = CallOptions {
        no_cache: true,
        ..Default::default()
    };

    assert!(g.chat("hi", options.clone()).await.is_success());
    assert!(g.chat("hi", options).await.is_success());
    assert_eq!(upstream.chat_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failures_are_not_cached() {
    let (g, upstream) = gateway(config(10.0, 1.0, 10));
    upstream.fail_next_chats(ErrorKind::Malformed, 1);

    let first = g.chat("prompt", CallOptions::default()).await;
    assert_eq!(first.error_kind(), Some(ErrorKind::Malformed));

    let second = g.chat("prompt", CallOptions::default()).await;
    assert!(second.is_success());
    assert!(!second.from_cache);
    assert_eq!(upstream.chat_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retry_until_budget_exhausted() {
    let (g, upstream) = gateway(config(10.0, 1.0, 10));
    upstream.fail_next_chats(ErrorKind::Server, 10);

    let result = g.chat("flaky", CallOptions::default()).await;
    assert_eq!(result.error_kind(), Some(ErrorKind::Server));
    // Default budget
    assert_eq!(result.attempt_count, 3);
    assert_eq!(upstream.chat_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_recovers_within_budget() {
    let (g, upstream) = gateway(config(10.0, 1.0, 10));
    upstream.fail_next_chats(ErrorKind::RateLimited, 2);

    let result = g.chat("flaky", CallOptions::default()).await;
    assert!(result.is_success());
    assert_eq!(result.attempt_count, 3);
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_rejects_without_waiting() {
    // One token, slow refill, one queue slot
    let (g, _upstream) = gateway(config(1.0, 0.01, 1));

    let first = g.chat("one", CallOptions::default()).await;
    assert!(first.is_success());

    let queued = {
        let g = Arc::clone(&g);
        tokio::spawn(async move { g.chat("two", CallOptions::default()).await })
    };
    settle().await;

    let rejected = g.chat("three", CallOptions::default()).await;
    assert_eq!(rejected.error_kind(), Some(ErrorKind::CapacityExceeded));
    assert_eq!(rejected.queue_wait_ms, 0);

    // The queued request still completes once a token refills
    let result = queued.await.unwrap();
    assert!(result.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_queued_request_waits_for_refill() {
    // Two tokens up front, one per second after that
    let (g, _upstream) = gateway(config(2.0, 1.0, 10));

    let one = g.chat("one", CallOptions::default()).await;
    let two = g.chat("two", CallOptions::default()).await;
    assert_eq!(one.queue_wait_ms, 0);
    assert_eq!(two.queue_wait_ms, 0);

    let queued = {
        let g = Arc::clone(&g);
        tokio::spawn(async move { g.chat("three", CallOptions::default()).await })
    };
    settle().await;

    let result = queued.await.unwrap();
    assert!(result.is_success());
    // Third call had to wait for roughly one full token to refill
    assert!(
        result.queue_wait_ms >= 900 && result.queue_wait_ms <= 1100,
        "queue_wait_ms = {}",
        result.queue_wait_ms
    );
}

#[tokio::test(start_paused = true)]
async fn test_queue_drains_in_fifo_order() {
    let (g, upstream) = gateway(config(1.0, 1.0, 10));

    assert!(g.chat("first", CallOptions::default()).await.is_success());

    let mut waiting = Vec::new();
    for content in ["second", "third", "fourth"] {
        let g = Arc::clone(&g);
        waiting.push(tokio::spawn(async move {
            g.chat(content, CallOptions::default()).await
        }));
        // Enqueue order must match submission order
        settle().await;
    }
    for task in waiting {
        assert!(task.await.unwrap().is_success());
    }

    let log = upstream.state.chat_log.lock().unwrap().clone();
    assert_eq!(log, vec!["first", "second", "third", "fourth"]);
}

#[tokio::test(start_paused = true)]
async fn test_per_user_scope_isolates_callers() {
    let mut cfg = config(100.0, 1.0, 10);
    cfg.limits.user = ScopeLimit {
        capacity: 1.0,
        refill_per_sec: 0.01,
    };
    let (g, _upstream) = gateway(cfg);

    let for_user = |user: &str| CallOptions {
        user_id: Some(user.to_string()),
        no_cache: true,
        ..Default::default()
    };

    assert_eq!(g.chat("a", for_user("alice")).await.queue_wait_ms, 0);
    // Different user draws from a different bucket
    assert_eq!(g.chat("b", for_user("bob")).await.queue_wait_ms, 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_first_use_provisions_once() {
    let (g, upstream) = gateway(config(10.0, 1.0, 10));

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let g = Arc::clone(&g);
            tokio::spawn(async move {
                g.chat(&format!("message {}", i), CallOptions::default())
                    .await
            })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().is_success());
    }

    assert_eq!(upstream.state.get_user_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_status_reflects_session_and_queue() {
    let (g, _upstream) = gateway(config(10.0, 1.0, 10));

    let before = g.status().await;
    assert_eq!(before.session_state, SessionPhase::Uninitialized);
    assert_eq!(before.queue_depth, 0);

    assert!(g.chat("hello", CallOptions::default()).await.is_success());

    let after = g.status().await;
    assert_eq!(after.session_state, SessionPhase::Ready);
    assert_eq!(after.queue_depth, 0);
    assert_eq!(after.cache_size, 1);
}

#[tokio::test(start_paused = true)]
async fn test_bucket_status_reports_consumption() {
    let (g, _upstream) = gateway(config(5.0, 1.0, 10));

    assert!(g.chat("hello", CallOptions::default()).await.is_success());

    let buckets = g.bucket_status(None, None).await;
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].scope, "global");
    assert_eq!(buckets[0].capacity, 5.0);
    assert!(buckets[0].remaining < 5.0);
}
