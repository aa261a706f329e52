//! The gateway: admission, queueing, caching, retry, and session
//! provisioning composed behind one `submit` call.
//!
//! Shared state (buckets, queue, cache) lives behind coarse async mutexes;
//! every lock hold is short and free of I/O. Upstream calls always run
//! outside the locks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{fingerprint, ResponseCache};
use crate::config::GatewayConfig;
use crate::error::{CallError, CallResult, ErrorKind};
use crate::queue::{QueueError, RequestQueue};
use crate::rate_limit::{AdmissionController, BucketStatus, ScopeKey};
use crate::retry;
use crate::session::{SessionHandle, SessionPhase, SessionProvisioner};
use crate::upstream::{AgentReply, UpstreamClient, UpstreamError};

/// Floor for the drain task's wait so a tiny ETA can't spin it.
const DRAIN_MIN_WAIT: Duration = Duration::from_millis(10);
/// Cadence for re-checking the queue when nothing signals a wake.
const DRAIN_IDLE_WAIT: Duration = Duration::from_secs(1);

/// One upstream call, re-invocable for retries once a session is ready.
pub trait CallWork: Send + Sync {
    fn invoke(&self, session: SessionHandle)
        -> BoxFuture<'static, Result<AgentReply, UpstreamError>>;
}

struct FnWork<F>(F);

impl<F, Fut> CallWork for FnWork<F>
where
    F: Fn(SessionHandle) -> Fut + Send + Sync,
    Fut: Future<Output = Result<AgentReply, UpstreamError>> + Send + 'static,
{
    fn invoke(
        &self,
        session: SessionHandle,
    ) -> BoxFuture<'static, Result<AgentReply, UpstreamError>> {
        Box::pin((self.0)(session))
    }
}

/// Per-call options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Cache key for the response. [`Gateway::chat`] fills this with a
    /// content fingerprint when unset.
    pub cache_key: Option<String>,
    /// Skip cache lookup and write-through entirely.
    pub no_cache: bool,
    pub guild_id: Option<String>,
    pub user_id: Option<String>,
    /// Maximum upstream attempts; 0 means the configured default.
    pub attempt_budget: u32,
}

/// Read-only operational snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub queue_depth: usize,
    pub cache_size: usize,
    pub session_state: SessionPhase,
}

/// Gateway between application callers and a rate-limited, session-oriented
/// upstream AI service.
///
/// Construct one per process with [`Gateway::new`]; it owns all rate-limit,
/// queue, cache, and session state for its lifetime.
pub struct Gateway<C> {
    config: GatewayConfig,
    client: Arc<C>,
    admission: Mutex<AdmissionController>,
    queue: Mutex<RequestQueue>,
    cache: Mutex<ResponseCache>,
    provisioner: SessionProvisioner<C>,
    drain_wake: Arc<Notify>,
}

impl<C: UpstreamClient> Gateway<C> {
    /// Build the gateway and start its queue drain task. The drain task
    /// holds only a weak reference and exits when the gateway is dropped.
    pub fn new(config: GatewayConfig, client: C) -> Arc<Self> {
        let client = Arc::new(client);
        let drain_wake = Arc::new(Notify::new());
        let gateway = Arc::new(Self {
            admission: Mutex::new(AdmissionController::new(config.limits.clone())),
            queue: Mutex::new(RequestQueue::new(config.queue.max_len)),
            cache: Mutex::new(ResponseCache::new()),
            provisioner: SessionProvisioner::new(Arc::clone(&client), config.session.clone()),
            client,
            drain_wake: Arc::clone(&drain_wake),
            config,
        });

        tokio::spawn(drain_loop(Arc::downgrade(&gateway), drain_wake));
        gateway
    }

    /// Submit one unit of upstream work.
    ///
    /// Checks the cache, then admission; admitted work executes
    /// immediately, the rest queues in FIFO order until capacity frees up.
    /// Suspends until the call concludes one way or another.
    pub async fn submit<F, Fut>(self: &Arc<Self>, work: F, options: CallOptions) -> CallResult
    where
        F: Fn(SessionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<AgentReply, UpstreamError>> + Send + 'static,
    {
        self.submit_work(Arc::new(FnWork(work)), options).await
    }

    /// Chat with the provisioned agent. The cache key defaults to a
    /// fingerprint of the message content.
    pub async fn chat(self: &Arc<Self>, content: &str, mut options: CallOptions) -> CallResult {
        if options.cache_key.is_none() && !options.no_cache {
            options.cache_key = Some(fingerprint(content));
        }
        let client = Arc::clone(&self.client);
        let content = content.to_string();
        self.submit(
            move |session: SessionHandle| {
                let client = Arc::clone(&client);
                let content = content.clone();
                async move { client.chat(session.replica, &content).await }
            },
            options,
        )
        .await
    }

    async fn submit_work(self: &Arc<Self>, work: Arc<dyn CallWork>, options: CallOptions) -> CallResult {
        let cache_key = if options.no_cache {
            None
        } else {
            options.cache_key.clone()
        };
        if let Some(key) = &cache_key {
            let mut cache = self.cache.lock().await;
            if let Some(value) = cache.get(key) {
                debug!(key = %key, "cache hit");
                return CallResult::cached(value);
            }
        }

        let scopes = scope_set(&options);
        let budget = if options.attempt_budget == 0 {
            self.config.retry.default_attempt_budget
        } else {
            options.attempt_budget
        };

        let admitted = self.admission.lock().await.admit(&scopes);
        if admitted {
            let result = self
                .execute(work.as_ref(), cache_key.as_deref(), budget, Duration::ZERO)
                .await;
            self.drain_wake.notify_one();
            return result;
        }

        let (tx, rx) = oneshot::channel();
        let enqueued = {
            let mut queue = self.queue.lock().await;
            queue.enqueue(work, scopes, cache_key, budget, tx)
        };
        match enqueued {
            Ok(id) => debug!(id, "request queued pending capacity"),
            Err(QueueError::CapacityExceeded(depth)) => {
                warn!(depth, "request rejected, queue full");
                return CallResult::failure(
                    CallError::new(
                        ErrorKind::CapacityExceeded,
                        format!("request queue is full ({} waiting)", depth),
                    ),
                    0,
                    0,
                );
            }
        }
        self.drain_wake.notify_one();

        match rx.await {
            Ok(result) => result,
            // Executor dropped the reply handle; only happens on shutdown.
            Err(_) => CallResult::failure(
                CallError::new(ErrorKind::Unknown, "request abandoned before execution"),
                0,
                0,
            ),
        }
    }

    /// Run admitted work: session first, then the retry loop, then the
    /// cache write-through. Holds no gateway lock while the upstream call
    /// is in flight.
    async fn execute(
        &self,
        work: &dyn CallWork,
        cache_key: Option<&str>,
        budget: u32,
        queue_wait: Duration,
    ) -> CallResult {
        let queue_wait_ms = queue_wait.as_millis().min(u128::from(u64::MAX)) as u64;

        let session = match self.provisioner.ensure_ready().await {
            Ok(session) => session,
            Err(error) => {
                warn!(kind = %error.kind, queue_wait_ms, "session provisioning failed: {}", error.message);
                return CallResult::failure(error, queue_wait_ms, 0);
            }
        };

        let policy = self.config.retry.policy();
        let (outcome, attempt_count) =
            retry::run_with_retry(work, &session, budget, &policy).await;

        match &outcome {
            Ok(reply) => {
                if let Some(key) = cache_key {
                    let mut cache = self.cache.lock().await;
                    cache.put(key.to_string(), reply.clone(), self.config.cache.ttl());
                }
                info!(queue_wait_ms, attempt_count, "upstream call succeeded");
            }
            Err(error) => {
                warn!(
                    kind = %error.kind,
                    queue_wait_ms,
                    attempt_count,
                    "upstream call failed: {}",
                    error.message
                );
            }
        }

        CallResult {
            outcome,
            from_cache: false,
            queue_wait_ms,
            attempt_count,
        }
    }

    /// Admit queued requests head-first while tokens remain. Returns the
    /// blocked head's readiness ETA, or `None` when the queue is empty.
    async fn drain(self: &Arc<Self>) -> Option<Duration> {
        loop {
            let job = {
                let mut queue = self.queue.lock().await;
                let scopes = queue.head_scopes()?;
                let mut admission = self.admission.lock().await;
                if !admission.admit(&scopes) {
                    return Some(admission.next_ready_eta(&scopes));
                }
                match queue.pop_head() {
                    Some(job) => job,
                    None => continue,
                }
            };

            let waited = Instant::now().duration_since(job.enqueued_at);
            debug!(id = job.id, waited_ms = waited.as_millis() as u64, "dequeued request");

            let gateway = Arc::clone(self);
            tokio::spawn(async move {
                let result = gateway
                    .execute(
                        job.work.as_ref(),
                        job.cache_key.as_deref(),
                        job.attempt_budget,
                        waited,
                    )
                    .await;
                // Receiver may have been dropped by an abandoning caller.
                let _ = job.reply.send(result);
                gateway.drain_wake.notify_one();
            });
        }
    }

    /// Operational snapshot for dashboards and logging.
    pub async fn status(&self) -> GatewayStatus {
        GatewayStatus {
            queue_depth: self.queue.lock().await.len(),
            cache_size: self.cache.lock().await.len(),
            session_state: self.provisioner.phase(),
        }
    }

    /// Per-scope token bucket diagnostics. Read-only.
    pub async fn bucket_status(
        &self,
        guild_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Vec<BucketStatus> {
        self.admission.lock().await.status(guild_id, user_id)
    }
}

fn scope_set(options: &CallOptions) -> Vec<ScopeKey> {
    let mut scopes = vec![ScopeKey::Global];
    if let Some(id) = &options.guild_id {
        scopes.push(ScopeKey::Guild(id.clone()));
    }
    if let Some(id) = &options.user_id {
        scopes.push(ScopeKey::User(id.clone()));
    }
    scopes
}

/// Background queue drain. Wakes on completion signals, or on a timer
/// bounded by the blocked head's refill ETA.
async fn drain_loop<C: UpstreamClient>(
    gateway: std::sync::Weak<Gateway<C>>,
    wake: Arc<Notify>,
) {
    loop {
        let wait = match gateway.upgrade() {
            None => break,
            Some(gateway) => match gateway.drain().await {
                Some(eta) => eta.clamp(DRAIN_MIN_WAIT, DRAIN_IDLE_WAIT),
                None => DRAIN_IDLE_WAIT,
            },
        };

        tokio::select! {
            _ = wake.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
