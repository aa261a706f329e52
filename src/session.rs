//! Idempotent provisioning of the upstream session (service user + agent).
//!
//! One instance per gateway. The first caller spawns a task that drives the
//! state machine (resolve identity, create if absent, resolve agent, create
//! if absent); all callers await the in-flight attempt through a watch
//! channel, so concurrent first use cannot create duplicate upstream
//! resources and a cancelled caller cannot strand the attempt.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{CallError, ErrorKind};
use crate::upstream::{AgentLlmSpec, AgentRecord, AgentSpec, UpstreamClient, UpstreamError};

/// Where the provisioning state machine currently is. Reported in the
/// gateway status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Uninitialized,
    ResolvingIdentity,
    CreatingIdentity,
    ResolvingAgent,
    CreatingAgent,
    Ready,
    Failed,
}

impl SessionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Uninitialized => "uninitialized",
            SessionPhase::ResolvingIdentity => "resolving_identity",
            SessionPhase::CreatingIdentity => "creating_identity",
            SessionPhase::ResolvingAgent => "resolving_agent",
            SessionPhase::CreatingAgent => "creating_agent",
            SessionPhase::Ready => "ready",
            SessionPhase::Failed => "failed",
        }
    }
}

/// The provisioned upstream identity, cached for the process lifetime.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Opaque upstream agent identity all calls are routed through.
    pub replica: Uuid,
    pub created_at: DateTime<Utc>,
}

type ProvisionOutcome = Result<SessionHandle, CallError>;

enum Slot {
    Idle,
    InFlight(watch::Receiver<Option<ProvisionOutcome>>),
    Ready(SessionHandle),
    Failed(CallError),
}

/// Ensures the upstream session exists exactly once, surviving concurrent
/// initialization, caller cancellation, and naming conflicts.
pub struct SessionProvisioner<C> {
    inner: Arc<Inner<C>>,
}

struct Inner<C> {
    client: Arc<C>,
    config: SessionConfig,
    slot: Mutex<Slot>,
    phase: std::sync::Mutex<SessionPhase>,
}

impl<C: UpstreamClient> SessionProvisioner<C> {
    pub fn new(client: Arc<C>, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                slot: Mutex::new(Slot::Idle),
                phase: std::sync::Mutex::new(SessionPhase::Uninitialized),
            }),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.phase()
    }

    /// Return the cached session handle, provisioning it first if needed.
    ///
    /// Single-flight: the attempt runs in its own task, so it survives the
    /// caller that started it being cancelled. Callers arriving while
    /// provisioning is in progress suspend until the in-flight attempt
    /// concludes and adopt its outcome.
    pub async fn ensure_ready(&self) -> ProvisionOutcome {
        let mut rx = {
            let mut slot = self.inner.slot.lock().await;
            match &*slot {
                Slot::Ready(handle) => return Ok(handle.clone()),
                Slot::Failed(error) => return Err(error.clone()),
                Slot::InFlight(rx) => rx.clone(),
                Slot::Idle => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Slot::InFlight(rx.clone());
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move { inner.drive(tx).await });
                    rx
                }
            }
        };

        let published = match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        match published {
            Some(result) => result,
            // Sender dropped without publishing: the driver task was torn
            // down (runtime shutdown).
            None => Err(CallError::new(
                ErrorKind::Unknown,
                "session provisioning was interrupted",
            )),
        }
    }
}

impl<C: UpstreamClient> Inner<C> {
    fn phase(&self) -> SessionPhase {
        self.phase
            .lock()
            .map(|p| *p)
            .unwrap_or(SessionPhase::Failed)
    }

    fn set_phase(&self, phase: SessionPhase) {
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
    }

    /// Run the state machine and publish its outcome. Upstream I/O happens
    /// with no lock held; the slot is only locked to record the result.
    async fn drive(&self, tx: watch::Sender<Option<ProvisionOutcome>>) {
        let result = self.provision().await;

        {
            let mut slot = self.slot.lock().await;
            match &result {
                Ok(handle) => *slot = Slot::Ready(handle.clone()),
                // A throttled or unreachable upstream is not a terminal
                // condition; release the slot so a later call can retry.
                Err(error) if error.kind.is_transient() => {
                    self.set_phase(SessionPhase::Uninitialized);
                    *slot = Slot::Idle;
                }
                Err(error) => {
                    self.set_phase(SessionPhase::Failed);
                    *slot = Slot::Failed(error.clone());
                }
            }
        }

        let _ = tx.send(Some(result));
    }

    async fn provision(&self) -> ProvisionOutcome {
        self.set_phase(SessionPhase::ResolvingIdentity);
        info!(user_id = %self.config.user_id, "resolving upstream identity");

        match self.client.get_user(&self.config.user_id).await {
            Ok(Some(_)) => debug!("service user exists"),
            Ok(None) => {
                self.set_phase(SessionPhase::CreatingIdentity);
                match self
                    .client
                    .create_user(&self.config.user_id, &self.config.user_name)
                    .await
                {
                    Ok(_) => info!(user_id = %self.config.user_id, "created service user"),
                    // Lost a creation race; the user exists, which is what
                    // we wanted.
                    Err(e) if e.kind == ErrorKind::Conflict => {
                        debug!("service user already created")
                    }
                    Err(e) => return Err(caller_error(e)),
                }
            }
            Err(e) => return Err(caller_error(e)),
        }

        self.set_phase(SessionPhase::ResolvingAgent);
        let agents = self.client.list_agents().await.map_err(caller_error)?;
        if let Some(agent) = self.match_slug(&agents) {
            info!(replica = %agent.uuid, slug = %agent.slug, "reusing existing agent");
            return Ok(self.finish(agent.uuid));
        }

        self.set_phase(SessionPhase::CreatingAgent);
        let spec = AgentSpec {
            name: self.config.agent_name.clone(),
            slug: self.config.agent_slug.clone(),
            owner_id: self.config.user_id.clone(),
            llm: AgentLlmSpec {
                model: self.config.model.clone(),
                system_message: self.config.system_message.clone(),
            },
        };
        match self.client.create_agent(&spec).await {
            Ok(created) => {
                info!(replica = %created.uuid, slug = %spec.slug, "created agent");
                Ok(self.finish(created.uuid))
            }
            Err(e) if e.kind == ErrorKind::Conflict => {
                // Slug taken, typically by a concurrent creator or a
                // leftover from a prior run. Re-list and adopt the match.
                warn!(slug = %spec.slug, "agent slug taken, re-resolving");
                let agents = self.client.list_agents().await.map_err(caller_error)?;
                match self.match_slug(&agents) {
                    Some(agent) => {
                        info!(replica = %agent.uuid, "adopted agent after slug conflict");
                        Ok(self.finish(agent.uuid))
                    }
                    None => Err(CallError::new(
                        ErrorKind::Conflict,
                        format!(
                            "agent slug \"{}\" is taken but the owning agent is not \
                             visible to this account; configure a different slug",
                            spec.slug
                        ),
                    )),
                }
            }
            Err(e) => Err(caller_error(e)),
        }
    }

    fn match_slug<'a>(&self, agents: &'a [AgentRecord]) -> Option<&'a AgentRecord> {
        agents.iter().find(|a| a.slug == self.config.agent_slug)
    }

    fn finish(&self, replica: Uuid) -> SessionHandle {
        self.set_phase(SessionPhase::Ready);
        SessionHandle {
            replica,
            created_at: Utc::now(),
        }
    }
}

/// Translate an upstream failure into the message callers should see.
fn caller_error(e: UpstreamError) -> CallError {
    let message = match e.kind {
        ErrorKind::Unauthorized => {
            "invalid or expired upstream API key; check the configured secret".to_string()
        }
        ErrorKind::Forbidden => {
            "the upstream API key lacks permission for this operation".to_string()
        }
        ErrorKind::RateLimited => {
            "upstream rate limit exceeded during session setup; try again shortly".to_string()
        }
        _ => format!("failed to initialize upstream session: {}", e.message),
    };
    CallError::new(e.kind, message)
}
