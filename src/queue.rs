//! Bounded FIFO queue for requests that failed admission.
//!
//! The system's backpressure valve: a full queue rejects immediately
//! instead of growing unbounded. Draining is strict FIFO with head-of-line
//! blocking; a blocked head is never bypassed by a later request whose
//! scopes happen to have tokens.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::CallResult;
use crate::gateway::CallWork;
use crate::rate_limit::ScopeKey;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("request queue is full ({0} waiting)")]
    CapacityExceeded(usize),
}

/// A request waiting for admission. Owned exclusively by the queue until
/// dequeued, at which point ownership transfers to the executor.
pub struct QueuedRequest {
    pub id: u64,
    pub enqueued_at: Instant,
    pub scopes: Vec<ScopeKey>,
    pub work: Arc<dyn CallWork>,
    pub cache_key: Option<String>,
    pub attempt_budget: u32,
    /// Completion handle the caller is suspended on.
    pub reply: oneshot::Sender<CallResult>,
}

/// Bounded FIFO of pending requests.
///
/// Cancellation is O(1): the id moves from the live set to a tombstone set
/// and the entry is discarded when it reaches the head. Entries whose
/// caller dropped the completion handle are discarded the same way, so an
/// abandoned request never consumes an admission slot.
pub struct RequestQueue {
    entries: VecDeque<QueuedRequest>,
    /// Ids currently queued and not cancelled.
    live: HashSet<u64>,
    cancelled: HashSet<u64>,
    max_len: usize,
    next_id: u64,
}

impl RequestQueue {
    pub fn new(max_len: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            live: HashSet::new(),
            cancelled: HashSet::new(),
            max_len,
            next_id: 0,
        }
    }

    /// Append a request, failing immediately when the queue is full.
    /// Returns the assigned id.
    pub fn enqueue(
        &mut self,
        work: Arc<dyn CallWork>,
        scopes: Vec<ScopeKey>,
        cache_key: Option<String>,
        attempt_budget: u32,
        reply: oneshot::Sender<CallResult>,
    ) -> Result<u64, QueueError> {
        let depth = self.len();
        if depth >= self.max_len {
            return Err(QueueError::CapacityExceeded(depth));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id);
        self.entries.push_back(QueuedRequest {
            id,
            enqueued_at: Instant::now(),
            scopes,
            work,
            cache_key,
            attempt_budget,
            reply,
        });
        Ok(id)
    }

    /// Mark a still-queued request as abandoned. Returns false if the id is
    /// unknown, already cancelled, or already dequeued.
    pub fn cancel(&mut self, id: u64) -> bool {
        if self.live.remove(&id) {
            self.cancelled.insert(id);
            true
        } else {
            false
        }
    }

    /// Scope set of the head-of-line request, after discarding dead entries.
    pub fn head_scopes(&mut self) -> Option<Vec<ScopeKey>> {
        self.prune_head();
        self.entries.front().map(|e| e.scopes.clone())
    }

    /// Dequeue the head-of-line request for execution.
    pub fn pop_head(&mut self) -> Option<QueuedRequest> {
        self.prune_head();
        let request = self.entries.pop_front()?;
        self.live.remove(&request.id);
        Some(request)
    }

    /// Number of live (non-cancelled) waiting requests.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop cancelled or abandoned entries sitting at the head.
    fn prune_head(&mut self) {
        while let Some(front) = self.entries.front() {
            if self.cancelled.remove(&front.id) {
                self.entries.pop_front();
            } else if front.reply.is_closed() {
                self.live.remove(&front.id);
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }
}
