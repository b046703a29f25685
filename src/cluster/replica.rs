//! Cluster member
//!
//! Per CLUSTER_MODEL.md §4, a replica wraps one backend handle with its
//! status machine, quarantine counter and privately-owned action queue.
//! Identity is the settings key, never the handle reference, so a
//! reconnect to the same physical database resolves to the same member.
//!
//! The transition function applies the status machine's side-effect table
//! ([`ReplicaStatus::worker_directive`], [`ReplicaStatus::entry_effect`]).
//! Side effects run after the status lock is released; concurrent
//! transitions are serialized by the status value itself and kept benign
//! by idempotent worker start/stop.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use super::errors::{ClusterError, ClusterResult};
use super::queue::{QueueEvents, ReplicaQueue};
use super::status::{EntryEffect, ReplicaStatus, WorkerDirective};
use crate::backend::DatabaseHandle;

struct ReplicaState {
    status: ReplicaStatus,
    /// New uuid per start sequence; distinguishes successive lives of the
    /// same member key in logs.
    incarnation: Uuid,
    last_failure: Option<String>,
}

/// One physical database kept in sync with the cluster.
pub struct Replica {
    key: String,
    handle: Arc<dyn DatabaseHandle>,
    queue: Arc<ReplicaQueue>,
    state: Mutex<ReplicaState>,
    quarantine_count: AtomicU32,
    /// Upward reporting target handed to worker starts. Detached replicas
    /// (no events attached) never spawn workers, which keeps the state
    /// machine unit-testable without threads.
    events: Mutex<Option<Arc<dyn QueueEvents>>>,
}

impl Replica {
    /// Create a member for the handle. Initial status is UNSYNCHRONISED;
    /// the start sequence moves it through PAUSED into PROCESSING.
    pub fn new(handle: Arc<dyn DatabaseHandle>, queue_capacity: usize) -> Arc<Self> {
        let key = handle.settings_key();
        let queue = ReplicaQueue::new(handle.clone(), queue_capacity);
        Arc::new(Self {
            key,
            handle,
            queue,
            state: Mutex::new(ReplicaState {
                status: ReplicaStatus::Unsynchronised,
                incarnation: Uuid::new_v4(),
                last_failure: None,
            }),
            quarantine_count: AtomicU32::new(0),
            events: Mutex::new(None),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, ReplicaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach the upward reporting target used when workers start.
    pub fn attach_events(&self, events: Arc<dyn QueueEvents>) {
        *self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(events);
    }

    fn events(&self) -> Option<Arc<dyn QueueEvents>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stable member key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The wrapped backend handle.
    pub fn handle(&self) -> &Arc<dyn DatabaseHandle> {
        &self.handle
    }

    /// The privately-owned action queue.
    pub fn queue(&self) -> &Arc<ReplicaQueue> {
        &self.queue
    }

    /// Current status.
    pub fn status(&self) -> ReplicaStatus {
        self.lock_state().status
    }

    /// Consecutive-failure counter; reset on reaching READY.
    pub fn quarantine_count(&self) -> u32 {
        self.quarantine_count.load(Ordering::SeqCst)
    }

    /// Most recent recorded failure, for diagnostics.
    pub fn last_failure(&self) -> Option<String> {
        self.lock_state().last_failure.clone()
    }

    /// Incarnation id of the current life.
    pub fn incarnation(&self) -> Uuid {
        self.lock_state().incarnation
    }

    /// Record a failure message for diagnostics.
    pub fn record_failure(&self, message: impl Into<String>) {
        self.lock_state().last_failure = Some(message.into());
    }

    /// Begin a new life: fresh incarnation id.
    pub fn begin_incarnation(&self) -> Uuid {
        let incarnation = Uuid::new_v4();
        self.lock_state().incarnation = incarnation;
        incarnation
    }

    /// Move to `next`, applying the entry side-effect table.
    ///
    /// Returns whether the status actually changed. Same-status re-entry
    /// still enforces the worker directive (idempotent start/stop) but
    /// skips counter effects. DEAD accepts no transitions.
    pub fn transition(&self, next: ReplicaStatus) -> ClusterResult<bool> {
        let changed = {
            let mut state = self.lock_state();
            if state.status.is_terminal() && next != ReplicaStatus::Dead {
                return Err(ClusterError::MemberDead {
                    key: self.key.clone(),
                });
            }
            let changed = state.status != next;
            state.status = next;
            changed
        };

        if changed {
            match next.entry_effect() {
                EntryEffect::Quarantine => {
                    self.quarantine_count.fetch_add(1, Ordering::SeqCst);
                    self.queue.clear();
                }
                EntryEffect::ResetQuarantine => {
                    self.quarantine_count.store(0, Ordering::SeqCst);
                }
                EntryEffect::None => {}
            }
        }

        match next.worker_directive() {
            WorkerDirective::Start => {
                if let Some(events) = self.events() {
                    self.queue.start_worker(events);
                }
            }
            WorkerDirective::Stop => self.queue.stop_worker(),
        }

        Ok(changed)
    }
}
