//! Membership table
//!
//! Per CLUSTER_MODEL.md §5:
//! - The member list is the only shared mutable table; mutation happens
//!   under short exclusive sections, snapshot reads clone `Arc`s out and
//!   release the lock
//! - Every status transition broadcasts on a shared condition; waiters
//!   (`get_ready_database` with a timeout, `wait_until_synchronised`, the
//!   template search) may wake spuriously and re-check their predicate
//! - Ready-replica selection is uniformly random through an injectable
//!   seeded source; a single candidate is returned directly
//! - Worker start/stop, joins, broadcasts and listener callbacks always
//!   run after the table locks are released

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::errors::{ClusterError, ClusterResult};
use super::queue::QueueEvents;
use super::replica::Replica;
use super::status::ReplicaStatus;
use super::sync::{SyncAction, SyncContext};
use crate::backend::{Action, BackendError, DatabaseHandle};
use crate::observability::{Event, Logger};

/// Notification target for membership status changes.
///
/// Callbacks run outside all table locks, possibly on a replica's worker
/// thread.
pub trait StatusListener: Send + Sync {
    /// A member moved from `previous` to `current`.
    fn status_changed(&self, key: &str, previous: ReplicaStatus, current: ReplicaStatus);
}

fn short_key(key: &str) -> &str {
    key.get(..12).unwrap_or(key)
}

/// The keyed collection of all cluster members.
pub struct MemberList {
    members: RwLock<HashMap<String, Arc<Replica>>>,
    /// Bumped on every broadcast; lets waiters detect changes they raced.
    generation: Mutex<u64>,
    changed: Condvar,
    rng: Mutex<StdRng>,
    listeners: Mutex<Vec<Weak<dyn StatusListener>>>,
    sync_context: Mutex<Option<SyncContext>>,
    queue_capacity: usize,
    template_wait: Duration,
}

impl MemberList {
    /// Create an empty table.
    ///
    /// `rng_seed` pins ready-replica selection for tests; `None` seeds
    /// from entropy.
    pub fn new(queue_capacity: usize, template_wait: Duration, rng_seed: Option<u64>) -> Arc<Self> {
        let rng = match rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Arc::new(Self {
            members: RwLock::new(HashMap::new()),
            generation: Mutex::new(0),
            changed: Condvar::new(),
            rng: Mutex::new(rng),
            listeners: Mutex::new(Vec::new()),
            sync_context: Mutex::new(None),
            queue_capacity,
            template_wait,
        })
    }

    /// Bind the synchronization collaborators used to build each member's
    /// join-time sync action. Without a bound context members skip the
    /// copy and go straight to READY (state-machine-only use, tests).
    pub(crate) fn bind_sync_context(&self, context: SyncContext) {
        *self
            .sync_context
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(context);
    }

    /// Register a status-change listener.
    pub fn subscribe(&self, listener: Weak<dyn StatusListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    // =========================================================================
    // SNAPSHOT QUERIES (never block)
    // =========================================================================

    /// All current members.
    pub fn members(&self) -> Vec<Arc<Replica>> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Member by key.
    pub fn member(&self, key: &str) -> Option<Arc<Replica>> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Whether a key is currently mapped.
    pub fn contains(&self, key: &str) -> bool {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Status of the member backing `handle`, if it is one.
    pub fn status_of(&self, handle: &dyn DatabaseHandle) -> Option<ReplicaStatus> {
        self.member(&handle.settings_key()).map(|r| r.status())
    }

    /// Handles of all READY members.
    pub fn get_ready_databases(&self) -> Vec<Arc<dyn DatabaseHandle>> {
        self.get_databases_by_status(&[ReplicaStatus::Ready])
    }

    /// Handles of all members in any of the given statuses.
    pub fn get_databases_by_status(
        &self,
        statuses: &[ReplicaStatus],
    ) -> Vec<Arc<dyn DatabaseHandle>> {
        self.members()
            .into_iter()
            .filter(|r| statuses.contains(&r.status()))
            .map(|r| r.handle().clone())
            .collect()
    }

    /// Number of READY members.
    pub fn ready_count(&self) -> usize {
        self.members()
            .iter()
            .filter(|r| r.status() == ReplicaStatus::Ready)
            .count()
    }

    // =========================================================================
    // MEMBERSHIP
    // =========================================================================

    /// Add a database and start it (joins trigger synchronization).
    /// Returns false if the key is already a member.
    pub fn add(self: &Arc<Self>, handle: Arc<dyn DatabaseHandle>) -> ClusterResult<bool> {
        let key = handle.settings_key();
        let replica = {
            let mut members = self
                .members
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if members.contains_key(&key) {
                return Ok(false);
            }
            let replica = Replica::new(handle, self.queue_capacity);
            replica.attach_events(Arc::new(MemberEvents {
                list: Arc::downgrade(self),
                key: key.clone(),
            }));
            members.insert(key.clone(), replica.clone());
            replica
        };
        Logger::emit(Event::MemberAdded, &[("member", short_key(&key))]);
        self.bump_and_notify();
        self.start_member(&replica)?;
        Ok(true)
    }

    /// Add several databases.
    pub fn add_all<I>(self: &Arc<Self>, handles: I) -> ClusterResult<usize>
    where
        I: IntoIterator<Item = Arc<dyn DatabaseHandle>>,
    {
        let mut added = 0;
        for handle in handles {
            if self.add(handle)? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Remove a member: stop its worker and drop it from the table.
    /// Returns false if the handle is not a member.
    pub fn remove(&self, handle: &dyn DatabaseHandle) -> bool {
        self.remove_by_key(&handle.settings_key())
    }

    pub(crate) fn remove_by_key(&self, key: &str) -> bool {
        let replica = {
            self.members
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(key)
        };
        match replica {
            Some(replica) => {
                let _ = replica.transition(ReplicaStatus::Dead);
                Logger::emit(Event::MemberRemoved, &[("member", short_key(key))]);
                self.bump_and_notify();
                true
            }
            None => false,
        }
    }

    /// Run the start sequence for an existing member: freeze, forget stale
    /// queued work, resynchronize before anything else.
    pub(crate) fn start_member(self: &Arc<Self>, replica: &Arc<Replica>) -> ClusterResult<()> {
        let key = replica.key().to_string();
        self.set_status_by_key(&key, ReplicaStatus::Paused)?;
        replica.queue().clear();
        replica.begin_incarnation();
        if let Some(sync) = self.make_sync_action(&key) {
            replica.queue().enqueue(sync)?;
        }
        self.set_status_by_key(&key, ReplicaStatus::Processing)?;
        if replica.queue().is_empty() {
            // No sync context bound; nothing to drain, promote directly.
            self.set_status_by_key(&key, ReplicaStatus::Ready)?;
        }
        Ok(())
    }

    /// Put a member back through the start sequence.
    pub(crate) fn restart(self: &Arc<Self>, key: &str) -> ClusterResult<()> {
        let replica = self.member(key).ok_or_else(|| ClusterError::UnknownMember {
            key: short_key(key).to_string(),
        })?;
        if replica.status().is_terminal() {
            return Err(ClusterError::MemberDead {
                key: short_key(key).to_string(),
            });
        }
        self.start_member(&replica)
    }

    /// Stop every worker and clear the table.
    pub fn dismantle(&self) {
        let drained: Vec<Arc<Replica>> = {
            self.members
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .drain()
                .map(|(_, replica)| replica)
                .collect()
        };
        for replica in &drained {
            let _ = replica.transition(ReplicaStatus::Dead);
        }
        self.bump_and_notify();
    }

    fn make_sync_action(self: &Arc<Self>, target_key: &str) -> Option<Arc<dyn Action>> {
        let context = self
            .sync_context
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        context.as_ref().map(|context| {
            Arc::new(SyncAction::new(
                target_key.to_string(),
                context.provider.clone(),
                Arc::downgrade(self),
                context.synchronizer.clone(),
                context.required_tables.clone(),
            )) as Arc<dyn Action>
        })
    }

    // =========================================================================
    // STATUS TRANSITIONS (each broadcasts)
    // =========================================================================

    /// Mark a member READY.
    pub fn set_ready(&self, handle: &dyn DatabaseHandle) -> ClusterResult<bool> {
        self.set_status_by_key(&handle.settings_key(), ReplicaStatus::Ready)
    }

    /// Mark a member PAUSED.
    pub fn set_paused(&self, handle: &dyn DatabaseHandle) -> ClusterResult<bool> {
        self.set_status_by_key(&handle.settings_key(), ReplicaStatus::Paused)
    }

    /// Mark a member PROCESSING.
    pub fn set_processing(&self, handle: &dyn DatabaseHandle) -> ClusterResult<bool> {
        self.set_status_by_key(&handle.settings_key(), ReplicaStatus::Processing)
    }

    /// Mark a member SYNCHRONIZING.
    pub fn set_synchronizing(&self, handle: &dyn DatabaseHandle) -> ClusterResult<bool> {
        self.set_status_by_key(&handle.settings_key(), ReplicaStatus::Synchronizing)
    }

    /// Mark a member TEMPLATE.
    pub fn set_template(&self, handle: &dyn DatabaseHandle) -> ClusterResult<bool> {
        self.set_status_by_key(&handle.settings_key(), ReplicaStatus::Template)
    }

    /// Mark a member QUARANTINED.
    pub fn set_quarantined(&self, handle: &dyn DatabaseHandle) -> ClusterResult<bool> {
        self.set_status_by_key(&handle.settings_key(), ReplicaStatus::Quarantined)
    }

    /// Mark a member DEAD.
    pub fn set_dead(&self, handle: &dyn DatabaseHandle) -> ClusterResult<bool> {
        self.set_status_by_key(&handle.settings_key(), ReplicaStatus::Dead)
    }

    pub(crate) fn set_status_by_key(
        &self,
        key: &str,
        status: ReplicaStatus,
    ) -> ClusterResult<bool> {
        let replica = self.member(key).ok_or_else(|| ClusterError::UnknownMember {
            key: short_key(key).to_string(),
        })?;
        let previous = replica.status();
        let changed = replica.transition(status)?;
        // Broadcast even on a no-op change: queue-drain promotions rely on
        // waking waiters whose predicate reads queue depth, not status.
        self.bump_and_notify();
        if changed {
            Logger::emit(
                Event::StatusChanged,
                &[
                    ("member", short_key(key)),
                    ("from", previous.as_str()),
                    ("to", status.as_str()),
                ],
            );
            if status == ReplicaStatus::Dead {
                Logger::emit(Event::MemberDead, &[("member", short_key(key))]);
            }
            self.notify_listeners(key, previous, status);
        }
        Ok(changed)
    }

    /// Quarantine after an apply failure, recording it for diagnostics.
    pub(crate) fn quarantine_member(&self, key: &str, message: String) -> ClusterResult<bool> {
        if let Some(replica) = self.member(key) {
            replica.record_failure(message.clone());
        }
        let changed = self.set_status_by_key(key, ReplicaStatus::Quarantined)?;
        if let Some(replica) = self.member(key) {
            let count = replica.quarantine_count().to_string();
            Logger::emit(
                Event::MemberQuarantined,
                &[
                    ("member", short_key(key)),
                    ("quarantine_count", &count),
                    ("reason", &message),
                ],
            );
        }
        Ok(changed)
    }

    /// Promote PROCESSING to READY once the queue drains; called from the
    /// member's own worker.
    pub(crate) fn promote_if_draining(&self, key: &str) {
        match self.member(key) {
            Some(replica) if replica.status() == ReplicaStatus::Processing => {
                let _ = self.set_status_by_key(key, ReplicaStatus::Ready);
            }
            // Already READY (or mid-transition elsewhere): still wake
            // waiters watching queue depth.
            _ => self.bump_and_notify(),
        }
    }

    // =========================================================================
    // READ SELECTION & WAITS
    // =========================================================================

    /// One READY member's handle, chosen uniformly at random. A single
    /// candidate is returned directly, no randomness spent.
    pub fn get_ready_database(&self) -> ClusterResult<Arc<dyn DatabaseHandle>> {
        let candidates: Vec<Arc<Replica>> = self
            .members()
            .into_iter()
            .filter(|r| r.status() == ReplicaStatus::Ready)
            .collect();
        match candidates.len() {
            0 => Err(ClusterError::NoAvailableDatabase),
            1 => Ok(candidates[0].handle().clone()),
            n => {
                let index = self
                    .rng
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .gen_range(0..n);
                Ok(candidates[index].handle().clone())
            }
        }
    }

    /// As [`MemberList::get_ready_database`], but first waits up to
    /// `timeout` for a member to report READY.
    pub fn get_ready_database_timeout(
        &self,
        timeout: Duration,
    ) -> ClusterResult<Arc<dyn DatabaseHandle>> {
        let deadline = Instant::now() + timeout;
        loop {
            let generation = self.generation();
            if let Ok(handle) = self.get_ready_database() {
                return Ok(handle);
            }
            if !self.wait_change(generation, deadline) {
                return self.get_ready_database();
            }
        }
    }

    /// Block until every member is READY with an empty queue, or the
    /// timeout elapses. Returns whether parity was reached. An empty
    /// cluster is vacuously synchronised.
    pub fn wait_until_synchronised(&self, timeout: Option<Duration>) -> bool {
        self.wait_for(timeout, || {
            self.members()
                .iter()
                .all(|r| r.status() == ReplicaStatus::Ready && r.queue().is_empty())
        })
    }

    fn wait_for(&self, timeout: Option<Duration>, predicate: impl Fn() -> bool) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let generation = self.generation();
            if predicate() {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if !self.wait_change(generation, deadline) {
                        return predicate();
                    }
                }
                None => self.wait_change_unbounded(generation),
            }
        }
    }

    fn generation(&self) -> u64 {
        *self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn bump_and_notify(&self) {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        self.changed.notify_all();
    }

    /// Wait until the generation moves past `seen` or the deadline hits.
    /// Returns whether a change was observed.
    fn wait_change(&self, seen: u64, deadline: Instant) -> bool {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if *generation != seen {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(generation, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            generation = guard;
        }
    }

    fn wait_change_unbounded(&self, seen: u64) {
        let mut generation = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *generation == seen {
            generation = self
                .changed
                .wait(generation)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn notify_listeners(&self, key: &str, previous: ReplicaStatus, current: ReplicaStatus) {
        let listeners: Vec<Arc<dyn StatusListener>> = {
            let mut registered = self
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            registered.retain(|weak| weak.strong_count() > 0);
            registered.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.status_changed(key, previous, current);
        }
    }

    // =========================================================================
    // TEMPLATE SEARCH
    // =========================================================================

    /// Pick a READY member other than `excluding_key` as the data source
    /// for a copy, marking it TEMPLATE for the copy window.
    ///
    /// If no member is READY yet but some are still catching up, waits up
    /// to the configured template budget for one to arrive. A single-
    /// member table reports [`ClusterError::OnlyOneDatabaseInCluster`];
    /// the coordinator layers the authoritative-settings fallback on top.
    pub fn get_template_database(&self, excluding_key: &str) -> ClusterResult<Arc<Replica>> {
        let deadline = Instant::now() + self.template_wait;
        loop {
            let generation = self.generation();
            let members = self.members();
            if members.len() < 2 {
                return Err(ClusterError::OnlyOneDatabaseInCluster);
            }
            let candidates: Vec<Arc<Replica>> = members
                .iter()
                .filter(|r| r.key() != excluding_key && r.status() == ReplicaStatus::Ready)
                .cloned()
                .collect();
            if !candidates.is_empty() {
                let chosen = if candidates.len() == 1 {
                    candidates[0].clone()
                } else {
                    let index = self
                        .rng
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .gen_range(0..candidates.len());
                    candidates[index].clone()
                };
                // The candidate may have left READY since the snapshot;
                // claim it only if it is still there.
                if chosen.status() == ReplicaStatus::Ready
                    && self
                        .set_status_by_key(chosen.key(), ReplicaStatus::Template)
                        .unwrap_or(false)
                {
                    Logger::emit(
                        Event::TemplateSelected,
                        &[
                            ("template", short_key(chosen.key())),
                            ("target", short_key(excluding_key)),
                        ],
                    );
                    return Ok(chosen);
                }
                continue;
            }
            let catching_up = members.iter().any(|r| {
                r.key() != excluding_key
                    && matches!(
                        r.status(),
                        ReplicaStatus::Processing
                            | ReplicaStatus::Synchronizing
                            | ReplicaStatus::Template
                    )
            });
            if !catching_up {
                return Err(ClusterError::NoAvailableDatabase);
            }
            if !self.wait_change(generation, deadline) {
                return Err(ClusterError::NoAvailableDatabase);
            }
        }
    }

    /// Return a borrowed template to READY after its copy window.
    pub(crate) fn release_template(&self, key: &str) {
        if let Some(replica) = self.member(key) {
            if replica.status() == ReplicaStatus::Template {
                let _ = self.set_status_by_key(key, ReplicaStatus::Ready);
                Logger::emit(Event::TemplateReleased, &[("template", short_key(key))]);
            }
        }
    }

    // =========================================================================
    // ACTION ROUTING
    // =========================================================================

    /// Enqueue an action for one member. Rejected if the member's status
    /// has discarded its queue.
    pub fn queue_action(
        &self,
        handle: &dyn DatabaseHandle,
        action: Arc<dyn Action>,
    ) -> ClusterResult<()> {
        self.queue_action_by_key(&handle.settings_key(), action)
    }

    pub(crate) fn queue_action_by_key(
        &self,
        key: &str,
        action: Arc<dyn Action>,
    ) -> ClusterResult<()> {
        let replica = self.member(key).ok_or_else(|| ClusterError::UnknownMember {
            key: short_key(key).to_string(),
        })?;
        let status = replica.status();
        if !status.retains_queue() {
            return Err(ClusterError::QueueUnavailable {
                key: short_key(key).to_string(),
                status,
            });
        }
        replica.queue().enqueue(action)
    }
}

/// Upward queue reporting for one member: drain promotes, failure
/// quarantines. Only this member is ever touched (CL-I1).
struct MemberEvents {
    list: Weak<MemberList>,
    key: String,
}

impl QueueEvents for MemberEvents {
    fn action_applied(&self, _description: &str) {}

    fn action_failed(&self, description: &str, error: BackendError) {
        if let Some(list) = self.list.upgrade() {
            let _ = list.quarantine_member(&self.key, format!("{description}: {error}"));
        }
    }

    fn queue_drained(&self) {
        if let Some(list) = self.list.upgrade() {
            list.promote_if_draining(&self.key);
        }
    }
}
