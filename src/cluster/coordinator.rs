//! Cluster coordinator
//!
//! Per CLUSTER_MODEL.md §6:
//! - Owns the cluster-wide configuration, the membership table and the
//!   authoritative-settings record
//! - Applies the quorum floor (CL-Q1): once two or more databases have
//!   ever been registered, no remove/quarantine may leave the cluster
//!   with no READY member; a never-grown single-database cluster has no
//!   floor
//! - Recomputes the derived capability flag on every membership change:
//!   the cluster supports NULL-vs-empty-string only if every member's
//!   vendor does
//! - Persistence failures degrade; they never fail a membership operation

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::config::ClusterConfig;
use super::errors::{ClusterError, ClusterResult};
use super::members::{MemberList, StatusListener};
use super::status::ReplicaStatus;
use super::sync::{SyncContext, TableSynchronizer, Template, TemplateProvider};
use crate::backend::{Action, DatabaseHandle, ReconnectFactory};
use crate::observability::{Event, Logger};
use crate::settings::{Encryption, PersistenceStore, SettingsVault};

fn short_key(key: &str) -> &str {
    key.get(..12).unwrap_or(key)
}

/// Cluster-wide coordination: configuration, membership operations with
/// the quorum rule, capability derivation, authoritative settings.
pub struct ClusterCoordinator {
    config: ClusterConfig,
    members: Arc<MemberList>,
    vault: Option<SettingsVault>,
    factory: Option<Arc<dyn ReconnectFactory>>,
    /// AND across all members' native support; recomputed on membership
    /// change.
    supports_null_vs_empty: AtomicBool,
    /// High-water mark of membership; arms the quorum floor at 2.
    peak_members: AtomicUsize,
    /// Whether any member has ever reached READY in this cluster life.
    /// A virgin cluster has no established data, so a joiner that finds
    /// no template may bootstrap instead of failing.
    bootstrapped: AtomicBool,
}

impl ClusterCoordinator {
    /// Create a coordinator with no persistence collaborators.
    pub fn new(config: ClusterConfig) -> Arc<Self> {
        Self::with_collaborators(config, None, None, None)
    }

    /// Create a coordinator with persistence, encryption and reconnect
    /// collaborators. All three are optional; auto-rebuild without a
    /// store simply never persists.
    pub fn with_collaborators(
        config: ClusterConfig,
        store: Option<Arc<dyn PersistenceStore>>,
        encryption: Option<Arc<dyn Encryption>>,
        factory: Option<Arc<dyn ReconnectFactory>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<ClusterCoordinator>| {
            let members = MemberList::new(
                config.queue_capacity,
                Duration::from_millis(config.template_wait_ms),
                config.rng_seed,
            );
            let provider: Weak<dyn TemplateProvider> = weak.clone();
            members.bind_sync_context(SyncContext {
                provider,
                synchronizer: Arc::new(TableSynchronizer),
                required_tables: config.required_tables.clone(),
            });
            let listener: Weak<dyn StatusListener> = weak.clone();
            members.subscribe(listener);
            let vault = store.map(|store| SettingsVault::new(store, encryption));
            ClusterCoordinator {
                config,
                members,
                vault,
                factory,
                supports_null_vs_empty: AtomicBool::new(true),
                peak_members: AtomicUsize::new(0),
                bootstrapped: AtomicBool::new(false),
            }
        })
    }

    /// The cluster configuration.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The membership table, for snapshot queries.
    pub fn members(&self) -> &Arc<MemberList> {
        &self.members
    }

    /// Schema contract every replica must host.
    pub fn get_required_tables(&self) -> &[String] {
        &self.config.required_tables
    }

    /// Whether every member's vendor distinguishes NULL from the empty
    /// string. Degrades to the lowest common denominator.
    pub fn supports_null_vs_empty_string(&self) -> bool {
        self.supports_null_vs_empty.load(Ordering::SeqCst)
    }

    // =========================================================================
    // MEMBERSHIP OPERATIONS
    // =========================================================================

    /// Add a database to the cluster and start it. Adding a key that is
    /// already a member is a no-op, not an error.
    pub fn add_database(&self, handle: Arc<dyn DatabaseHandle>) -> ClusterResult<bool> {
        let memory_only = handle.is_memory_only();
        let settings = handle.settings();
        if !self.members.add(handle)? {
            return Ok(false);
        }
        self.peak_members
            .fetch_max(self.members.len(), Ordering::SeqCst);
        self.recompute_capabilities();
        // First authoritative record wins at add time; READY transitions
        // keep it fresh afterwards.
        if self.config.auto_rebuild && !memory_only {
            if let Some(vault) = &self.vault {
                let absent = matches!(vault.load_settings(&self.config.label), Ok(None));
                if absent {
                    let _ = vault.store_settings(&self.config.label, &settings);
                }
            }
        }
        Ok(true)
    }

    /// Remove a database, subject to the quorum floor. Returns false if
    /// the handle is not a member.
    pub fn remove_database(&self, handle: &dyn DatabaseHandle) -> ClusterResult<bool> {
        let key = handle.settings_key();
        self.quorum_guard(&key)?;
        let removed = self.members.remove_by_key(&key);
        if removed {
            self.recompute_capabilities();
            self.refresh_authoritative();
        }
        Ok(removed)
    }

    /// Quarantine a database after a failure, subject to the quorum floor.
    pub fn quarantine_database(
        &self,
        handle: &dyn DatabaseHandle,
        error: impl fmt::Display,
    ) -> ClusterResult<bool> {
        let key = handle.settings_key();
        self.quorum_guard(&key)?;
        let changed = self.members.quarantine_member(&key, error.to_string())?;
        self.recompute_capabilities();
        self.refresh_authoritative();
        Ok(changed)
    }

    /// Put a member back through the start sequence (resynchronize).
    pub fn restart_database(&self, handle: &dyn DatabaseHandle) -> ClusterResult<()> {
        let key = handle.settings_key();
        self.members.restart(&key)?;
        Logger::emit(Event::MemberRestarted, &[("member", short_key(&key))]);
        Ok(())
    }

    /// Restart every quarantined member. Gated on the auto_reconnect
    /// flag; returns how many restarts were begun.
    pub fn restart_quarantined(&self) -> ClusterResult<usize> {
        if !self.config.auto_reconnect {
            return Ok(0);
        }
        let mut restarted = 0;
        for replica in self.members.members() {
            if replica.status() == ReplicaStatus::Quarantined {
                self.members.restart(replica.key())?;
                Logger::emit(
                    Event::MemberRestarted,
                    &[("member", short_key(replica.key()))],
                );
                restarted += 1;
            }
        }
        Ok(restarted)
    }

    /// Tear the cluster down: erase the authoritative record, stop every
    /// worker, clear membership. The coordinator is reusable afterwards
    /// in its constructed-but-empty state.
    pub fn dismantle(&self) {
        if let Some(vault) = &self.vault {
            let _ = vault.erase(&self.config.label);
        }
        self.members.dismantle();
        self.peak_members.store(0, Ordering::SeqCst);
        self.supports_null_vs_empty.store(true, Ordering::SeqCst);
        self.bootstrapped.store(false, Ordering::SeqCst);
        Logger::emit(Event::ClusterDismantled, &[("label", &self.config.label)]);
    }

    fn quorum_guard(&self, key: &str) -> ClusterResult<()> {
        if self.peak_members.load(Ordering::SeqCst) < 2 {
            return Ok(());
        }
        let Some(replica) = self.members.member(key) else {
            return Ok(());
        };
        if replica.status() == ReplicaStatus::Ready && self.members.ready_count() < 2 {
            Logger::emit(Event::QuorumRefused, &[("member", short_key(key))]);
            return Err(ClusterError::UnableToRemoveLastDatabaseFromCluster);
        }
        Ok(())
    }

    fn recompute_capabilities(&self) {
        let supports = self
            .members
            .members()
            .iter()
            .all(|r| r.handle().native_supports_null_vs_empty_string());
        self.supports_null_vs_empty.store(supports, Ordering::SeqCst);
    }

    /// Re-point the authoritative record at a current READY member. Kept
    /// as-is when no candidate exists; only dismantle erases it.
    fn refresh_authoritative(&self) {
        if !self.config.auto_rebuild {
            return;
        }
        let Some(vault) = &self.vault else {
            return;
        };
        let candidate = self
            .members
            .members()
            .into_iter()
            .filter(|r| r.status() == ReplicaStatus::Ready && !r.handle().is_memory_only())
            .map(|r| r.handle().settings())
            .next();
        if let Some(settings) = candidate {
            let _ = vault.store_settings(&self.config.label, &settings);
        }
    }

    // =========================================================================
    // READS, WAITS, STATUS
    // =========================================================================

    /// Status of a member, if the handle resolves to one.
    pub fn get_status(&self, handle: &dyn DatabaseHandle) -> ClusterResult<ReplicaStatus> {
        self.members
            .status_of(handle)
            .ok_or_else(|| ClusterError::UnknownMember {
                key: short_key(&handle.settings_key()).to_string(),
            })
    }

    /// One READY member's handle, chosen uniformly at random.
    pub fn get_ready_database(&self) -> ClusterResult<Arc<dyn DatabaseHandle>> {
        self.members.get_ready_database()
    }

    /// As [`ClusterCoordinator::get_ready_database`], waiting up to
    /// `timeout_ms` for a member to report READY first.
    pub fn get_ready_database_timeout(
        &self,
        timeout_ms: u64,
    ) -> ClusterResult<Arc<dyn DatabaseHandle>> {
        self.members
            .get_ready_database_timeout(Duration::from_millis(timeout_ms))
    }

    /// Block until every member is caught up, or `timeout_ms` elapses when
    /// given. Returns whether parity was reached.
    pub fn wait_until_synchronised(&self, timeout_ms: Option<u64>) -> bool {
        self.members
            .wait_until_synchronised(timeout_ms.map(Duration::from_millis))
    }

    // =========================================================================
    // WRITE FAN-OUT
    // =========================================================================

    /// Enqueue an action for one member.
    pub fn queue_action(
        &self,
        handle: &dyn DatabaseHandle,
        action: Arc<dyn Action>,
    ) -> ClusterResult<()> {
        self.members.queue_action(handle, action)
    }

    /// Fan an action out to every member whose queue is retained. Returns
    /// how many queues accepted it; a full queue rejects the whole call
    /// (back-pressure to the caller).
    pub fn broadcast_action(&self, action: Arc<dyn Action>) -> ClusterResult<usize> {
        let mut queued = 0;
        for replica in self.members.members() {
            if !replica.status().retains_queue() {
                continue;
            }
            replica.queue().enqueue(action.clone())?;
            queued += 1;
        }
        Ok(queued)
    }
}

impl TemplateProvider for ClusterCoordinator {
    fn template_for(&self, exclude_key: &str) -> ClusterResult<Option<Template>> {
        let search = self.members.get_template_database(exclude_key);
        match search {
            Ok(replica) => Ok(Some(Template {
                handle: replica.handle().clone(),
                member_key: Some(replica.key().to_string()),
            })),
            Err(
                original @ (ClusterError::OnlyOneDatabaseInCluster
                | ClusterError::NoAvailableDatabase),
            ) => {
                // Self-healing fallback: rebuild the last known-good
                // member from persisted settings.
                if self.config.auto_rebuild {
                    if let (Some(vault), Some(factory)) = (&self.vault, &self.factory) {
                        if let Ok(Some(settings)) = vault.load_settings(&self.config.label) {
                            if settings.key() == exclude_key {
                                // The joining member IS the authoritative
                                // database; nothing to copy.
                                return Ok(None);
                            }
                            return match factory.connect(&settings) {
                                Ok(handle) => Ok(Some(Template {
                                    handle,
                                    member_key: None,
                                })),
                                Err(_) => Err(ClusterError::NoAvailableDatabase),
                            };
                        }
                    }
                }
                // A cluster that has never had a READY member holds no
                // established data yet; the joiner may start from its own
                // (empty) state instead of failing. Once bootstrapped,
                // the search result stands.
                if !self.bootstrapped.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                Err(original)
            }
            Err(e) => Err(e),
        }
    }

    fn release_template(&self, template: &Template) {
        if let Some(key) = &template.member_key {
            self.members.release_template(key);
        }
    }
}

impl StatusListener for ClusterCoordinator {
    fn status_changed(&self, key: &str, _previous: ReplicaStatus, current: ReplicaStatus) {
        if current == ReplicaStatus::Ready {
            self.bootstrapped.store(true, Ordering::SeqCst);
        }
        // READY transitions refresh the authoritative record while
        // auto-rebuild is on; memory-only members are never persisted.
        if current != ReplicaStatus::Ready || !self.config.auto_rebuild {
            return;
        }
        let (Some(vault), Some(replica)) = (&self.vault, self.members.member(key)) else {
            return;
        };
        if !replica.handle().is_memory_only() {
            let _ = vault.store_settings(&self.config.label, &replica.handle().settings());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryHandle;

    fn coordinator() -> Arc<ClusterCoordinator> {
        ClusterCoordinator::new(
            ClusterConfig::new("unit")
                .with_rng_seed(11)
                .with_template_wait_ms(200),
        )
    }

    fn settle(cluster: &ClusterCoordinator) {
        assert!(cluster.wait_until_synchronised(Some(5_000)));
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let cluster = coordinator();
        let handle = MemoryHandle::new("dup");
        assert!(cluster.add_database(handle.clone()).unwrap());
        assert!(!cluster.add_database(handle).unwrap());
        assert_eq!(cluster.members().len(), 1);
    }

    #[test]
    fn test_capability_degrades_on_add_and_recovers_on_remove() {
        let cluster = coordinator();
        let full = MemoryHandle::new("full-support");
        let degraded = MemoryHandle::without_null_support("no-support");

        cluster.add_database(full.clone()).unwrap();
        settle(&cluster);
        assert!(cluster.supports_null_vs_empty_string());

        cluster.add_database(degraded.clone()).unwrap();
        settle(&cluster);
        assert!(!cluster.supports_null_vs_empty_string());

        cluster.remove_database(degraded.as_ref()).unwrap();
        assert!(cluster.supports_null_vs_empty_string());
    }

    #[test]
    fn test_single_member_cluster_has_no_quorum_floor() {
        let cluster = coordinator();
        let handle = MemoryHandle::new("lonely");
        cluster.add_database(handle.clone()).unwrap();
        settle(&cluster);
        assert!(cluster.remove_database(handle.as_ref()).unwrap());
        assert!(cluster.members().is_empty());
    }

    #[test]
    fn test_get_status_unknown_member() {
        let cluster = coordinator();
        let stranger = MemoryHandle::new("stranger");
        assert!(matches!(
            cluster.get_status(stranger.as_ref()),
            Err(ClusterError::UnknownMember { .. })
        ));
    }

    #[test]
    fn test_dismantle_resets_to_constructed_state() {
        let cluster = coordinator();
        let a = MemoryHandle::new("ta");
        let b = MemoryHandle::without_null_support("tb");
        cluster.add_database(a).unwrap();
        cluster.add_database(b).unwrap();
        settle(&cluster);
        assert!(!cluster.supports_null_vs_empty_string());

        cluster.dismantle();
        assert!(cluster.members().is_empty());
        assert!(cluster.supports_null_vs_empty_string());

        // A fresh single member after dismantle has no quorum floor.
        let fresh = MemoryHandle::new("fresh");
        cluster.add_database(fresh.clone()).unwrap();
        settle(&cluster);
        assert!(cluster.remove_database(fresh.as_ref()).unwrap());
    }

    #[test]
    fn test_restart_quarantined_requires_flag() {
        let cluster = coordinator();
        assert_eq!(cluster.restart_quarantined().unwrap(), 0);
    }
}
