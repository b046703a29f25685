//! Synchronization protocol
//!
//! Per SYNC_PROTOCOL.md:
//! - A (re)started member must reach parity with the cluster before it
//!   serves reads or applies ordinary writes; its start sequence enqueues
//!   one [`SyncAction`] as the first item in its queue
//! - The template is resolved when the action RUNS, not when it is
//!   enqueued, so the freshest READY member is always the source
//! - Ordinary writes fanned out during the copy queue up behind the sync
//!   action; none are lost, they simply wait
//! - A failed copy quarantines the target rather than leaving it stuck
//!   mid-synchronization
//!
//! The concrete copy mechanism is the [`Synchronizer`] collaborator's
//! responsibility; the core's contract is only "the target is logically
//! equal to the template at the instant the copy runs".

use std::sync::{Arc, Weak};

use super::errors::ClusterError;
use super::members::MemberList;
use super::status::ReplicaStatus;
use crate::backend::{Action, BackendError, BackendResult, DatabaseHandle};
use crate::observability::{Event, Logger};

/// A resolved copy source: either a marked cluster member or a handle
/// rebuilt from authoritative settings.
pub struct Template {
    /// The source backend.
    pub handle: Arc<dyn DatabaseHandle>,
    /// The member key, when the source is a cluster member (it was marked
    /// TEMPLATE and must be released after the copy window).
    pub member_key: Option<String>,
}

/// Resolves copy sources for joining members.
///
/// Implemented by the coordinator: a READY member first, the persisted
/// authoritative settings as the self-healing fallback. `Ok(None)` means
/// "nothing to copy" (the target is the cluster's first database).
pub trait TemplateProvider: Send + Sync {
    /// Find a template for the member with key `exclude_key`.
    fn template_for(&self, exclude_key: &str) -> Result<Option<Template>, ClusterError>;

    /// Return a borrowed template to service after the copy window.
    fn release_template(&self, template: &Template);
}

/// The copy mechanism collaborator.
pub trait Synchronizer: Send + Sync {
    /// Leave `target` logically equal to `template`, guaranteeing at least
    /// `required_tables` exist on the target.
    fn synchronize(
        &self,
        target: &dyn DatabaseHandle,
        template: &dyn DatabaseHandle,
        required_tables: &[String],
    ) -> BackendResult<()>;
}

/// Default table-by-table copy: every template table plus the required
/// tables, snapshot then restore. Required tables missing on the template
/// are created empty on the target.
pub struct TableSynchronizer;

impl Synchronizer for TableSynchronizer {
    fn synchronize(
        &self,
        target: &dyn DatabaseHandle,
        template: &dyn DatabaseHandle,
        required_tables: &[String],
    ) -> BackendResult<()> {
        let mut tables: Vec<String> = required_tables.to_vec();
        for table in template.table_names()? {
            if !tables.contains(&table) {
                tables.push(table);
            }
        }
        for table in &tables {
            let rows = match template.snapshot_table(table) {
                Ok(rows) => rows,
                Err(BackendError::UnknownTable { .. }) => Vec::new(),
                Err(e) => return Err(e),
            };
            target.restore_table(table, rows)?;
        }
        Ok(())
    }
}

/// Collaborators a member list needs to build join-time sync actions.
pub(crate) struct SyncContext {
    pub provider: Weak<dyn TemplateProvider>,
    pub synchronizer: Arc<dyn Synchronizer>,
    pub required_tables: Vec<String>,
}

/// The first action in every (re)started member's queue.
pub struct SyncAction {
    target_key: String,
    provider: Weak<dyn TemplateProvider>,
    members: Weak<MemberList>,
    synchronizer: Arc<dyn Synchronizer>,
    required_tables: Vec<String>,
}

impl SyncAction {
    pub(crate) fn new(
        target_key: String,
        provider: Weak<dyn TemplateProvider>,
        members: Weak<MemberList>,
        synchronizer: Arc<dyn Synchronizer>,
        required_tables: Vec<String>,
    ) -> Self {
        Self {
            target_key,
            provider,
            members,
            synchronizer,
            required_tables,
        }
    }

    fn short(&self) -> &str {
        self.target_key.get(..12).unwrap_or(&self.target_key)
    }

    fn set_target_status(&self, status: ReplicaStatus) {
        if let Some(members) = self.members.upgrade() {
            let _ = members.set_status_by_key(&self.target_key, status);
        }
    }
}

impl Action for SyncAction {
    fn apply(&self, db: &dyn DatabaseHandle) -> BackendResult<()> {
        let Some(provider) = self.provider.upgrade() else {
            return Err(BackendError::unavailable("cluster no longer exists"));
        };

        let template = match provider.template_for(&self.target_key) {
            Ok(Some(template)) => template,
            // First database of the cluster: nothing to copy.
            Ok(None) | Err(ClusterError::OnlyOneDatabaseInCluster) => {
                Logger::emit(Event::SyncBootstrap, &[("member", self.short())]);
                return Ok(());
            }
            Err(e) => return Err(BackendError::unavailable(e.to_string())),
        };

        Logger::emit(Event::SyncStarted, &[("member", self.short())]);
        self.set_target_status(ReplicaStatus::Synchronizing);
        let result =
            self.synchronizer
                .synchronize(db, template.handle.as_ref(), &self.required_tables);
        provider.release_template(&template);
        self.set_target_status(ReplicaStatus::Processing);

        match &result {
            Ok(()) => Logger::emit(Event::SyncComplete, &[("member", self.short())]),
            Err(error) => {
                let message = error.to_string();
                Logger::emit(
                    Event::SyncFailed,
                    &[("member", self.short()), ("error", &message)],
                );
            }
        }
        result
    }

    fn describe(&self) -> String {
        format!("synchronize:{}", self.short())
    }
}
