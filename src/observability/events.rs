//! Observable cluster events
//!
//! Per OBSERVABILITY.md, every coordination-level occurrence worth a log
//! line is an explicit, typed event. Event names are stable identifiers;
//! dashboards and tests key on them.

use std::fmt;

use super::logger::Severity;

/// Observable events in the cluster core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Membership lifecycle
    /// A database was added to the cluster
    MemberAdded,
    /// A database was removed from the cluster
    MemberRemoved,
    /// A member changed status
    StatusChanged,
    /// A member was quarantined after an apply failure
    MemberQuarantined,
    /// A member was marked dead
    MemberDead,
    /// A member was restarted through the start sequence
    MemberRestarted,

    // Queue / worker
    /// A replica worker thread started
    WorkerStarted,
    /// A replica worker thread stopped
    WorkerStopped,
    /// An enqueue was rejected because the queue was full
    QueueRejected,
    /// An action failed against a backend
    ActionFailed,

    // Synchronization
    /// Synchronization began for a member
    SyncStarted,
    /// A member bootstrapped with nothing to copy
    SyncBootstrap,
    /// A template member was selected for a copy
    TemplateSelected,
    /// A template member was released back to service
    TemplateReleased,
    /// Synchronization finished
    SyncComplete,
    /// Synchronization failed
    SyncFailed,

    // Quorum
    /// A remove/quarantine was refused by the quorum floor
    QuorumRefused,

    // Authoritative settings
    /// The authoritative settings record was written
    SettingsPersisted,
    /// The authoritative settings record was read back
    SettingsRestored,
    /// The authoritative settings record was erased
    SettingsErased,
    /// Encryption failed and the record degraded to plaintext
    SettingsPlaintextFallback,

    // Cluster lifecycle
    /// The cluster was dismantled
    ClusterDismantled,
}

impl Event {
    /// Stable event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::MemberAdded => "MEMBER_ADDED",
            Event::MemberRemoved => "MEMBER_REMOVED",
            Event::StatusChanged => "STATUS_CHANGED",
            Event::MemberQuarantined => "MEMBER_QUARANTINED",
            Event::MemberDead => "MEMBER_DEAD",
            Event::MemberRestarted => "MEMBER_RESTARTED",
            Event::WorkerStarted => "WORKER_STARTED",
            Event::WorkerStopped => "WORKER_STOPPED",
            Event::QueueRejected => "QUEUE_REJECTED",
            Event::ActionFailed => "ACTION_FAILED",
            Event::SyncStarted => "SYNC_STARTED",
            Event::SyncBootstrap => "SYNC_BOOTSTRAP",
            Event::TemplateSelected => "TEMPLATE_SELECTED",
            Event::TemplateReleased => "TEMPLATE_RELEASED",
            Event::SyncComplete => "SYNC_COMPLETE",
            Event::SyncFailed => "SYNC_FAILED",
            Event::QuorumRefused => "QUORUM_REFUSED",
            Event::SettingsPersisted => "SETTINGS_PERSISTED",
            Event::SettingsRestored => "SETTINGS_RESTORED",
            Event::SettingsErased => "SETTINGS_ERASED",
            Event::SettingsPlaintextFallback => "SETTINGS_PLAINTEXT_FALLBACK",
            Event::ClusterDismantled => "CLUSTER_DISMANTLED",
        }
    }

    /// Default severity for this event.
    pub fn severity(&self) -> Severity {
        match self {
            Event::MemberQuarantined
            | Event::QueueRejected
            | Event::QuorumRefused
            | Event::SettingsPlaintextFallback => Severity::Warn,
            Event::ActionFailed | Event::SyncFailed | Event::MemberDead => Severity::Error,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_are_stable() {
        assert_eq!(Event::MemberAdded.as_str(), "MEMBER_ADDED");
        assert_eq!(Event::SyncComplete.as_str(), "SYNC_COMPLETE");
        assert_eq!(Event::QuorumRefused.as_str(), "QUORUM_REFUSED");
    }

    #[test]
    fn test_failure_events_are_not_info() {
        assert_eq!(Event::ActionFailed.severity(), Severity::Error);
        assert_eq!(Event::SyncFailed.severity(), Severity::Error);
        assert_eq!(Event::MemberQuarantined.severity(), Severity::Warn);
    }
}
