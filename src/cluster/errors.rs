//! Cluster error types
//!
//! Per CLUSTER_MODEL.md §7:
//! - Structural errors (quorum violation, single-member misuse) are
//!   synchronous and returned to the immediate caller
//! - Backend failures never cross a replica boundary; they surface as a
//!   quarantine transition plus a recorded failure message

use thiserror::Error;

use super::status::ReplicaStatus;

/// Result type for cluster operations
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors raised by the coordination core
#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    // ==================
    // Unavailability
    // ==================
    /// No READY replica exists when one is required (read request or
    /// template search). Recoverable: the caller may wait and retry.
    #[error("no database available to service the request")]
    NoAvailableDatabase,

    // ==================
    // Structural refusals
    // ==================
    /// Removing or quarantining the target would leave a multi-member
    /// cluster with no READY replica. The operation is rejected and the
    /// cluster is unchanged.
    #[error("cannot remove last available database from cluster")]
    UnableToRemoveLastDatabaseFromCluster,

    /// A template was requested but the cluster legitimately has a single
    /// member and is not configured to self-heal from persisted settings.
    #[error("only one database in cluster, no template available")]
    OnlyOneDatabaseInCluster,

    // ==================
    // Per-member conditions
    // ==================
    /// The replication queue is full; the action was rejected so one slow
    /// replica cannot stall the rest of the cluster.
    #[error("replication queue for '{key}' is full ({capacity} pending)")]
    QueueFull { key: String, capacity: usize },

    /// The handle does not resolve to a current cluster member.
    #[error("database '{key}' is not a member of this cluster")]
    UnknownMember { key: String },

    /// The member is DEAD; DEAD is terminal and accepts no transitions.
    #[error("database '{key}' is dead and accepts no further transitions")]
    MemberDead { key: String },

    /// The member's current status does not retain a queue, so it cannot
    /// accept actions.
    #[error("database '{key}' cannot accept actions while {status}")]
    QueueUnavailable { key: String, status: ReplicaStatus },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_error_message() {
        assert_eq!(
            ClusterError::UnableToRemoveLastDatabaseFromCluster.to_string(),
            "cannot remove last available database from cluster"
        );
    }

    #[test]
    fn test_queue_full_names_member_and_capacity() {
        let err = ClusterError::QueueFull {
            key: "abc123".to_string(),
            capacity: 64,
        };
        let text = err.to_string();
        assert!(text.contains("abc123"));
        assert!(text.contains("64"));
    }

    #[test]
    fn test_queue_unavailable_names_status() {
        let err = ClusterError::QueueUnavailable {
            key: "abc123".to_string(),
            status: ReplicaStatus::Quarantined,
        };
        assert!(err.to_string().contains("quarantined"));
    }
}
