//! Backend error types
//!
//! Errors crossing the backend boundary. Per CLUSTER_MODEL.md §7 these are
//! isolated at the queue-worker boundary: a failing backend quarantines its
//! own replica and is never propagated to other replicas or to unrelated
//! callers.

use thiserror::Error;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors raised by a database handle or by an action applied to one
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// A vendor statement failed to execute
    #[error("statement execution failed: {message}")]
    Execution { message: String },

    /// A query failed
    #[error("query failed: {message}")]
    Query { message: String },

    /// The named table does not exist on this backend
    #[error("unknown table '{table}'")]
    UnknownTable { table: String },

    /// The backend (or a collaborator it needs) is unreachable
    #[error("backend unavailable: {message}")]
    Unavailable { message: String },

    /// Connecting to the backend failed
    #[error("connection failed: {message}")]
    Connection { message: String },
}

impl BackendError {
    /// Create an execution error.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Create a query error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    /// Create an unknown-table error.
    pub fn unknown_table(table: impl Into<String>) -> Self {
        Self::UnknownTable {
            table: table.into(),
        }
    }

    /// Create an unavailability error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }
}
