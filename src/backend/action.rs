//! Replication actions
//!
//! Per CLUSTER_MODEL.md §2, an action is an opaque, replayable unit of work
//! (insert/update/delete/DDL) with a deterministic effect on any backend.
//! The query layer produces them; the cluster core only queues them and
//! applies them in FIFO order per replica.

use super::errors::BackendResult;
use super::handle::DatabaseHandle;

/// A replayable unit of work applied identically to every replica's queue.
pub trait Action: Send + Sync {
    /// Apply this action to one backend.
    fn apply(&self, db: &dyn DatabaseHandle) -> BackendResult<()>;

    /// Short description for logs and failure records.
    fn describe(&self) -> String;
}

/// The ordinary write action: a single vendor statement.
///
/// This is what the surrounding query layer hands the coordinator for every
/// insert/update/delete/DDL it generates.
#[derive(Debug, Clone)]
pub struct StatementAction {
    statement: String,
}

impl StatementAction {
    /// Wrap a vendor statement.
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
        }
    }

    /// The wrapped statement text.
    pub fn statement(&self) -> &str {
        &self.statement
    }
}

impl Action for StatementAction {
    fn apply(&self, db: &dyn DatabaseHandle) -> BackendResult<()> {
        db.execute(&self.statement).map(|_| ())
    }

    fn describe(&self) -> String {
        self.statement.clone()
    }
}
