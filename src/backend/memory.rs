//! In-memory backend
//!
//! Test twin for a vendor backend, also usable as a real memory-only
//! cluster member. Keeps an ordered journal of every applied statement so
//! tests can assert per-replica FIFO, and offers explicit failure
//! injection points.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::errors::{BackendError, BackendResult};
use super::handle::{ConnectionSettings, DatabaseHandle, ReconnectFactory, Row};

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Vec<Row>>,
    journal: Vec<String>,
    fail_next: Option<String>,
    fail_all: Option<String>,
}

/// An in-memory database backend.
#[derive(Debug)]
pub struct MemoryHandle {
    settings: ConnectionSettings,
    memory_only: bool,
    null_vs_empty: bool,
    state: Mutex<MemoryState>,
}

impl MemoryHandle {
    /// Create a volatile in-memory backend.
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            settings: ConnectionSettings::new("memory", format!("mem://{name}"), "local"),
            memory_only: true,
            null_vs_empty: true,
            state: Mutex::new(MemoryState::default()),
        })
    }

    /// Create a backend that reports itself as disk-backed, so its settings
    /// are eligible for the authoritative record.
    pub fn durable(name: &str) -> Arc<Self> {
        Arc::new(Self {
            settings: ConnectionSettings::new("memory", format!("file://{name}"), "local"),
            memory_only: false,
            null_vs_empty: true,
            state: Mutex::new(MemoryState::default()),
        })
    }

    /// Create a backend whose vendor cannot distinguish NULL from the empty
    /// string.
    pub fn without_null_support(name: &str) -> Arc<Self> {
        Arc::new(Self {
            settings: ConnectionSettings::new("memory", format!("mem://{name}"), "local"),
            memory_only: true,
            null_vs_empty: false,
            state: Mutex::new(MemoryState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Statements applied to this backend, in application order.
    /// Synchronization copies appear as `sync:<table>` entries.
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    /// Fail the next execute with the given message.
    pub fn inject_failure(&self, message: impl Into<String>) {
        self.lock().fail_next = Some(message.into());
    }

    /// Fail every subsequent execute until cleared with `recover`.
    pub fn break_connection(&self, message: impl Into<String>) {
        self.lock().fail_all = Some(message.into());
    }

    /// Clear a `break_connection` failure.
    pub fn recover(&self) {
        self.lock().fail_all = None;
    }

    /// Replace a table's rows directly, bypassing the journal.
    pub fn put_rows(&self, table: &str, rows: Vec<Row>) {
        self.lock().tables.insert(table.to_string(), rows);
    }

    /// Row count of a table, 0 if absent.
    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map(Vec::len).unwrap_or(0)
    }

    /// Whether the named table exists.
    pub fn has_table(&self, table: &str) -> bool {
        self.lock().tables.contains_key(table)
    }
}

impl DatabaseHandle for MemoryHandle {
    fn settings(&self) -> ConnectionSettings {
        self.settings.clone()
    }

    fn is_memory_only(&self) -> bool {
        self.memory_only
    }

    fn native_supports_null_vs_empty_string(&self) -> bool {
        self.null_vs_empty
    }

    fn execute(&self, statement: &str) -> BackendResult<u64> {
        let mut state = self.lock();
        if let Some(message) = state.fail_next.take() {
            return Err(BackendError::execution(message));
        }
        if let Some(message) = &state.fail_all {
            return Err(BackendError::connection(message.clone()));
        }
        state.journal.push(statement.to_string());
        Ok(1)
    }

    fn query(&self, statement: &str) -> BackendResult<Vec<Row>> {
        let table = statement
            .trim()
            .to_ascii_lowercase()
            .strip_prefix("select * from ")
            .map(str::to_string)
            .unwrap_or_else(|| statement.trim().to_string());
        let state = self.lock();
        if let Some(message) = &state.fail_all {
            return Err(BackendError::connection(message.clone()));
        }
        state
            .tables
            .get(&table)
            .cloned()
            .ok_or_else(|| BackendError::unknown_table(table))
    }

    fn table_names(&self) -> BackendResult<Vec<String>> {
        Ok(self.lock().tables.keys().cloned().collect())
    }

    fn snapshot_table(&self, table: &str) -> BackendResult<Vec<Row>> {
        self.lock()
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| BackendError::unknown_table(table))
    }

    fn restore_table(&self, table: &str, rows: Vec<Row>) -> BackendResult<()> {
        let mut state = self.lock();
        if let Some(message) = &state.fail_all {
            return Err(BackendError::connection(message.clone()));
        }
        if let Some(message) = state.fail_next.take() {
            return Err(BackendError::execution(message));
        }
        state.journal.push(format!("sync:{table}"));
        state.tables.insert(table.to_string(), rows);
        Ok(())
    }
}

/// Reconnect factory over a fixed registry of memory backends.
///
/// Stands in for a vendor driver when exercising the auto-rebuild path.
#[derive(Default)]
pub struct MemoryFactory {
    registry: Mutex<BTreeMap<String, Arc<MemoryHandle>>>,
}

impl MemoryFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle under its settings key.
    pub fn register(&self, handle: Arc<MemoryHandle>) {
        let key = handle.settings_key();
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, handle);
    }
}

impl ReconnectFactory for MemoryFactory {
    fn connect(&self, settings: &ConnectionSettings) -> BackendResult<Arc<dyn DatabaseHandle>> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&settings.key())
            .cloned()
            .map(|handle| handle as Arc<dyn DatabaseHandle>)
            .ok_or_else(|| {
                BackendError::connection(format!("no backend at {}", settings.redacted()))
            })
    }
}
