//! Database handle boundary
//!
//! Per CLUSTER_MODEL.md §2:
//! - A handle is a locally-held connection to one physical backend
//! - Identity is derived from connection settings, never from the object
//!   reference, so reconnecting to the same physical database resolves to
//!   the same cluster member
//! - Vendor retry/exception semantics stay behind this boundary

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::errors::BackendResult;

/// A single result row, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Connection settings for one physical backend.
///
/// The identity fields (driver, url, username) define the stable member
/// key. Password and extra parameters never contribute: a reconnect with a
/// rotated password still resolves to the same member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Vendor driver name, e.g. `postgres` or `memory`
    pub driver: String,
    /// Connection URL
    pub url: String,
    /// Login user
    pub username: String,
    /// Login password, if the backend requires one
    #[serde(default)]
    pub password: Option<String>,
    /// Vendor-specific extra parameters, ordered for stable serialization
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl ConnectionSettings {
    /// Create settings for the given driver, url and username.
    pub fn new(
        driver: impl Into<String>,
        url: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            driver: driver.into(),
            url: url.into(),
            username: username.into(),
            password: None,
            params: BTreeMap::new(),
        }
    }

    /// Set the password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Add a vendor parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Stable member key: hex SHA-256 over the identity fields.
    ///
    /// The digest input uses an unambiguous `field\n` framing so that
    /// (`a`, `bc`) and (`ab`, `c`) cannot collide.
    pub fn key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.driver.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.url.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.username.as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(64);
        for byte in digest {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }

    /// Loggable form: identity fields only, never the password.
    pub fn redacted(&self) -> String {
        format!("{}:{}@{}", self.driver, self.username, self.url)
    }
}

/// An opaque connection to one physical database backend.
///
/// Implementations own their vendor's retry and exception semantics; the
/// cluster core only observes success or a [`super::BackendError`].
pub trait DatabaseHandle: Send + Sync {
    /// The settings this handle was opened with.
    fn settings(&self) -> ConnectionSettings;

    /// Stable member key derived from the settings.
    fn settings_key(&self) -> String {
        self.settings().key()
    }

    /// Memory-only backends lose their contents on process exit and are
    /// never persisted as the authoritative cluster record.
    fn is_memory_only(&self) -> bool;

    /// Whether the vendor distinguishes NULL from the empty string. The
    /// cluster degrades to the AND across all members.
    fn native_supports_null_vs_empty_string(&self) -> bool;

    /// Execute a vendor statement, returning the affected row count.
    fn execute(&self, statement: &str) -> BackendResult<u64>;

    /// Run a query and return its rows.
    fn query(&self, statement: &str) -> BackendResult<Vec<Row>>;

    /// Names of all tables currently present on this backend.
    fn table_names(&self) -> BackendResult<Vec<String>>;

    /// Read a full table for synchronization.
    fn snapshot_table(&self, table: &str) -> BackendResult<Vec<Row>>;

    /// Replace a table's contents (creating it if absent) during
    /// synchronization.
    fn restore_table(&self, table: &str, rows: Vec<Row>) -> BackendResult<()>;
}

impl fmt::Debug for dyn DatabaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DatabaseHandle({})", self.settings().redacted())
    }
}

/// Reopens a handle from persisted settings.
///
/// Used by the self-healing path: when auto-rebuild is enabled the cluster
/// persists the authoritative member's settings and reconstructs a handle
/// from them on restart.
pub trait ReconnectFactory: Send + Sync {
    /// Open a new handle for the given settings.
    fn connect(&self, settings: &ConnectionSettings) -> BackendResult<Arc<dyn DatabaseHandle>>;
}
