//! Authoritative settings persistence
//!
//! Per SETTINGS_PERSISTENCE.md:
//! - When auto-rebuild is enabled, the cluster persists the connection
//!   settings of one representative replica, keyed by the cluster label,
//!   so a restarted process can reconstruct its last known-good member
//!   without the caller re-supplying connection details
//! - Storage goes through an explicit [`PersistenceStore`] collaborator
//!   with an explicit lifecycle; there is no process-wide implicit state
//! - Encryption is opportunistic: an encryption failure degrades to
//!   plaintext storage rather than failing the operation
//! - Records carry a CRC32 checksum over the settings payload; a checksum
//!   mismatch on read is corruption and the record is rejected

mod store;
mod vault;

pub use store::{FileStore, MemoryStore, PersistenceStore};
pub use vault::{Encryption, SettingsVault};

use thiserror::Error;

/// Result type for settings persistence
pub type SettingsResult<T> = Result<T, SettingsError>;

/// Errors from the settings persistence layer
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Underlying store I/O failed
    #[error("settings store failure: {message}")]
    Store { message: String },

    /// The record failed to serialize or deserialize
    #[error("settings record malformed: {message}")]
    Malformed { message: String },

    /// The record's checksum did not match its payload
    #[error("settings record for '{label}' is corrupt")]
    Corrupt { label: String },

    /// Encryption or decryption failed
    #[error("settings cipher failure: {message}")]
    Cipher { message: String },
}

impl SettingsError {
    /// Create a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a malformed-record error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Create a cipher error.
    pub fn cipher(message: impl Into<String>) -> Self {
        Self::Cipher {
            message: message.into(),
        }
    }
}
