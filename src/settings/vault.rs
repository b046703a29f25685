//! Settings vault
//!
//! Per SETTINGS_PERSISTENCE.md §3, the vault wraps the raw store with the
//! record envelope: serialization, CRC32 integrity, and opportunistic
//! encryption with plaintext fallback in both directions.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::store::PersistenceStore;
use super::{SettingsError, SettingsResult};
use crate::backend::ConnectionSettings;
use crate::observability::{Event, Logger};

/// Optional cipher collaborator for settings records.
///
/// The cluster never fails an operation on a cipher error; it degrades to
/// plaintext and logs the fallback.
pub trait Encryption: Send + Sync {
    /// Encrypt a settings payload.
    fn encrypt(&self, plaintext: &[u8]) -> SettingsResult<Vec<u8>>;

    /// Decrypt a settings payload.
    fn decrypt(&self, ciphertext: &[u8]) -> SettingsResult<Vec<u8>>;
}

/// Persisted record envelope.
///
/// `checksum` is CRC32 over the plaintext settings JSON, so integrity is
/// checked after decryption and independently of it.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    label: String,
    encrypted: bool,
    payload: String,
    checksum: u32,
    updated_at: DateTime<Utc>,
}

/// Store for the authoritative settings record.
pub struct SettingsVault {
    store: Arc<dyn PersistenceStore>,
    encryption: Option<Arc<dyn Encryption>>,
}

impl SettingsVault {
    /// Create a vault over the given store.
    pub fn new(store: Arc<dyn PersistenceStore>, encryption: Option<Arc<dyn Encryption>>) -> Self {
        Self { store, encryption }
    }

    /// Persist the authoritative settings for a cluster label.
    pub fn store_settings(
        &self,
        label: &str,
        settings: &ConnectionSettings,
    ) -> SettingsResult<()> {
        let plaintext = serde_json::to_vec(settings)
            .map_err(|e| SettingsError::malformed(e.to_string()))?;
        let checksum = crc32fast::hash(&plaintext);

        let (payload, encrypted) = match &self.encryption {
            Some(cipher) => match cipher.encrypt(&plaintext) {
                Ok(ciphertext) => (ciphertext, true),
                Err(e) => {
                    let reason = e.to_string();
                    Logger::emit(
                        Event::SettingsPlaintextFallback,
                        &[("label", label), ("reason", &reason)],
                    );
                    (plaintext.clone(), false)
                }
            },
            None => (plaintext.clone(), false),
        };

        let envelope = Envelope {
            label: label.to_string(),
            encrypted,
            payload: STANDARD.encode(payload),
            checksum,
            updated_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| SettingsError::malformed(e.to_string()))?;
        self.store.put(label, &bytes)?;
        Logger::emit(Event::SettingsPersisted, &[("label", label)]);
        Ok(())
    }

    /// Load the authoritative settings for a cluster label.
    pub fn load_settings(&self, label: &str) -> SettingsResult<Option<ConnectionSettings>> {
        let Some(bytes) = self.store.get(label)? else {
            return Ok(None);
        };
        let envelope: Envelope = serde_json::from_slice(&bytes)
            .map_err(|e| SettingsError::malformed(e.to_string()))?;
        let payload = STANDARD
            .decode(envelope.payload.as_bytes())
            .map_err(|e| SettingsError::malformed(e.to_string()))?;

        let plaintext = if envelope.encrypted {
            match &self.encryption {
                Some(cipher) => match cipher.decrypt(&payload) {
                    Ok(plaintext) => plaintext,
                    // A cipher failure on read degrades to treating the
                    // payload as plaintext; the checksum decides whether
                    // that reading is usable.
                    Err(e) => {
                        let reason = e.to_string();
                        Logger::emit(
                            Event::SettingsPlaintextFallback,
                            &[("label", label), ("reason", &reason)],
                        );
                        payload
                    }
                },
                None => payload,
            }
        } else {
            payload
        };

        if crc32fast::hash(&plaintext) != envelope.checksum {
            return Err(SettingsError::Corrupt {
                label: label.to_string(),
            });
        }

        let settings: ConnectionSettings = serde_json::from_slice(&plaintext)
            .map_err(|e| SettingsError::malformed(e.to_string()))?;
        Logger::emit(Event::SettingsRestored, &[("label", label)]);
        Ok(Some(settings))
    }

    /// Erase the record for a cluster label.
    pub fn erase(&self, label: &str) -> SettingsResult<()> {
        self.store.remove(label)?;
        Logger::emit(Event::SettingsErased, &[("label", label)]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemoryStore;

    /// Byte-reversing "cipher" for tests.
    struct Reverser;

    impl Encryption for Reverser {
        fn encrypt(&self, plaintext: &[u8]) -> SettingsResult<Vec<u8>> {
            Ok(plaintext.iter().rev().copied().collect())
        }

        fn decrypt(&self, ciphertext: &[u8]) -> SettingsResult<Vec<u8>> {
            Ok(ciphertext.iter().rev().copied().collect())
        }
    }

    /// Cipher that always fails, to exercise the fallback path.
    struct Broken;

    impl Encryption for Broken {
        fn encrypt(&self, _plaintext: &[u8]) -> SettingsResult<Vec<u8>> {
            Err(SettingsError::cipher("no key material"))
        }

        fn decrypt(&self, _ciphertext: &[u8]) -> SettingsResult<Vec<u8>> {
            Err(SettingsError::cipher("no key material"))
        }
    }

    fn sample() -> ConnectionSettings {
        ConnectionSettings::new("postgres", "db://host/one", "app").with_password("hunter2")
    }

    #[test]
    fn test_plaintext_round_trip() {
        let vault = SettingsVault::new(Arc::new(MemoryStore::new()), None);
        vault.store_settings("main", &sample()).unwrap();
        let loaded = vault.load_settings("main").unwrap().unwrap();
        assert_eq!(loaded, sample());
    }

    #[test]
    fn test_encrypted_round_trip() {
        let vault = SettingsVault::new(Arc::new(MemoryStore::new()), Some(Arc::new(Reverser)));
        vault.store_settings("main", &sample()).unwrap();
        let loaded = vault.load_settings("main").unwrap().unwrap();
        assert_eq!(loaded, sample());
    }

    #[test]
    fn test_broken_cipher_degrades_to_plaintext() {
        let vault = SettingsVault::new(Arc::new(MemoryStore::new()), Some(Arc::new(Broken)));
        vault.store_settings("main", &sample()).unwrap();
        // The record was stored plaintext and reads back fine even though
        // the cipher still fails.
        let loaded = vault.load_settings("main").unwrap().unwrap();
        assert_eq!(loaded, sample());
    }

    #[test]
    fn test_absent_record_is_none() {
        let vault = SettingsVault::new(Arc::new(MemoryStore::new()), None);
        assert!(vault.load_settings("main").unwrap().is_none());
    }

    #[test]
    fn test_erase_removes_record() {
        let vault = SettingsVault::new(Arc::new(MemoryStore::new()), None);
        vault.store_settings("main", &sample()).unwrap();
        vault.erase("main").unwrap();
        assert!(vault.load_settings("main").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_checksum_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let vault = SettingsVault::new(store.clone(), None);
        vault.store_settings("main", &sample()).unwrap();

        // Tamper with the payload but keep the stored checksum.
        let bytes = store.get("main").unwrap().unwrap();
        let mut envelope: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let tampered = ConnectionSettings::new("postgres", "db://host/evil", "app");
        let tampered_b64 = STANDARD.encode(serde_json::to_vec(&tampered).unwrap());
        envelope["payload"] = serde_json::Value::String(tampered_b64);
        store
            .put("main", &serde_json::to_vec(&envelope).unwrap())
            .unwrap();

        assert!(matches!(
            vault.load_settings("main"),
            Err(SettingsError::Corrupt { .. })
        ));
    }
}
