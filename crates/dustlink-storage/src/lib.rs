//! Dust API key storage using the OS keychain.
//!
//! `DUST_API_KEY` in the environment always wins. When it is absent the
//! binary falls back to a key saved with `dustlink auth set-key`, held in:
//!
//! - **macOS**: Keychain Services
//! - **Windows**: Credential Manager
//! - **Linux**: Secret Service (GNOME Keyring / KWallet)

use std::collections::HashMap;
use std::sync::RwLock;

use dustlink_core::{Config, Error, Result};
use keyring::Entry;
use tracing::{debug, info, warn};

/// Service name used in OS keychain.
const SERVICE_NAME: &str = "dustlink";

/// Keychain entry holding the Dust API key.
pub const API_KEY_ENTRY: &str = "dust/api_key";

/// Secret storage backend.
pub trait CredentialStore: Send + Sync {
    /// Store a secret under `key`, replacing any previous value.
    fn store(&self, key: &str, value: &str) -> Result<()>;

    /// Returns `Ok(None)` if nothing is stored under `key`.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Succeeds even if nothing was stored.
    fn delete(&self, key: &str) -> Result<()>;

    fn exists(&self, key: &str) -> bool {
        matches!(self.get(key), Ok(Some(_)))
    }
}

/// Fill in the API key from `store` when the environment did not provide one.
///
/// Returns `true` if the key was taken from the store. A store failure is
/// logged and treated as "no key" so that `validate` reports the usual
/// missing-key error.
pub fn resolve_api_key(config: &mut Config, store: &dyn CredentialStore) -> bool {
    if config.dust.usable_api_key().is_some() {
        return false;
    }

    match store.get(API_KEY_ENTRY) {
        Ok(Some(key)) => {
            debug!("Using Dust API key from keychain");
            config.dust.api_key = Some(key);
            true
        }
        Ok(None) => false,
        Err(e) => {
            warn!(error = %e, "Could not read Dust API key from keychain");
            false
        }
    }
}

// =============================================================================
// KeychainStore
// =============================================================================

#[derive(Debug)]
pub struct KeychainStore {
    service_name: String,
}

impl KeychainStore {
    pub fn new() -> Self {
        Self {
            service_name: SERVICE_NAME.to_string(),
        }
    }

    /// Use a different keychain service, e.g. to keep test entries apart.
    pub fn with_service_name(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service_name, key).map_err(|e| {
            Error::Storage(format!(
                "Failed to open keychain entry '{}': {}",
                key, e
            ))
        })
    }
}

impl Default for KeychainStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeychainStore {
    fn store(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| Error::Storage(format!("Failed to store '{}': {}", key, e)))?;
        info!(key = key, service = %self.service_name, "Secret saved to keychain");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => {
                debug!(key = key, "No keychain entry");
                Ok(None)
            }
            Err(e) => Err(Error::Storage(format!(
                "Failed to read '{}': {}",
                key, e
            ))),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) => {
                info!(key = key, "Secret removed from keychain");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(Error::Storage(format!(
                "Failed to delete '{}': {}",
                key, e
            ))),
        }
    }
}

// =============================================================================
// MemoryStore
// =============================================================================

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    secrets: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_key(key: impl Into<String>) -> Self {
        let mut secrets = HashMap::new();
        secrets.insert(API_KEY_ENTRY.to_string(), key.into());
        Self {
            secrets: RwLock::new(secrets),
        }
    }
}

impl CredentialStore for MemoryStore {
    fn store(&self, key: &str, value: &str) -> Result<()> {
        self.secrets
            .write()
            .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let secrets = self
            .secrets
            .read()
            .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))?;
        Ok(secrets.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.secrets
            .write()
            .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))?
            .remove(key);
        Ok(())
    }
}
