//! OS secure storage backend.
//!
//! Uses the `keyring` crate: Keychain on macOS, Credential Manager on
//! Windows, the kernel keyring on Linux. Entries are scoped to a single
//! service name, so other applications cannot enumerate them by accident.

use super::SecretStore;
use crate::error::StoreError;

/// Secret store backed by the platform credential store
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    /// Create a store for the given service name
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, operation: &'static str, key: &str) -> Result<keyring::Entry, StoreError> {
        keyring::Entry::new(&self.service, key).map_err(|e| platform_error(operation, key, e))
    }
}

fn platform_error(operation: &'static str, key: &str, err: keyring::Error) -> StoreError {
    StoreError::Platform {
        operation,
        key: key.to_string(),
        status: err.to_string(),
    }
}

impl SecretStore for KeyringStore {
    fn save(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let entry = self.entry("save", key)?;
        // Replace rather than update so stale attributes never survive.
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {}
            Err(e) => return Err(platform_error("save", key, e)),
        }
        entry
            .set_secret(value)
            .map_err(|e| platform_error("save", key, e))?;
        tracing::debug!("Stored secret '{}' ({} bytes)", key, value.len());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let entry = self.entry("load", key)?;
        match entry.get_secret() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(platform_error("load", key, e)),
        }
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let entry = self.entry("delete", key)?;
        match entry.delete_credential() {
            Ok(()) => {
                tracing::debug!("Deleted secret '{}'", key);
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(platform_error("delete", key, e)),
        }
    }
}
