//! Secure credential storage
//!
//! A narrow, generic [`SecretStore`] holds opaque byte values under string
//! keys. [`CredentialStore`] layers the per-server password/key semantics and
//! the device-wide PIN record on top of it, so backends never need to know
//! what they are storing.

mod platform;
mod memory;

pub use platform::KeyringStore;
pub use memory::MemoryStore;

use std::sync::Arc;

use crate::error::StoreError;
use crate::types::ServerId;

/// Fixed key of the app-lock PIN record
pub const PIN_RECORD_KEY: &str = "app-lock-pin";

/// Opaque key/value secret storage.
///
/// All operations are synchronous. `save` replaces any existing value,
/// `delete` succeeds when the key is absent.
pub trait SecretStore: Send + Sync {
    /// Store `value` under `key`, replacing any previous value
    fn save(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Load the value stored under `key`
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Delete the value stored under `key`
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Key under which a server's password is stored
pub fn password_key(id: &ServerId) -> String {
    format!("ssh-password-{}", id)
}

/// Key under which a server's private key seed is stored
pub fn private_key_key(id: &ServerId) -> String {
    format!("ssh-key-{}", id)
}

/// Typed access to per-server credentials and the PIN record
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<dyn SecretStore>,
}

impl CredentialStore {
    /// Wrap a secret store backend
    pub fn new(inner: Arc<dyn SecretStore>) -> Self {
        Self { inner }
    }

    /// Convenience constructor for an in-memory store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Access the underlying generic store
    pub fn backend(&self) -> &Arc<dyn SecretStore> {
        &self.inner
    }

    /// Stored SSH password for a server
    pub fn password(&self, id: &ServerId) -> Result<Option<String>, StoreError> {
        let key = password_key(id);
        match self.inner.load(&key)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| StoreError::Encoding { key }),
            None => Ok(None),
        }
    }

    /// Store the SSH password for a server
    pub fn save_password(&self, id: &ServerId, password: &str) -> Result<(), StoreError> {
        self.inner.save(&password_key(id), password.as_bytes())
    }

    /// Stored private key seed for a server
    pub fn private_key(&self, id: &ServerId) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.load(&private_key_key(id))
    }

    /// Store the private key seed for a server
    pub fn save_private_key(&self, id: &ServerId, seed: &[u8]) -> Result<(), StoreError> {
        self.inner.save(&private_key_key(id), seed)
    }

    /// Delete every secret belonging to a server
    pub fn delete_server(&self, id: &ServerId) -> Result<(), StoreError> {
        self.inner.delete(&password_key(id))?;
        self.inner.delete(&private_key_key(id))
    }

    /// Stored PIN record (salt followed by hash)
    pub fn pin_record(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.load(PIN_RECORD_KEY)
    }

    /// Replace the PIN record
    pub fn save_pin_record(&self, record: &[u8]) -> Result<(), StoreError> {
        self.inner.save(PIN_RECORD_KEY, record)
    }

    /// Delete the PIN record
    pub fn delete_pin_record(&self) -> Result<(), StoreError> {
        self.inner.delete(PIN_RECORD_KEY)
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore").finish_non_exhaustive()
    }
}
