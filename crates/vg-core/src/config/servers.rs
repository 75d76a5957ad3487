//! Persisted list of configured servers
//!
//! Only non-secret metadata lives here; passwords and keys are kept in the
//! credential store.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::types::{ServerId, ServerIdentity};

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServerFile {
    #[serde(default, rename = "server")]
    servers: Vec<ServerIdentity>,
}

/// TOML-backed store of server identities
#[derive(Debug, Clone)]
pub struct ServerStore {
    path: PathBuf,
}

impl ServerStore {
    /// Open a store at the given path. The file is created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Open the store at the default location
    pub fn open_default() -> Self {
        Self::new(super::default_servers_path())
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all persisted servers
    pub fn load(&self) -> Result<Vec<ServerIdentity>, ConfigError> {
        match super::load_config::<ServerFile>(&self.path) {
            Ok(file) => Ok(file.servers),
            Err(ConfigError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Look up one server
    pub fn get(&self, id: &ServerId) -> Result<Option<ServerIdentity>, ConfigError> {
        Ok(self.load()?.into_iter().find(|s| &s.id == id))
    }

    /// Insert or replace a server
    pub fn upsert(&self, server: &ServerIdentity) -> Result<(), ConfigError> {
        let mut servers = self.load()?;
        match servers.iter_mut().find(|s| s.id == server.id) {
            Some(existing) => *existing = server.clone(),
            None => servers.push(server.clone()),
        }
        self.write(servers)
    }

    /// Remove a server; returns whether it existed
    pub fn remove(&self, id: &ServerId) -> Result<bool, ConfigError> {
        let mut servers = self.load()?;
        let before = servers.len();
        servers.retain(|s| &s.id != id);
        let removed = servers.len() != before;
        if removed {
            self.write(servers)?;
        }
        Ok(removed)
    }

    fn write(&self, servers: Vec<ServerIdentity>) -> Result<(), ConfigError> {
        super::save_config(&self.path, &ServerFile { servers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_store_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ServerStore::new(dir.path().join("servers.toml"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_upsert_roundtrips_all_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = ServerStore::new(dir.path().join("servers.toml"));

        let mut server = ServerIdentity::new("10.0.0.5", "pi");
        server.ssh_port = 2222;
        server.agent_port = 9000;
        store.upsert(&server).unwrap();

        server.has_key_installed = true;
        store.upsert(&server).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, vec![server]);
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = ServerStore::new(dir.path().join("servers.toml"));
        let a = ServerIdentity::new("a.local", "pi");
        let b = ServerIdentity::new("b.local", "pi");
        store.upsert(&a).unwrap();
        store.upsert(&b).unwrap();

        assert!(store.remove(&a.id).unwrap());
        assert!(!store.remove(&a.id).unwrap());
        assert_eq!(store.get(&b.id).unwrap(), Some(b));
        assert_eq!(store.get(&a.id).unwrap(), None);
    }
}
