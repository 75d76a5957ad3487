//! Shared state for commands: configuration, server list and credentials

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use vg_core::config::{self, ClientConfig, ServerStore};
use vg_core::error::ConfigError;
use vg_core::{CredentialStore, KeyringStore, LockManager, ServerIdentity};
use vg_orchestrator::Orchestrator;

/// Everything a command needs to act on the configured servers
pub struct AppContext {
    pub config: ClientConfig,
    pub config_path: PathBuf,
    pub store: ServerStore,
    pub credentials: CredentialStore,
    pub ephemeral: bool,
}

impl AppContext {
    /// Load the configuration and open the stores.
    ///
    /// A missing config file means defaults. With `ephemeral` set, secrets
    /// live in memory only and are gone when the process exits.
    pub fn load(
        config_path: Option<&Path>,
        servers_path: Option<&Path>,
        ephemeral: bool,
    ) -> Result<Self> {
        let config_path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(config::default_config_path);
        let config = load_client_config(&config_path)?;

        let store = match servers_path {
            Some(path) => ServerStore::new(path),
            None => ServerStore::open_default(),
        };

        let credentials = if ephemeral {
            CredentialStore::in_memory()
        } else {
            CredentialStore::new(Arc::new(KeyringStore::new(config.keyring_service.clone())))
        };

        Ok(Self {
            config,
            config_path,
            store,
            credentials,
            ephemeral,
        })
    }

    /// An orchestrator over this context's stores
    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::with_defaults(
            self.config.clone(),
            self.credentials.clone(),
            self.store.clone(),
        )
    }

    /// The app lock backed by this context's credential store
    pub fn lock_manager(&self) -> Result<LockManager> {
        LockManager::new(self.credentials.clone(), self.config.lock.clone())
            .context("Failed to read the app lock PIN")
    }

    /// Find a configured server by ID, name or unique ID prefix
    pub fn resolve_server(&self, query: &str) -> Result<ServerIdentity> {
        let servers = self
            .store
            .load()
            .with_context(|| format!("Failed to read {:?}", self.store.path()))?;
        resolve(servers, query)
    }
}

fn load_client_config(path: &Path) -> Result<ClientConfig> {
    match config::load_config(path) {
        Ok(config) => Ok(config),
        Err(ConfigError::NotFound(_)) => Ok(ClientConfig::default()),
        Err(e) => Err(e).with_context(|| format!("Failed to load config from {:?}", path)),
    }
}

fn resolve(servers: Vec<ServerIdentity>, query: &str) -> Result<ServerIdentity> {
    if let Some(server) = servers.iter().find(|s| s.id.as_str() == query) {
        return Ok(server.clone());
    }

    let named: Vec<&ServerIdentity> = servers.iter().filter(|s| s.name == query).collect();
    match named.as_slice() {
        [server] => return Ok((*server).clone()),
        [] => {}
        _ => bail!("More than one server is named '{}'; use its ID", query),
    }

    let prefixed: Vec<&ServerIdentity> = servers
        .iter()
        .filter(|s| s.id.as_str().starts_with(query))
        .collect();
    match prefixed.as_slice() {
        [server] => Ok((*server).clone()),
        [] => bail!("No server matches '{}'", query),
        _ => bail!("'{}' matches more than one server ID", query),
    }
}
