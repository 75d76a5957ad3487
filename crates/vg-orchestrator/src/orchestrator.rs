//! Connection orchestrator
//!
//! Runs one [`SessionManager`] per configured server. A driver task per server
//! follows the manager's phase transitions, maps them to a caller-visible
//! [`ConnectionStatus`] and performs the step each phase needs: opening the
//! tunnel, probing the agent and streaming statistics.

use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use vg_core::config::{ClientConfig, ServerStore};
use vg_core::{
    ConnectionPhase, ConnectionStatus, CredentialStore, ErrorKind, ServerId, ServerIdentity,
    SessionError,
};
use vg_tunnel::{ClientKey, ExponentialBackoff, RusshTransport, SessionManager, Transport};

use crate::agent::{AgentClient, HttpAgentClient};
use crate::error::OrchestratorError;

/// Capacity of the orchestrator event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Statistics buffered between the agent stream and the event channel
const STATS_CHANNEL_CAPACITY: usize = 16;

/// Events published by the orchestrator
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// A server's status changed
    StatusChanged {
        server_id: ServerId,
        status: ConnectionStatus,
    },
    /// A statistics sample arrived
    Stats { server_id: ServerId, snapshot: Value },
    /// The generated public key is installed on the server
    KeyInstalled { server_id: ServerId },
    /// Installing the generated key failed; password login keeps working
    KeyInstallFailed { server_id: ServerId, error: String },
}

/// Snapshot of one managed server
#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    pub identity: ServerIdentity,
    pub phase: ConnectionPhase,
    pub status: ConnectionStatus,
}

/// Drives every configured server
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    credentials: CredentialStore,
    store: ServerStore,
    /// Serialises read-modify-write cycles on the server list
    persist_lock: Mutex<()>,
    transport: Arc<dyn Transport>,
    agent: Arc<dyn AgentClient>,
    servers: DashMap<ServerId, ServerEntry>,
    events_tx: broadcast::Sender<OrchestratorEvent>,
}

struct ServerEntry {
    manager: SessionManager,
    status: watch::Receiver<ConnectionStatus>,
    /// Parent of the driver and every task working on this server
    cancel: CancellationToken,
    driver: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerEntry {
    /// Cancel all work and close the session without reconnecting
    async fn shutdown(self) {
        self.cancel.cancel();
        self.manager.shutdown().await;
        for task in self.tasks {
            let _ = task.await;
        }
        let _ = self.driver.await;
    }
}

impl Orchestrator {
    /// Create an orchestrator with explicit transport and agent client
    pub fn new(
        config: ClientConfig,
        credentials: CredentialStore,
        store: ServerStore,
        transport: Arc<dyn Transport>,
        agent: Arc<dyn AgentClient>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                credentials,
                store,
                persist_lock: Mutex::new(()),
                transport,
                agent,
                servers: DashMap::new(),
                events_tx,
            }),
        }
    }

    /// Create an orchestrator that speaks SSH and HTTP to real hosts
    pub fn with_defaults(
        config: ClientConfig,
        credentials: CredentialStore,
        store: ServerStore,
    ) -> Self {
        let transport = Arc::new(RusshTransport::new(&config));
        let agent = Arc::new(HttpAgentClient::new(config.connect_timeout));
        Self::new(config, credentials, store, transport, agent)
    }

    /// Subscribe to status, statistics and key events
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Persist `identity` and start connecting in the background
    pub fn add_server(&self, identity: ServerIdentity) -> Result<(), OrchestratorError> {
        if self.inner.servers.contains_key(&identity.id) {
            return Err(OrchestratorError::AlreadyExists(identity.id));
        }
        self.inner.persist(&identity)?;
        let manager = self.inner.new_manager(identity);
        self.inner.register(manager.clone())?;
        manager.start();
        Ok(())
    }

    /// Onboard a new server with a single foreground attempt.
    ///
    /// Connects with `password`, opens the tunnel and fetches one snapshot.
    /// On success the server is persisted and a key pair is generated and
    /// installed in the background. On failure nothing is kept and the
    /// classified error is returned.
    pub async fn connect_server(
        &self,
        identity: ServerIdentity,
        password: &str,
    ) -> Result<ServerIdentity, OrchestratorError> {
        if self.inner.servers.contains_key(&identity.id) {
            return Err(OrchestratorError::AlreadyExists(identity.id));
        }
        tracing::info!("Onboarding {}@{}", identity.username, identity.ssh_address());

        let manager = self.inner.new_manager(identity);
        let snapshot = match self.inner.onboard(&manager, password).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("Onboarding failed: {}", e);
                manager.shutdown().await;
                return Err(e);
            }
        };

        let identity = manager.identity();
        let registered = self
            .inner
            .persist(&identity)
            .and_then(|()| self.inner.register(manager.clone()));
        if let Err(e) = registered {
            manager.shutdown().await;
            return Err(e);
        }

        self.inner.emit(OrchestratorEvent::Stats {
            server_id: identity.id.clone(),
            snapshot,
        });
        self.inner
            .spawn_provisioning(&manager, Some(password.to_string()));
        Ok(identity)
    }

    /// Stop a server and delete its stored credentials and configuration.
    ///
    /// Also removes servers that are persisted but not running.
    pub async fn remove_server(&self, id: &ServerId) -> Result<(), OrchestratorError> {
        match self.inner.servers.remove(id) {
            Some((_, entry)) => entry.shutdown().await,
            None if self.inner.store.get(id)?.is_some() => {}
            None => return Err(OrchestratorError::NotFound(id.clone())),
        }

        self.inner.credentials.delete_server(id)?;
        {
            let _guard = self.inner.persist_guard();
            self.inner.store.remove(id)?;
        }
        tracing::info!("Removed server {}", id);
        Ok(())
    }

    /// Close every session without reconnecting
    pub async fn stop_all(&self) {
        let ids: Vec<ServerId> = self
            .inner
            .servers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            if let Some((_, entry)) = self.inner.servers.remove(&id) {
                entry.shutdown().await;
            }
        }
        tracing::info!("All sessions stopped");
    }

    /// Start every persisted server in the background.
    ///
    /// Returns the number of servers started.
    pub fn load_persisted(&self) -> Result<usize, OrchestratorError> {
        let mut started = 0;
        for identity in self.inner.store.load()? {
            if self.inner.servers.contains_key(&identity.id) {
                continue;
            }
            let manager = self.inner.new_manager(identity);
            self.inner.register(manager.clone())?;
            manager.start();
            started += 1;
        }
        tracing::info!("Loaded {} persisted servers", started);
        Ok(started)
    }

    /// Retry with a newly entered password after "auth failed".
    ///
    /// The password is stored once it has been accepted. A persisted server
    /// that is not running is started by this call. When the host cannot be
    /// reached the server keeps retrying in the background.
    pub async fn reauthenticate(
        &self,
        id: &ServerId,
        password: &str,
    ) -> Result<(), OrchestratorError> {
        let manager = match self.inner.manager(id) {
            Ok(manager) => manager,
            Err(e) => {
                let identity = self.inner.store.get(id)?.ok_or(e)?;
                let manager = self.inner.new_manager(identity);
                self.inner.register(manager.clone())?;
                manager
            }
        };
        if let Err(e) = manager.connect(Some(password)).await {
            if e.is_retryable() {
                // The entered password is unverified; retries use what is stored
                manager.retry_later();
            }
            return Err(e.into());
        }
        self.inner.credentials.save_password(id, password)?;
        Ok(())
    }

    /// Change a server's settings.
    ///
    /// Host, username or port changes tear the session down and reconnect
    /// immediately; a new display name only updates the stored entry.
    /// Servers that are persisted but not running are edited in place.
    pub async fn update_server(&self, identity: ServerIdentity) -> Result<(), OrchestratorError> {
        let Ok(manager) = self.inner.manager(&identity.id) else {
            return self.inner.update_stored(identity);
        };
        let changed = manager.replace_identity(identity);
        self.inner.persist(&manager.identity())?;
        if changed {
            tracing::info!("Connection settings of {} changed, reconnecting", manager.server_id());
            manager.restart().await;
        }
        Ok(())
    }

    /// The host machine woke from sleep
    pub fn handle_wake(&self) {
        for entry in self.inner.servers.iter() {
            entry.manager.notify_wake();
        }
    }

    /// Current status of a server
    pub fn status(&self, id: &ServerId) -> Option<ConnectionStatus> {
        self.inner
            .servers
            .get(id)
            .map(|entry| *entry.status.borrow())
    }

    /// Every managed server, ordered by name
    pub fn servers(&self) -> Vec<ServerSummary> {
        let mut servers: Vec<ServerSummary> = self
            .inner
            .servers
            .iter()
            .map(|entry| ServerSummary {
                identity: entry.manager.identity(),
                phase: entry.manager.phase(),
                status: *entry.status.borrow(),
            })
            .collect();
        servers.sort_by(|a, b| a.identity.name.cmp(&b.identity.name));
        servers
    }
}

impl Inner {
    fn new_manager(&self, identity: ServerIdentity) -> SessionManager {
        SessionManager::new(
            identity,
            self.credentials.clone(),
            Arc::clone(&self.transport),
            self.config.backoff.clone(),
        )
    }

    fn manager(&self, id: &ServerId) -> Result<SessionManager, OrchestratorError> {
        self.servers
            .get(id)
            .map(|entry| entry.manager.clone())
            .ok_or_else(|| OrchestratorError::NotFound(id.clone()))
    }

    /// Edit a persisted server that is not running
    fn update_stored(&self, identity: ServerIdentity) -> Result<(), OrchestratorError> {
        let _guard = self.persist_guard();
        let mut stored = self
            .store
            .get(&identity.id)?
            .ok_or_else(|| OrchestratorError::NotFound(identity.id.clone()))?;
        stored.apply_edit(identity);
        self.store.upsert(&stored)?;
        Ok(())
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events_tx.send(event);
    }

    fn persist_guard(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.persist_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist(&self, identity: &ServerIdentity) -> Result<(), OrchestratorError> {
        let _guard = self.persist_guard();
        self.store.upsert(identity)?;
        Ok(())
    }

    /// Persist only while the server is still managed
    fn persist_if_managed(&self, identity: &ServerIdentity) -> Result<(), OrchestratorError> {
        let _guard = self.persist_guard();
        if self.servers.contains_key(&identity.id) {
            self.store.upsert(identity)?;
        }
        Ok(())
    }

    /// Insert the entry and spawn its driver
    fn register(self: &Arc<Self>, manager: SessionManager) -> Result<(), OrchestratorError> {
        let id = manager.server_id();
        match self.servers.entry(id.clone()) {
            Entry::Occupied(_) => Err(OrchestratorError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                let cancel = CancellationToken::new();
                let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
                let driver = tokio::spawn(drive(
                    Arc::clone(self),
                    manager.clone(),
                    status_tx,
                    cancel.clone(),
                ));
                slot.insert(ServerEntry {
                    manager,
                    status: status_rx,
                    cancel,
                    driver,
                    tasks: Vec::new(),
                });
                Ok(())
            }
        }
    }

    async fn onboard(
        &self,
        manager: &SessionManager,
        password: &str,
    ) -> Result<Value, OrchestratorError> {
        manager.connect(Some(password)).await?;
        let local_addr = manager.open_tunnel().await?;
        let snapshot = self
            .agent
            .fetch_snapshot(&format!("http://{}", local_addr))
            .await?;
        manager.mark_live()?;
        Ok(snapshot)
    }

    /// Generate and install a key in the background, unless that is
    /// already under way
    fn spawn_provisioning(self: &Arc<Self>, manager: &SessionManager, password: Option<String>) {
        let id = manager.server_id();
        let Some(mut entry) = self.servers.get_mut(&id) else {
            return;
        };
        if entry.tasks.iter().any(|task| !task.is_finished()) {
            return;
        }
        let cancel = entry.cancel.child_token();
        let task = tokio::spawn(provision_key(
            Arc::clone(self),
            manager.clone(),
            password,
            cancel,
        ));
        entry.tasks.retain(|task| !task.is_finished());
        entry.tasks.push(task);
    }

    async fn install_key(
        &self,
        manager: &SessionManager,
        password: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let id = manager.server_id();
        if let Some(password) = password {
            self.credentials.save_password(&id, password)?;
        }
        let key = ClientKey::generate(&self.config.key_comment);
        self.credentials.save_private_key(&id, &key.seed())?;
        manager.install_public_key(key.authorized_key_line()).await?;
        manager.set_key_installed(true);
        self.persist_if_managed(&manager.identity())?;
        Ok(())
    }

    /// Store a host key pinned by the manager
    fn persist_host_key(&self, manager: &SessionManager) {
        let identity = manager.identity();
        if identity.host_key.is_none() {
            return;
        }
        let _guard = self.persist_guard();
        match self.store.get(&identity.id) {
            Ok(Some(mut stored)) if stored.host_key != identity.host_key => {
                stored.host_key = identity.host_key;
                if let Err(e) = self.store.upsert(&stored) {
                    tracing::warn!("Failed to persist host key: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to read server list: {}", e),
        }
    }
}

async fn provision_key(
    inner: Arc<Inner>,
    manager: SessionManager,
    password: Option<String>,
    cancel: CancellationToken,
) {
    let server_id = manager.server_id();
    let result = tokio::select! {
        _ = cancel.cancelled() => return,
        result = inner.install_key(&manager, password.as_deref()) => result,
    };
    match result {
        Ok(()) => {
            tracing::info!("Installed client key on {}", manager.identity().host);
            inner.emit(OrchestratorEvent::KeyInstalled { server_id });
        }
        Err(e) => {
            tracing::warn!("Key installation on {} failed: {}", manager.identity().host, e);
            inner.emit(OrchestratorEvent::KeyInstallFailed {
                server_id,
                error: e.to_string(),
            });
        }
    }
}

/// Per-server state owned by the driver task
struct Driver {
    inner: Arc<Inner>,
    manager: SessionManager,
    server_id: ServerId,
    status: StatusPublisher,
    cancel: CancellationToken,
    /// Cancels the probe or stream task of the current phase
    work: Option<CancellationToken>,
    /// The agent answered since the tunnel last came up
    was_live: bool,
    /// Set after the phase found at startup has been handled
    settled: bool,
}

async fn drive(
    inner: Arc<Inner>,
    manager: SessionManager,
    status_tx: watch::Sender<ConnectionStatus>,
    cancel: CancellationToken,
) {
    let mut events = manager.subscribe();
    let mut driver = Driver {
        server_id: manager.server_id(),
        status: StatusPublisher {
            inner: Arc::clone(&inner),
            server_id: manager.server_id(),
            tx: Arc::new(status_tx),
        },
        inner,
        manager,
        cancel: cancel.clone(),
        work: None,
        was_live: false,
        settled: false,
    };
    driver.on_phase(driver.manager.phase(), driver.manager.last_error());
    driver.settled = true;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => driver.on_phase(event.to, event.error),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Driver for {} skipped {} phase events", driver.server_id, skipped);
                driver.on_phase(driver.manager.phase(), driver.manager.last_error());
            }
            Err(RecvError::Closed) => break,
        }
    }
    driver.stop_work();
}

impl Driver {
    fn on_phase(&mut self, phase: ConnectionPhase, error: Option<SessionError>) {
        // Live keeps the task that just brought the agent up
        if phase != ConnectionPhase::Live {
            self.stop_work();
        }

        match phase {
            ConnectionPhase::Disconnected => {
                self.was_live = false;
                let status = match error.as_ref().map(SessionError::kind) {
                    Some(ErrorKind::Auth) => ConnectionStatus::AuthFailed,
                    Some(ErrorKind::Network | ErrorKind::Tunnel) => ConnectionStatus::Reconnecting,
                    _ => ConnectionStatus::Disconnected,
                };
                if status == ConnectionStatus::AuthFailed {
                    tracing::warn!(
                        "Credentials for {} rejected; waiting for a new password",
                        self.server_id
                    );
                }
                self.set_status(status);
            }
            ConnectionPhase::SshConnecting => self.set_status(ConnectionStatus::Connecting),
            ConnectionPhase::SshConnected => {
                self.set_status(ConnectionStatus::Connecting);
                self.inner.persist_host_key(&self.manager);
                let manager = self.manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager.open_tunnel().await {
                        tracing::debug!("open_tunnel for {}: {}", manager.server_id(), e);
                    }
                });
            }
            ConnectionPhase::TunnelOpen => {
                let regressed = self.was_live;
                self.set_status(if regressed {
                    ConnectionStatus::AgentOffline
                } else {
                    ConnectionStatus::Connecting
                });
                let work = self.start_work();
                tokio::spawn(probe_then_stream(
                    Arc::clone(&self.inner),
                    self.manager.clone(),
                    self.status.clone(),
                    work,
                    regressed,
                ));
            }
            ConnectionPhase::Live => {
                self.was_live = true;
                self.set_status(ConnectionStatus::Connected);
                // Onboarding provisions the first key itself
                if self.settled && !self.manager.identity().has_key_installed {
                    self.inner.spawn_provisioning(&self.manager, None);
                }
                if self.work.is_none() {
                    let work = self.start_work();
                    tokio::spawn(stream_only(
                        Arc::clone(&self.inner),
                        self.manager.clone(),
                        work,
                    ));
                }
            }
        }
    }

    fn start_work(&mut self) -> CancellationToken {
        let work = self.cancel.child_token();
        self.work = Some(work.clone());
        work
    }

    fn stop_work(&mut self) {
        if let Some(work) = self.work.take() {
            work.cancel();
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.publish(status, None);
    }
}

/// Publishes a server's status and the matching event
#[derive(Clone)]
struct StatusPublisher {
    inner: Arc<Inner>,
    server_id: ServerId,
    tx: Arc<watch::Sender<ConnectionStatus>>,
}

impl StatusPublisher {
    /// Set `status` unless it is current or `work` has been cancelled.
    ///
    /// The check runs under the channel lock, so a task whose phase ended
    /// cannot overwrite the status the driver set for the next phase.
    fn publish(&self, status: ConnectionStatus, work: Option<&CancellationToken>) {
        self.tx.send_if_modified(|current| {
            if *current == status || work.is_some_and(CancellationToken::is_cancelled) {
                return false;
            }
            *current = status;
            tracing::info!("{}: {}", self.server_id, status);
            self.inner.emit(OrchestratorEvent::StatusChanged {
                server_id: self.server_id.clone(),
                status,
            });
            true
        });
    }
}

/// Probe the agent until it answers, then go live and stream.
///
/// While the agent does not answer the tunnel is kept and the server reads
/// as agent offline.
async fn probe_then_stream(
    inner: Arc<Inner>,
    manager: SessionManager,
    status: StatusPublisher,
    cancel: CancellationToken,
    delay_first: bool,
) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = async {
            let Some(base_url) = base_url(&manager).await else {
                return;
            };
            let mut backoff = ExponentialBackoff::from_config(&inner.config.backoff);
            if delay_first {
                tokio::time::sleep(backoff.next_delay()).await;
            }

            loop {
                match inner.agent.fetch_snapshot(&base_url).await {
                    Ok(snapshot) => {
                        inner.emit(OrchestratorEvent::Stats {
                            server_id: manager.server_id(),
                            snapshot,
                        });
                        break;
                    }
                    Err(e) => {
                        status.publish(ConnectionStatus::AgentOffline, Some(&cancel));
                        let delay = backoff.next_delay();
                        tracing::debug!(
                            "Agent on {} not answering ({}), retrying in {:?}",
                            manager.server_id(),
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }

            if let Err(e) = manager.mark_live() {
                tracing::debug!("mark_live for {}: {}", manager.server_id(), e);
                return;
            }
            stream_stats(&inner, &manager, &base_url).await;
        } => {}
    }
}

/// Stream from an agent that is already known to answer
async fn stream_only(inner: Arc<Inner>, manager: SessionManager, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = async {
            match base_url(&manager).await {
                Some(base_url) => stream_stats(&inner, &manager, &base_url).await,
                None => manager.mark_agent_offline(),
            }
        } => {}
    }
}

async fn stream_stats(inner: &Inner, manager: &SessionManager, base_url: &str) {
    let server_id = manager.server_id();
    let (tx, mut rx) = mpsc::channel(STATS_CHANNEL_CAPACITY);
    let forward = async {
        while let Some(snapshot) = rx.recv().await {
            inner.emit(OrchestratorEvent::Stats {
                server_id: server_id.clone(),
                snapshot,
            });
        }
    };
    let (result, ()) = tokio::join!(inner.agent.stream(base_url, tx), forward);

    match result {
        Ok(()) => tracing::info!("Agent stream for {} ended", server_id),
        Err(e) => tracing::warn!("Agent stream for {} failed: {}", server_id, e),
    }
    manager.mark_agent_offline();
}

async fn base_url(manager: &SessionManager) -> Option<String> {
    manager
        .local_addr()
        .await
        .map(|addr| format!("http://{}", addr))
}
