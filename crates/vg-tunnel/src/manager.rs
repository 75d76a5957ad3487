//! Per-server session manager
//!
//! A `SessionManager` owns at most one live session and one local forward for
//! a single server. It drives the phase state machine
//! `disconnected → sshConnecting → sshConnected → tunnelOpen → live`, watches
//! the session for disconnects and reconnects with exponential backoff.
//!
//! Steps past `sshConnected` are driven by the caller: `open_tunnel` moves to
//! `tunnelOpen`, and `mark_live` / `mark_agent_offline` flip between
//! `tunnelOpen` and `live` based on agent health.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use vg_core::config::BackoffConfig;
use vg_core::{
    ConnectionPhase, CredentialStore, PhaseEvent, ServerId, ServerIdentity, SessionError,
};

use crate::backoff::ExponentialBackoff;
use crate::forward::LocalForward;
use crate::keys;
use crate::transport::{Credential, RemoteSession, Transport};

/// A disconnect detected this soon after a wake report retries immediately
pub const WAKE_GRACE: Duration = Duration::from_secs(30);

/// Capacity of the phase event broadcast channel
const PHASE_EVENT_CAPACITY: usize = 64;

/// Manages the session to one server
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    identity: RwLock<ServerIdentity>,
    credentials: CredentialStore,
    transport: Arc<dyn Transport>,
    backoff: BackoffConfig,

    phase_tx: watch::Sender<ConnectionPhase>,
    events_tx: broadcast::Sender<PhaseEvent>,
    last_error: Mutex<Option<SessionError>>,

    /// Held across connect and teardown so they never interleave
    slot: tokio::sync::Mutex<Slot>,
    /// Cancelled once by `shutdown`; parent of every background task
    shutdown: CancellationToken,
    reconnect: Mutex<Option<ReconnectTask>>,

    wake: Notify,
    last_wake: Mutex<Option<Instant>>,
}

#[derive(Default)]
struct Slot {
    active: Option<Active>,
    generation: u64,
}

struct Active {
    remote: Arc<dyn RemoteSession>,
    forward: Option<LocalForward>,
    watcher: CancellationToken,
    generation: u64,
}

struct ReconnectTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    /// Set under the slot lock once the loop will make no further attempts
    done: Arc<AtomicBool>,
}

impl SessionManager {
    /// Create a manager in the `disconnected` phase
    pub fn new(
        identity: ServerIdentity,
        credentials: CredentialStore,
        transport: Arc<dyn Transport>,
        backoff: BackoffConfig,
    ) -> Self {
        let (phase_tx, _) = watch::channel(ConnectionPhase::Disconnected);
        let (events_tx, _) = broadcast::channel(PHASE_EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                identity: RwLock::new(identity),
                credentials,
                transport,
                backoff,
                phase_tx,
                events_tx,
                last_error: Mutex::new(None),
                slot: tokio::sync::Mutex::new(Slot::default()),
                shutdown: CancellationToken::new(),
                reconnect: Mutex::new(None),
                wake: Notify::new(),
                last_wake: Mutex::new(None),
            }),
        }
    }

    /// Current identity
    pub fn identity(&self) -> ServerIdentity {
        self.inner.identity()
    }

    pub fn server_id(&self) -> ServerId {
        self.inner.identity().id
    }

    /// Current phase
    pub fn phase(&self) -> ConnectionPhase {
        *self.inner.phase_tx.borrow()
    }

    /// Watch the current phase
    pub fn watch_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.inner.phase_tx.subscribe()
    }

    /// Subscribe to phase transitions
    pub fn subscribe(&self) -> broadcast::Receiver<PhaseEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Error that caused the most recent reset to `disconnected`
    pub fn last_error(&self) -> Option<SessionError> {
        self.inner.last_error.lock().ok().and_then(|e| e.clone())
    }

    /// Whether a background reconnect loop is running
    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnect_running()
    }

    /// Whether `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Connect and authenticate.
    ///
    /// The stored private key is offered first, then `password_override` or
    /// the stored password. Succeeds immediately if a session already exists.
    pub async fn connect(&self, password_override: Option<&str>) -> Result<(), SessionError> {
        let mut slot = self.inner.slot.lock().await;
        self.inner
            .connect_locked(&mut slot, password_override, &self.inner.shutdown)
            .await
    }

    /// Open the local forward to the agent port and move to `tunnelOpen`.
    ///
    /// On failure the session is torn down and the reconnect loop takes
    /// over.
    pub async fn open_tunnel(&self) -> Result<SocketAddr, SessionError> {
        let inner = &self.inner;
        let mut slot = inner.slot.lock().await;
        let phase = self.phase();

        let remote = match slot.active.as_ref() {
            Some(active) => {
                if let Some(forward) = &active.forward {
                    return Ok(forward.local_addr());
                }
                Arc::clone(&active.remote)
            }
            None => {
                return Err(SessionError::InvalidTransition {
                    from: phase,
                    to: ConnectionPhase::TunnelOpen,
                })
            }
        };
        if phase != ConnectionPhase::SshConnected {
            return Err(SessionError::InvalidTransition {
                from: phase,
                to: ConnectionPhase::TunnelOpen,
            });
        }

        let agent_port = inner.identity().agent_port;
        match remote.open_forward(agent_port).await {
            Ok(forward) => {
                let local_addr = forward.local_addr();
                if let Some(active) = slot.active.as_mut() {
                    active.forward = Some(forward);
                }
                inner.transition(ConnectionPhase::TunnelOpen, None)?;
                tracing::info!(
                    "Forwarding {} to agent port {} on {}",
                    local_addr,
                    agent_port,
                    inner.identity().host
                );
                Ok(local_addr)
            }
            Err(e) => {
                let err = match e {
                    SessionError::Tunnel(_) => e,
                    other => SessionError::Tunnel(other.to_string()),
                };
                tracing::warn!("Failed to open tunnel: {}", err);
                inner.teardown_locked(&mut slot).await;
                inner.reset(err.clone());
                inner.spawn_reconnect(false);
                Err(err)
            }
        }
    }

    /// Agent answered: move from `tunnelOpen` to `live`
    pub fn mark_live(&self) -> Result<(), SessionError> {
        self.inner.transition(ConnectionPhase::Live, None)
    }

    /// Agent stopped answering: fall back from `live` to `tunnelOpen`.
    ///
    /// No-op in any other phase.
    pub fn mark_agent_offline(&self) {
        if self.phase() == ConnectionPhase::Live {
            let _ = self.inner.transition(ConnectionPhase::TunnelOpen, None);
        }
    }

    /// Local address of the open forward
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let slot = self.inner.slot.lock().await;
        slot.active
            .as_ref()
            .and_then(|active| active.forward.as_ref())
            .map(LocalForward::local_addr)
    }

    /// Run a command over the active session.
    ///
    /// A non-zero exit status is returned as `SessionError::RemoteCommand`.
    pub async fn execute_command(&self, command: &str) -> Result<String, SessionError> {
        let remote = self.inner.remote().await?;
        remote.exec(command).await?.into_result()
    }

    /// Append `line` to the remote `authorized_keys`
    pub async fn install_public_key(&self, line: &str) -> Result<(), SessionError> {
        let remote = self.inner.remote().await?;
        keys::install_public_key(remote.as_ref(), line).await
    }

    /// Start connecting in the background, retrying network failures
    pub fn start(&self) {
        self.inner.spawn_reconnect(true);
    }

    /// Retry with stored credentials after the first backoff delay.
    ///
    /// Used after a foreground attempt failed on the network. No-op while a
    /// reconnect loop is already running.
    pub fn retry_later(&self) {
        self.inner.spawn_reconnect(false);
    }

    /// Report that the host machine woke from sleep.
    ///
    /// A pending retry fires immediately and the backoff schedule restarts.
    /// A disconnect detected within `WAKE_GRACE` retries without delay.
    pub fn notify_wake(&self) {
        if let Ok(mut last_wake) = self.inner.last_wake.lock() {
            *last_wake = Some(Instant::now());
        }
        if self.inner.reconnect_running() {
            tracing::info!("Wake reported for {}, retrying now", self.inner.identity().host);
            self.inner.wake.notify_one();
        }
    }

    /// Replace the identity.
    ///
    /// Takes effect on the next connection attempt; returns whether the
    /// endpoint or account changed. The pinned host key and the
    /// key-installation flag are state owned by the manager: they are kept
    /// for the same endpoint and cleared for a different one.
    pub fn replace_identity(&self, identity: ServerIdentity) -> bool {
        match self.inner.identity.write() {
            Ok(mut current) => current.apply_edit(identity),
            Err(_) => false,
        }
    }

    /// Record whether our public key is installed
    pub fn set_key_installed(&self, installed: bool) {
        if let Ok(mut identity) = self.inner.identity.write() {
            identity.has_key_installed = installed;
        }
    }

    /// Tear down the current session and reconnect immediately
    pub async fn restart(&self) {
        if self.is_shut_down() {
            return;
        }
        self.inner.stop().await;
        self.inner.spawn_reconnect(true);
    }

    /// Stop the reconnect loop and close the session without reconnecting.
    ///
    /// The manager cannot be restarted afterwards.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.stop().await;
        tracing::debug!("Session manager for {} shut down", self.inner.identity().host);
    }
}

impl Inner {
    fn identity(&self) -> ServerIdentity {
        match self.identity.read() {
            Ok(identity) => identity.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn phase(&self) -> ConnectionPhase {
        *self.phase_tx.borrow()
    }

    /// Apply a transition and broadcast it.
    ///
    /// The phase update and the broadcast happen under the watch lock so
    /// subscribers see transitions in order.
    fn transition(
        &self,
        to: ConnectionPhase,
        error: Option<SessionError>,
    ) -> Result<(), SessionError> {
        let server_id = self.identity().id;
        let mut result = Ok(());
        self.phase_tx.send_if_modified(|phase| {
            let from = *phase;
            if !from.can_transition_to(to) {
                result = Err(SessionError::InvalidTransition { from, to });
                return false;
            }
            *phase = to;
            tracing::debug!("{}: {} -> {}", server_id, from, to);
            let _ = self.events_tx.send(PhaseEvent {
                server_id: server_id.clone(),
                from,
                to,
                error,
            });
            true
        });
        result
    }

    /// Move to `disconnected` and remember why
    fn reset(&self, error: SessionError) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(error.clone());
        }
        let _ = self.transition(ConnectionPhase::Disconnected, Some(error));
    }

    fn credentials_for(
        &self,
        identity: &ServerIdentity,
        password_override: Option<&str>,
    ) -> Result<Vec<Credential>, SessionError> {
        let mut credentials = Vec::new();
        if let Some(seed) = self.credentials.private_key(&identity.id)? {
            credentials.push(Credential::PrivateKey(keys::reconstruct(&seed)?));
        }
        let password = match password_override {
            Some(password) => Some(password.to_string()),
            None => self.credentials.password(&identity.id)?,
        };
        if let Some(password) = password {
            credentials.push(Credential::Password(password));
        }
        if credentials.is_empty() {
            return Err(SessionError::Auth(
                "No stored key or password for this server".to_string(),
            ));
        }
        Ok(credentials)
    }

    async fn connect_locked(
        self: &Arc<Self>,
        slot: &mut Slot,
        password_override: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        if slot.active.is_some() {
            return Ok(());
        }

        let identity = self.identity();
        self.transition(ConnectionPhase::SshConnecting, None)?;

        let attempt = async {
            let credentials = self.credentials_for(&identity, password_override)?;
            self.transport.connect(&identity, &credentials).await
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = attempt => result,
        };

        let remote = match result {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!("Connection to {} failed: {}", identity.ssh_address(), e);
                self.reset(e.clone());
                return Err(e);
            }
        };

        if identity.host_key.is_none() {
            if let Some(fingerprint) = remote.host_key_fingerprint() {
                tracing::info!("Pinned host key for {}: {}", identity.host, fingerprint);
                if let Ok(mut current) = self.identity.write() {
                    current.host_key = Some(fingerprint);
                }
            }
        }

        slot.generation += 1;
        let generation = slot.generation;
        let watcher = self.shutdown.child_token();
        tokio::spawn(watch_session(
            Arc::downgrade(self),
            Arc::clone(&remote),
            watcher.clone(),
            generation,
        ));
        slot.active = Some(Active {
            remote,
            forward: None,
            watcher,
            generation,
        });

        if let Ok(mut last) = self.last_error.lock() {
            *last = None;
        }
        self.transition(ConnectionPhase::SshConnected, None)
    }

    /// Close the forward and the session, if any
    async fn teardown_locked(&self, slot: &mut Slot) {
        if let Some(active) = slot.active.take() {
            active.watcher.cancel();
            if let Some(forward) = active.forward {
                forward.close().await;
            }
            active.remote.close().await;
        }
    }

    async fn remote(&self) -> Result<Arc<dyn RemoteSession>, SessionError> {
        let slot = self.slot.lock().await;
        slot.active
            .as_ref()
            .map(|active| Arc::clone(&active.remote))
            .ok_or_else(|| SessionError::Network("Not connected".to_string()))
    }

    async fn on_session_lost(self: &Arc<Self>, generation: u64) {
        let mut slot = self.slot.lock().await;
        match &slot.active {
            Some(active) if active.generation == generation => {}
            // Already torn down on purpose
            _ => return,
        }
        self.teardown_locked(&mut slot).await;
        tracing::warn!("Lost session to {}", self.identity().host);
        self.reset(SessionError::Network("Session closed".to_string()));
        self.spawn_reconnect(self.woke_recently());
    }

    fn woke_recently(&self) -> bool {
        self.last_wake
            .lock()
            .ok()
            .and_then(|last| *last)
            .is_some_and(|at| at.elapsed() <= WAKE_GRACE)
    }

    fn reconnect_running(&self) -> bool {
        self.reconnect
            .lock()
            .ok()
            .and_then(|task| task.as_ref().map(ReconnectTask::is_running))
            .unwrap_or(false)
    }

    fn spawn_reconnect(self: &Arc<Self>, immediate: bool) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let Ok(mut task) = self.reconnect.lock() else {
            return;
        };
        if task.as_ref().is_some_and(ReconnectTask::is_running) {
            return;
        }
        let cancel = self.shutdown.child_token();
        let done = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(reconnect_loop(
            Arc::clone(self),
            cancel.clone(),
            Arc::clone(&done),
            immediate,
        ));
        *task = Some(ReconnectTask {
            cancel,
            handle,
            done,
        });
    }

    /// Stop the reconnect loop and close any session
    async fn stop(&self) {
        let task = self.reconnect.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.handle.await;
        }

        let mut slot = self.slot.lock().await;
        self.teardown_locked(&mut slot).await;
        if self.phase() != ConnectionPhase::Disconnected {
            self.reset(SessionError::Cancelled);
        }
    }

    /// Consume a wake permit left over from an earlier loop
    async fn drain_wake(&self) {
        tokio::select! {
            biased;
            _ = self.wake.notified() => {}
            _ = std::future::ready(()) => {}
        }
    }
}

impl ReconnectTask {
    fn is_running(&self) -> bool {
        !self.done.load(Ordering::SeqCst) && !self.handle.is_finished()
    }
}

/// Wait for the session to end on its own and hand over to the reconnect
/// loop
async fn watch_session(
    inner: Weak<Inner>,
    remote: Arc<dyn RemoteSession>,
    watcher: CancellationToken,
    generation: u64,
) {
    tokio::select! {
        _ = watcher.cancelled() => return,
        _ = remote.closed() => {}
    }
    if let Some(inner) = inner.upgrade() {
        inner.on_session_lost(generation).await;
    }
}

async fn reconnect_loop(
    inner: Arc<Inner>,
    cancel: CancellationToken,
    done: Arc<AtomicBool>,
    immediate: bool,
) {
    let host = inner.identity().host;
    let mut backoff = ExponentialBackoff::from_config(&inner.backoff);
    let mut wait = !immediate;

    loop {
        if wait {
            let delay = backoff.next_delay();
            tracing::info!(
                "Reconnecting to {} in {:?} (attempt {})",
                host,
                delay,
                backoff.attempts()
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
                _ = inner.wake.notified() => backoff.reset(),
            }
        }
        wait = true;

        let result = {
            let mut slot = inner.slot.lock().await;
            let result = inner.connect_locked(&mut slot, None, &cancel).await;
            if !matches!(&result, Err(e) if e.is_retryable()) {
                // A disconnect seen after this point starts a new loop
                done.store(true, Ordering::SeqCst);
            }
            result
        };

        match result {
            Ok(()) => {
                tracing::info!("Reconnected to {}", host);
                inner.drain_wake().await;
                return;
            }
            Err(SessionError::Cancelled) => return,
            Err(e) if e.is_retryable() => {
                tracing::warn!("Reconnect to {} failed: {}", host, e);
            }
            Err(e) => {
                tracing::error!("Giving up on {}: {}", host, e);
                inner.drain_wake().await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ClientKey;
    use crate::mock::MockTransport;
    use ConnectionPhase::*;

    async fn wait_for_phase(manager: &SessionManager, phase: ConnectionPhase) {
        let mut rx = manager.watch_phase();
        rx.wait_for(|p| *p == phase).await.unwrap();
    }

    async fn next_disconnect(events: &mut broadcast::Receiver<PhaseEvent>) -> SessionError {
        loop {
            let event = events.recv().await.unwrap();
            if event.to == Disconnected {
                return event.error.unwrap();
            }
        }
    }

    /// Connect with a password and bring the manager all the way to `live`
    async fn live_manager(transport: &MockTransport) -> SessionManager {
        transport.set_password("hunter2");
        let store = CredentialStore::in_memory();
        let manager = manager(transport, &store);
        store.save_password(&manager.server_id(), "hunter2").unwrap();
        manager.connect(None).await.unwrap();
        manager.open_tunnel().await.unwrap();
        manager.mark_live().unwrap();
        manager
    }

    /// Play the caller's part after a reconnect
    async fn bring_live(manager: &SessionManager) {
        wait_for_phase(manager, SshConnected).await;
        manager.open_tunnel().await.unwrap();
        manager.mark_live().unwrap();
    }

    fn manager(transport: &MockTransport, store: &CredentialStore) -> SessionManager {
        let identity = ServerIdentity::new("10.0.0.5", "pi");
        SessionManager::new(
            identity,
            store.clone(),
            Arc::new(transport.clone()),
            BackoffConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_mark_live_requires_tunnel() {
        let transport = MockTransport::new();
        let store = CredentialStore::in_memory();
        let manager = manager(&transport, &store);

        assert!(matches!(
            manager.mark_live(),
            Err(SessionError::InvalidTransition { .. })
        ));
        assert!(matches!(
            manager.open_tunnel().await,
            Err(SessionError::InvalidTransition { .. })
        ));
        assert_eq!(manager.phase(), ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_no_credentials_is_auth_error() {
        let transport = MockTransport::new();
        let store = CredentialStore::in_memory();
        let manager = manager(&transport, &store);

        let err = manager.connect(None).await.unwrap_err();
        assert!(matches!(err, SessionError::Auth(_)));
        assert_eq!(manager.phase(), ConnectionPhase::Disconnected);
        assert_eq!(transport.attempts().len(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_key_is_data_integrity() {
        let transport = MockTransport::new();
        let store = CredentialStore::in_memory();
        let manager = manager(&transport, &store);
        store
            .save_private_key(&manager.server_id(), &[1, 2, 3])
            .unwrap();

        let err = manager.connect(None).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidKeyMaterial(_)));
        assert_eq!(manager.phase(), ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn test_host_key_is_pinned_on_first_connect() {
        let transport = MockTransport::new();
        transport.set_password("hunter2");
        let store = CredentialStore::in_memory();
        let manager = manager(&transport, &store);

        manager.connect(Some("hunter2")).await.unwrap();
        assert_eq!(
            manager.identity().host_key.as_deref(),
            Some(crate::mock::MOCK_HOST_KEY)
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_replace_identity_reports_endpoint_changes() {
        let transport = MockTransport::new();
        let store = CredentialStore::in_memory();
        let manager = manager(&transport, &store);

        let mut renamed = manager.identity();
        renamed.name = "garage".into();
        assert!(!manager.replace_identity(renamed));
        assert_eq!(manager.identity().name, "garage");

        manager.set_key_installed(true);
        let mut stale = manager.identity();
        stale.has_key_installed = false;
        assert!(!manager.replace_identity(stale));
        assert!(manager.identity().has_key_installed);

        let mut moved = manager.identity();
        moved.host = "10.0.0.6".into();
        assert!(manager.replace_identity(moved));
        assert_eq!(manager.identity().host, "10.0.0.6");
        assert!(!manager.identity().has_key_installed);
    }

    #[tokio::test]
    async fn test_phase_sequence_to_live() {
        let transport = MockTransport::new();
        transport.set_password("hunter2");
        let store = CredentialStore::in_memory();
        let manager = manager(&transport, &store);
        let mut events = manager.subscribe();

        manager.connect(Some("hunter2")).await.unwrap();
        let addr = manager.open_tunnel().await.unwrap();
        manager.mark_live().unwrap();

        assert!(addr.ip().is_loopback());
        assert_eq!(manager.local_addr().await, Some(addr));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push((event.from, event.to));
        }
        assert_eq!(
            seen,
            vec![
                (Disconnected, SshConnecting),
                (SshConnecting, SshConnected),
                (SshConnected, TunnelOpen),
                (TunnelOpen, Live),
            ]
        );
        manager.shutdown().await;
        assert_eq!(manager.phase(), Disconnected);
    }

    #[tokio::test]
    async fn test_key_is_offered_before_password() {
        let transport = MockTransport::new();
        transport.set_password("hunter2");
        let store = CredentialStore::in_memory();
        let manager = manager(&transport, &store);
        let key = ClientKey::generate("vigil-client");
        store
            .save_private_key(&manager.server_id(), &key.seed())
            .unwrap();

        manager.connect(Some("hunter2")).await.unwrap();
        assert_eq!(transport.attempts()[0].methods, vec!["publickey", "password"]);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_key_without_password_never_retries() {
        let transport = MockTransport::new();
        let store = CredentialStore::in_memory();
        let manager = manager(&transport, &store);
        let key = ClientKey::generate("vigil-client");
        store
            .save_private_key(&manager.server_id(), &key.seed())
            .unwrap();
        let mut events = manager.subscribe();

        manager.start();
        let err = next_disconnect(&mut events).await;
        assert!(matches!(err, SessionError::Auth(_)));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(manager.phase(), Disconnected);
        assert_eq!(transport.attempts().len(), 1);
        assert_eq!(transport.attempts()[0].methods, vec!["publickey"]);
        assert!(!manager.is_reconnecting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_host_retries_with_backoff() {
        let transport = MockTransport::new();
        transport.set_password("hunter2");
        transport.set_reachable(false);
        let store = CredentialStore::in_memory();
        let manager = manager(&transport, &store);
        store.save_password(&manager.server_id(), "hunter2").unwrap();

        manager.start();
        // Attempts at 0s, 2s, 6s and 14s
        tokio::time::sleep(Duration::from_millis(14_500)).await;
        assert_eq!(transport.attempts().len(), 4);
        assert!(manager.is_reconnecting());
        assert!(manager.last_error().is_some_and(|e| e.is_retryable()));

        transport.set_reachable(true);
        wait_for_phase(&manager, SshConnected).await;
        assert!(!manager.is_reconnecting());
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_mid_live_returns_to_live() {
        let transport = MockTransport::new();
        let manager = live_manager(&transport).await;
        let started = Instant::now();

        transport.set_reachable(false);
        transport.drop_sessions();
        wait_for_phase(&manager, Disconnected).await;
        assert!(matches!(manager.last_error(), Some(SessionError::Network(_))));

        // Retries fire at 2s and 6s; the network is back before the one at 14s
        let recovering = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            recovering.set_reachable(true);
        });

        bring_live(&manager).await;
        assert_eq!(manager.phase(), Live);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(14), "live after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(15), "live after {:?}", elapsed);
        // The initial connect plus three retries
        assert_eq!(transport.attempts().len(), 4);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_later_waits_one_backoff_step() {
        let transport = MockTransport::new();
        transport.set_password("hunter2");
        transport.set_reachable(false);
        let store = CredentialStore::in_memory();
        let manager = manager(&transport, &store);
        store.save_password(&manager.server_id(), "hunter2").unwrap();

        let err = manager.connect(None).await.unwrap_err();
        assert!(err.is_retryable());
        let started = Instant::now();
        manager.retry_later();
        assert!(manager.is_reconnecting());
        transport.set_reachable(true);

        wait_for_phase(&manager, SshConnected).await;
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(transport.attempts().len(), 2);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_makes_pending_retry_immediate() {
        let transport = MockTransport::new();
        let manager = live_manager(&transport).await;

        transport.set_reachable(false);
        transport.drop_sessions();
        // First retry at 2s fails, the next one is scheduled for 6s
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(transport.attempts().len(), 2);

        transport.set_reachable(true);
        let woke_at = Instant::now();
        manager.notify_wake();
        wait_for_phase(&manager, SshConnected).await;
        assert!(woke_at.elapsed() < Duration::from_secs(1));
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_shortly_after_wake_retries_immediately() {
        let transport = MockTransport::new();
        let manager = live_manager(&transport).await;

        let mut events = manager.subscribe();

        manager.notify_wake();
        tokio::time::sleep(Duration::from_secs(10)).await;
        let dropped_at = Instant::now();
        transport.drop_sessions();

        let err = next_disconnect(&mut events).await;
        assert!(matches!(err, SessionError::Network(_)));
        wait_for_phase(&manager, SshConnected).await;
        assert!(dropped_at.elapsed() < Duration::from_secs(1));
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tunnel_failure_resets_and_reconnects() {
        let transport = MockTransport::new();
        transport.set_password("hunter2");
        transport.set_refuse_forward(true);
        let store = CredentialStore::in_memory();
        let manager = manager(&transport, &store);
        store.save_password(&manager.server_id(), "hunter2").unwrap();

        manager.connect(None).await.unwrap();
        let err = manager.open_tunnel().await.unwrap_err();
        assert!(matches!(err, SessionError::Tunnel(_)));
        assert_eq!(manager.phase(), Disconnected);
        assert_eq!(transport.open_sessions(), 0);
        assert!(manager.is_reconnecting());

        transport.set_refuse_forward(false);
        bring_live(&manager).await;
        assert_eq!(transport.attempts().len(), 2);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_reconnect() {
        let transport = MockTransport::new();
        transport.set_reachable(false);
        let store = CredentialStore::in_memory();
        let manager = manager(&transport, &store);
        store.save_password(&manager.server_id(), "hunter2").unwrap();

        manager.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        manager.shutdown().await;
        let attempts = transport.attempts().len();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.attempts().len(), attempts);
        assert!(!manager.is_reconnecting());
        assert!(manager.connect(None).await.is_err());
    }

    #[tokio::test]
    async fn test_agent_offline_falls_back_to_tunnel_open() {
        let transport = MockTransport::new();
        let manager = live_manager(&transport).await;

        manager.mark_agent_offline();
        assert_eq!(manager.phase(), TunnelOpen);
        manager.mark_agent_offline();
        assert_eq!(manager.phase(), TunnelOpen);
        manager.mark_live().unwrap();
        assert_eq!(manager.phase(), Live);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_command_reports_exit_status() {
        let transport = MockTransport::new();
        let manager = live_manager(&transport).await;

        transport.set_exec_status(1);
        let err = manager.execute_command("false").await.unwrap_err();
        assert!(matches!(err, SessionError::RemoteCommand { status: 1, .. }));

        transport.set_exec_status(0);
        assert_eq!(manager.execute_command("true").await.unwrap(), "");
        assert_eq!(transport.commands(), vec!["false", "true"]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_installed_key_authenticates_alone() {
        let transport = MockTransport::new();
        let manager = live_manager(&transport).await;
        let key = ClientKey::generate("vigil-client");
        manager
            .install_public_key(key.authorized_key_line())
            .await
            .unwrap();
        assert_eq!(transport.authorized_key_count(), 1);
        manager.shutdown().await;

        let store = CredentialStore::in_memory();
        let fresh = self::manager(&transport, &store);
        store
            .save_private_key(&fresh.server_id(), &key.seed())
            .unwrap();
        fresh.connect(None).await.unwrap();
        assert_eq!(fresh.phase(), SshConnected);
        fresh.shutdown().await;
    }
}
