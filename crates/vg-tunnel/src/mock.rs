//! In-memory transport for tests
//!
//! `MockTransport` behaves like a small SSH server: it accepts a configured
//! password, accepts keys that were installed through the usual install
//! command, and can be told to be unreachable or to drop live sessions.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use vg_core::{ServerIdentity, SessionError};

use crate::forward::{ForwardStream, ForwardTarget, LocalForward, OpenError};
use crate::keys;
use crate::transport::{CommandOutput, Credential, RemoteSession, Transport};

/// Host key fingerprint every mock session presents
pub const MOCK_HOST_KEY: &str = "SHA256:bW9jay1ob3N0LWtleQ";

/// A recorded connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub host: String,
    pub username: String,
    /// Method names offered, in order
    pub methods: Vec<&'static str>,
}

#[derive(Default)]
struct Shared {
    password: Mutex<Option<String>>,
    /// Base64 key blobs present in the emulated `authorized_keys`
    authorized: Mutex<HashSet<String>>,
    reachable: AtomicBool,
    refuse_forward: AtomicBool,
    exec_status: AtomicU32,
    /// Where forwarded channels connect; `None` refuses every channel
    agent_addr: Mutex<Option<SocketAddr>>,
    attempts: Mutex<Vec<Attempt>>,
    commands: Mutex<Vec<String>>,
    sessions: Mutex<Vec<CancellationToken>>,
}

/// Scriptable transport
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A reachable server with no accepted credentials
    pub fn new() -> Self {
        let shared = Shared {
            reachable: AtomicBool::new(true),
            ..Default::default()
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Accept this password
    pub fn set_password(&self, password: &str) {
        *self.shared.password.lock().unwrap() = Some(password.to_string());
    }

    /// Make every connection attempt fail with a network error
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make `open_forward` fail
    pub fn set_refuse_forward(&self, refuse: bool) {
        self.shared.refuse_forward.store(refuse, Ordering::SeqCst);
    }

    /// Exit status returned by every command
    pub fn set_exec_status(&self, status: u32) {
        self.shared.exec_status.store(status, Ordering::SeqCst);
    }

    /// Connect forwarded channels to `addr`
    pub fn set_agent_addr(&self, addr: Option<SocketAddr>) {
        *self.shared.agent_addr.lock().unwrap() = addr;
    }

    /// Remove every installed key
    pub fn revoke_keys(&self) {
        self.shared.authorized.lock().unwrap().clear();
    }

    /// Number of keys in the emulated `authorized_keys`
    pub fn authorized_key_count(&self) -> usize {
        self.shared.authorized.lock().unwrap().len()
    }

    /// End every open session as if the network went away
    pub fn drop_sessions(&self) {
        for closed in self.shared.sessions.lock().unwrap().drain(..) {
            closed.cancel();
        }
    }

    /// Number of sessions not yet closed
    pub fn open_sessions(&self) -> usize {
        self.shared
            .sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|closed| !closed.is_cancelled())
            .count()
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.shared.attempts.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.shared.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        server: &ServerIdentity,
        credentials: &[Credential],
    ) -> Result<Arc<dyn RemoteSession>, SessionError> {
        self.shared.attempts.lock().unwrap().push(Attempt {
            host: server.host.clone(),
            username: server.username.clone(),
            methods: credentials.iter().map(Credential::method).collect(),
        });

        if !self.shared.reachable.load(Ordering::SeqCst) {
            return Err(SessionError::Network(format!(
                "Connection to {} refused",
                server.ssh_address()
            )));
        }
        if let Some(pinned) = &server.host_key {
            if pinned != MOCK_HOST_KEY {
                return Err(SessionError::Auth("Host key mismatch".to_string()));
            }
        }

        let accepted = credentials.iter().any(|credential| match credential {
            Credential::PrivateKey(key) => {
                let blob = keys::public_key_blob(&key.verifying_key());
                self.shared.authorized.lock().unwrap().contains(&blob)
            }
            Credential::Password(password) => {
                self.shared.password.lock().unwrap().as_deref() == Some(password.as_str())
            }
        });
        if !accepted {
            return Err(SessionError::Auth("Permission denied".to_string()));
        }

        let closed = CancellationToken::new();
        self.shared.sessions.lock().unwrap().push(closed.clone());
        Ok(Arc::new(MockSession {
            shared: Arc::clone(&self.shared),
            closed,
        }))
    }
}

struct MockSession {
    shared: Arc<Shared>,
    closed: CancellationToken,
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn open_forward(&self, _remote_port: u16) -> Result<LocalForward, SessionError> {
        if self.closed.is_cancelled() {
            return Err(SessionError::Tunnel("Session closed".to_string()));
        }
        if self.shared.refuse_forward.load(Ordering::SeqCst) {
            return Err(SessionError::Tunnel("Forwarding refused".to_string()));
        }
        let target = Arc::new(MockTarget {
            shared: Arc::clone(&self.shared),
            closed: self.closed.clone(),
        });
        LocalForward::bind(target, self.closed.clone()).await
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, SessionError> {
        if self.closed.is_cancelled() {
            return Err(SessionError::Network("Session closed".to_string()));
        }
        self.shared.commands.lock().unwrap().push(command.to_string());

        let exit_status = self.shared.exec_status.load(Ordering::SeqCst);
        if exit_status == 0 {
            if let Some(blob) = installed_blob(command) {
                self.shared.authorized.lock().unwrap().insert(blob);
            }
        }
        Ok(CommandOutput {
            exit_status,
            output: String::new(),
        })
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    async fn close(&self) {
        self.closed.cancel();
    }

    fn host_key_fingerprint(&self) -> Option<String> {
        Some(MOCK_HOST_KEY.to_string())
    }
}

struct MockTarget {
    shared: Arc<Shared>,
    closed: CancellationToken,
}

#[async_trait]
impl ForwardTarget for MockTarget {
    async fn open(&self, _originator: SocketAddr) -> Result<Box<dyn ForwardStream>, OpenError> {
        if self.closed.is_cancelled() {
            return Err(OpenError::SessionLost("Session closed".to_string()));
        }
        let addr = *self.shared.agent_addr.lock().unwrap();
        let Some(addr) = addr else {
            return Err(OpenError::Refused("Connection refused".to_string()));
        };
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| OpenError::Refused(e.to_string()))?;
        Ok(Box::new(stream))
    }
}

/// Key blob from an install command, if `command` is one
fn installed_blob(command: &str) -> Option<String> {
    let start = command.find(keys::KEY_TYPE)? + keys::KEY_TYPE.len() + 1;
    let rest = &command[start..];
    let end = rest.find(' ')?;
    Some(rest[..end].to_string())
}
