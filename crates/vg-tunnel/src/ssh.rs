//! SSH transport built on russh
//!
//! Host keys are pinned on first use: the fingerprint seen during the first
//! successful connection is stored with the server identity and any later
//! mismatch is rejected as an authentication failure.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use tokio_util::sync::{CancellationToken, DropGuard};

use vg_core::config::ClientConfig;
use vg_core::{ServerIdentity, SessionError};

use crate::forward::{ForwardStream, ForwardTarget, LocalForward, OpenError};
use crate::transport::{CommandOutput, Credential, RemoteSession, Transport};

/// Unanswered keepalives before the session is considered dead
const KEEPALIVE_MAX: usize = 3;

/// Transport that speaks SSH to the real host
pub struct RusshTransport {
    config: Arc<Config>,
    connect_timeout: Duration,
}

impl RusshTransport {
    /// Create a transport from client configuration
    pub fn new(config: &ClientConfig) -> Self {
        let ssh_config = Config {
            keepalive_interval: Some(config.keepalive_interval),
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        };
        Self {
            config: Arc::new(ssh_config),
            connect_timeout: config.connect_timeout,
        }
    }
}

impl Default for RusshTransport {
    fn default() -> Self {
        Self::new(&ClientConfig::default())
    }
}

#[async_trait]
impl Transport for RusshTransport {
    async fn connect(
        &self,
        server: &ServerIdentity,
        credentials: &[Credential],
    ) -> Result<Arc<dyn RemoteSession>, SessionError> {
        let closed = CancellationToken::new();
        let seen_host_key = Arc::new(Mutex::new(None));
        let handler = ClientHandler {
            host: server.host.clone(),
            pinned_host_key: server.host_key.clone(),
            seen_host_key: Arc::clone(&seen_host_key),
            _closed: closed.clone().drop_guard(),
        };

        let address = server.ssh_address();
        tracing::debug!("Connecting to {}", address);
        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(
                Arc::clone(&self.config),
                (server.host.as_str(), server.ssh_port),
                handler,
            ),
        )
        .await
        .map_err(|_| SessionError::Network(format!("Connection to {} timed out", address)))?
        .map_err(|e| match e {
            russh::Error::UnknownKey => SessionError::Auth(format!(
                "Host key of {} does not match the pinned fingerprint",
                address
            )),
            other => SessionError::Network(format!("Failed to connect to {}: {}", address, other)),
        })?;

        let mut authenticated = false;
        for credential in credentials {
            tracing::debug!(
                "Authenticating as '{}' with {}",
                server.username,
                credential.method()
            );
            let accepted = match credential {
                Credential::PrivateKey(key) => {
                    let pair = Arc::new(KeyPair::Ed25519(key.clone()));
                    handle.authenticate_publickey(&server.username, pair).await
                }
                Credential::Password(password) => {
                    handle
                        .authenticate_password(&server.username, password.as_str())
                        .await
                }
            }
            .map_err(|e| SessionError::Network(format!("Authentication exchange failed: {}", e)))?;

            if accepted {
                authenticated = true;
                break;
            }
            tracing::debug!("{} authentication rejected", credential.method());
        }

        if !authenticated {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "authentication failed", "en")
                .await;
            return Err(SessionError::Auth(format!(
                "{}@{} rejected every offered credential",
                server.username, address
            )));
        }

        let host_key = seen_host_key.lock().ok().and_then(|seen| seen.clone());
        tracing::info!("Connected to {} as {}", address, server.username);

        Ok(Arc::new(RusshSession {
            handle: Arc::new(handle),
            closed,
            host_key,
        }))
    }
}

/// An authenticated russh session
struct RusshSession {
    handle: Arc<Handle<ClientHandler>>,
    /// Cancelled when the session task ends
    closed: CancellationToken,
    host_key: Option<String>,
}

#[async_trait]
impl RemoteSession for RusshSession {
    async fn open_forward(&self, remote_port: u16) -> Result<LocalForward, SessionError> {
        let target = Arc::new(DirectTcpip {
            handle: Arc::clone(&self.handle),
            remote_port,
        });
        LocalForward::bind(target, self.closed.clone()).await
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, SessionError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| SessionError::Network(format!("Failed to open session channel: {}", e)))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| SessionError::Network(format!("Failed to start command: {}", e)))?;

        let mut output = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                _ => {}
            }
        }

        let exit_status = exit_status.ok_or_else(|| {
            SessionError::Network("Channel closed before the command exited".to_string())
        })?;
        Ok(CommandOutput {
            exit_status,
            output: String::from_utf8_lossy(&output).into_owned(),
        })
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await
        {
            tracing::debug!("Disconnect failed: {}", e);
        }
        self.closed.cancel();
    }

    fn host_key_fingerprint(&self) -> Option<String> {
        self.host_key.clone()
    }
}

/// Opens `direct-tcpip` channels to the remote loopback
struct DirectTcpip {
    handle: Arc<Handle<ClientHandler>>,
    remote_port: u16,
}

#[async_trait]
impl ForwardTarget for DirectTcpip {
    async fn open(&self, originator: SocketAddr) -> Result<Box<dyn ForwardStream>, OpenError> {
        match self
            .handle
            .channel_open_direct_tcpip(
                "127.0.0.1",
                self.remote_port as u32,
                originator.ip().to_string(),
                originator.port() as u32,
            )
            .await
        {
            Ok(channel) => Ok(Box::new(channel.into_stream())),
            // The server could not reach the port; the session is still up
            Err(russh::Error::ChannelOpenFailure(reason)) => {
                Err(OpenError::Refused(format!("{:?}", reason)))
            }
            Err(e) => Err(OpenError::SessionLost(e.to_string())),
        }
    }
}

/// SSH client handler
struct ClientHandler {
    host: String,
    /// Fingerprint the host must present, if one has been pinned
    pinned_host_key: Option<String>,
    /// Fingerprint actually presented
    seen_host_key: Arc<Mutex<Option<String>>>,
    /// Fires when russh drops the handler at the end of the session
    _closed: DropGuard,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        tracing::debug!("Host key for {}: {}", self.host, fingerprint);

        if let Ok(mut seen) = self.seen_host_key.lock() {
            *seen = Some(fingerprint.clone());
        }

        match &self.pinned_host_key {
            Some(pinned) if *pinned != fingerprint => {
                tracing::warn!(
                    "Host key for {} changed: expected {}, got {}",
                    self.host,
                    pinned,
                    fingerprint
                );
                Ok(false)
            }
            _ => Ok(true),
        }
    }
}
