//! Transport seam between the session manager and an SSH implementation
//!
//! The session manager only needs to authenticate, forward one port, run a
//! command and learn when the connection is gone. Keeping that surface behind
//! traits lets the reconnect logic be driven by an in-memory transport in
//! tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use ed25519_dalek::SigningKey;

use vg_core::{ServerIdentity, SessionError};

use crate::forward::LocalForward;

/// A credential offered during authentication
#[derive(Clone)]
pub enum Credential {
    /// Ed25519 private key
    PrivateKey(SigningKey),
    /// Account password
    Password(String),
}

impl Credential {
    /// Authentication method name, for logging
    pub fn method(&self) -> &'static str {
        match self {
            Credential::PrivateKey(_) => "publickey",
            Credential::Password(_) => "password",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential::{}(<redacted>)", self.method())
    }
}

/// Result of a remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status reported by the remote side
    pub exit_status: u32,
    /// Combined stdout and stderr
    pub output: String,
}

impl CommandOutput {
    /// Convert a non-zero exit status into an error
    pub fn into_result(self) -> Result<String, SessionError> {
        if self.exit_status == 0 {
            Ok(self.output)
        } else {
            Err(SessionError::RemoteCommand {
                status: self.exit_status,
                output: self.output,
            })
        }
    }
}

/// Establishes authenticated sessions
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `server` and authenticate.
    ///
    /// Credentials are offered in order on the same connection. Returns
    /// `SessionError::Auth` if every credential was rejected and
    /// `SessionError::Network` if the host could not be reached.
    async fn connect(
        &self,
        server: &ServerIdentity,
        credentials: &[Credential],
    ) -> Result<Arc<dyn RemoteSession>, SessionError>;
}

/// An authenticated session
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Forward a local loopback port to `remote_port` on the remote loopback
    async fn open_forward(&self, remote_port: u16) -> Result<LocalForward, SessionError>;

    /// Run a command and collect its output and exit status
    async fn exec(&self, command: &str) -> Result<CommandOutput, SessionError>;

    /// Resolves once the session has ended for any reason
    async fn closed(&self);

    /// Close the session
    async fn close(&self);

    /// Fingerprint of the host key presented during the handshake
    fn host_key_fingerprint(&self) -> Option<String>;
}
