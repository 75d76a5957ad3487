//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SessionError;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default HTTP port of the remote metrics agent
pub const DEFAULT_AGENT_PORT: u16 = 7654;

/// Unique identifier for a configured server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub String);

impl ServerId {
    /// Create a server ID from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random server ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ServerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A monitored host reachable over SSH
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// Stable identifier, also the suffix of the credential keys
    pub id: ServerId,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Host name or address
    pub host: String,

    /// SSH username
    pub username: String,

    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Agent HTTP port on the remote loopback interface
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,

    /// Whether our generated public key has been installed on the host
    #[serde(default)]
    pub has_key_installed: bool,

    /// SHA-256 fingerprint of the host key, pinned on first connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key: Option<String>,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_agent_port() -> u16 {
    DEFAULT_AGENT_PORT
}

impl ServerIdentity {
    /// Create a new identity with a fresh ID and default ports
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            id: ServerId::generate(),
            name: host.clone(),
            host,
            username: username.into(),
            ssh_port: DEFAULT_SSH_PORT,
            agent_port: DEFAULT_AGENT_PORT,
            has_key_installed: false,
            host_key: None,
        }
    }

    /// `host:port` of the SSH daemon
    pub fn ssh_address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.ssh_port)
        } else {
            format!("{}:{}", self.host, self.ssh_port)
        }
    }

    /// Whether `other` points at a different endpoint or account.
    ///
    /// Display name, key-installation state and the pinned host key are
    /// ignored.
    pub fn connection_differs(&self, other: &ServerIdentity) -> bool {
        self.host != other.host
            || self.username != other.username
            || self.ssh_port != other.ssh_port
            || self.agent_port != other.agent_port
    }

    /// Take the user-editable fields from `edited`.
    ///
    /// The pinned host key and key-installation flag survive for the same
    /// endpoint and are cleared for a different one. Returns whether the
    /// endpoint or account changed.
    pub fn apply_edit(&mut self, edited: ServerIdentity) -> bool {
        let differs = self.connection_differs(&edited);
        let (host_key, has_key_installed) = if differs {
            (None, false)
        } else {
            (self.host_key.take(), self.has_key_installed)
        };
        *self = ServerIdentity {
            id: self.id.clone(),
            host_key,
            has_key_installed,
            ..edited
        };
        differs
    }
}

/// Stage along the path from no connection to live data streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionPhase {
    Disconnected,
    SshConnecting,
    SshConnected,
    TunnelOpen,
    Live,
}

impl ConnectionPhase {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Success advances exactly one step. Any connected phase may reset to
    /// `Disconnected`, and `Live` may fall back to `TunnelOpen` when the agent
    /// stops answering while the transport stays healthy.
    pub fn can_transition_to(self, next: ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        matches!(
            (self, next),
            (Disconnected, SshConnecting)
                | (SshConnecting, SshConnected)
                | (SshConnected, TunnelOpen)
                | (TunnelOpen, Live)
                | (Live, TunnelOpen)
                | (SshConnecting | SshConnected | TunnelOpen | Live, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionPhase::Disconnected => write!(f, "disconnected"),
            ConnectionPhase::SshConnecting => write!(f, "sshConnecting"),
            ConnectionPhase::SshConnected => write!(f, "sshConnected"),
            ConnectionPhase::TunnelOpen => write!(f, "tunnelOpen"),
            ConnectionPhase::Live => write!(f, "live"),
        }
    }
}

/// A single phase transition, as broadcast by a session manager
#[derive(Debug, Clone)]
pub struct PhaseEvent {
    pub server_id: ServerId,
    pub from: ConnectionPhase,
    pub to: ConnectionPhase,
    /// Reason accompanying a reset to `Disconnected`
    pub error: Option<SessionError>,
}

/// Caller-visible status of a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Agent data is streaming
    Connected,
    /// Session or tunnel is being established
    Connecting,
    /// Lost the session, retrying with backoff
    Reconnecting,
    /// Tunnel is healthy but the agent does not answer
    AgentOffline,
    /// Both key and password were rejected; waiting for new credentials
    AuthFailed,
    /// Not running (never started, stopped, or failed permanently)
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Reconnecting => write!(f, "reconnecting"),
            ConnectionStatus::AgentOffline => write!(f, "agent offline"),
            ConnectionStatus::AuthFailed => write!(f, "auth failed"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}
