//! Core error types for Vigil

use std::path::PathBuf;
use thiserror::Error;

use crate::types::ConnectionPhase;

/// Coarse classification of a session failure.
///
/// The orchestrator maps this to a user-visible status, the reconnect loop
/// uses it to decide whether another attempt makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    Network,
    Tunnel,
    RemoteCommand,
    DataIntegrity,
    Cancelled,
}

/// Errors raised while establishing or using a remote-shell session
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// Key rejected, password rejected, or both
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Handshake timeout, connection refused, host unreachable
    #[error("Network error: {0}")]
    Network(String),

    /// Forwarding channel refused or closed
    #[error("Tunnel error: {0}")]
    Tunnel(String),

    /// Remote command exited with a non-zero status
    #[error("Remote command exited with status {status}")]
    RemoteCommand { status: u32, output: String },

    /// Stored key bytes are not a valid ed25519 seed
    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Secure storage failed
    #[error("Credential store error: {0}")]
    Store(#[from] StoreError),

    /// A phase change was requested that the state machine does not allow
    #[error("Invalid phase transition from {from} to {to}")]
    InvalidTransition {
        from: ConnectionPhase,
        to: ConnectionPhase,
    },

    /// The operation was cancelled by removal or shutdown
    #[error("Operation cancelled")]
    Cancelled,
}

impl SessionError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Auth(_) => ErrorKind::Auth,
            SessionError::Network(_) => ErrorKind::Network,
            SessionError::Tunnel(_) => ErrorKind::Tunnel,
            SessionError::RemoteCommand { .. } => ErrorKind::RemoteCommand,
            SessionError::InvalidKeyMaterial(_)
            | SessionError::Store(_)
            | SessionError::InvalidTransition { .. } => ErrorKind::DataIntegrity,
            SessionError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether a background reconnect loop should try again after this error.
    ///
    /// Only network-shaped failures are retried; authentication and
    /// data-integrity failures are reported upward instead.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Tunnel)
    }
}

/// Secure storage errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The platform store rejected the operation
    #[error("{operation} of '{key}' failed: {status}")]
    Platform {
        operation: &'static str,
        key: String,
        status: String,
    },

    /// A stored text value was not valid UTF-8
    #[error("Value stored under '{key}' is not valid UTF-8")]
    Encoding { key: String },
}

/// App lock errors
#[derive(Error, Debug)]
pub enum LockError {
    /// PIN is not exactly four ASCII digits
    #[error("PIN must be exactly 4 digits")]
    InvalidPin,

    /// The stored PIN record has an unexpected length
    #[error("Stored PIN record is corrupt")]
    CorruptRecord,

    /// Underlying secure storage failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
