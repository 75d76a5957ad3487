//! vg-core: Core abstractions and configuration for Vigil
//!
//! This crate provides the shared domain types, the error taxonomy, the
//! configuration files, the secure credential store and the app lock used by
//! the tunnel, orchestrator and CLI components.

pub mod config;
pub mod credentials;
pub mod error;
pub mod lock;
pub mod types;

pub use credentials::{CredentialStore, KeyringStore, MemoryStore, SecretStore};
pub use error::{ErrorKind, SessionError, StoreError};
pub use lock::{LockManager, LockScope, Surface, UnlockOutcome};
pub use types::{ConnectionPhase, ConnectionStatus, PhaseEvent, ServerId, ServerIdentity};
