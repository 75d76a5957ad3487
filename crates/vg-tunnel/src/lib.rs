//! vg-tunnel: SSH sessions, key provisioning and local port forwarding
//!
//! The `SessionManager` keeps one authenticated session per server alive,
//! forwards a loopback port to the remote metrics agent and reconnects with
//! exponential backoff when the network drops.

pub mod backoff;
pub mod forward;
pub mod keys;
pub mod manager;
pub mod ssh;
pub mod transport;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use backoff::ExponentialBackoff;
pub use forward::LocalForward;
pub use keys::ClientKey;
pub use manager::{SessionManager, WAKE_GRACE};
pub use ssh::RusshTransport;
pub use transport::{CommandOutput, Credential, RemoteSession, Transport};
