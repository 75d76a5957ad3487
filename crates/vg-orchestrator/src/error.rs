//! Orchestrator errors

use thiserror::Error;

use vg_core::error::ConfigError;
use vg_core::{ServerId, SessionError, StoreError};

use crate::agent::AgentError;

/// Errors surfaced by foreground orchestrator operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A server with this ID is already managed
    #[error("Server {0} is already configured")]
    AlreadyExists(ServerId),

    /// No server with this ID is managed
    #[error("Server {0} not found")]
    NotFound(ServerId),
}

impl OrchestratorError {
    /// A sentence suitable for showing to the person adding the server
    pub fn user_message(&self) -> String {
        match self {
            OrchestratorError::Session(SessionError::Auth(_)) => {
                "The server rejected the username or password.".to_string()
            }
            OrchestratorError::Session(SessionError::Network(_)) => {
                "Could not reach the server. Check the address and that SSH is running."
                    .to_string()
            }
            OrchestratorError::Session(SessionError::Tunnel(_)) => {
                "Connected over SSH, but the agent port could not be forwarded.".to_string()
            }
            OrchestratorError::Session(SessionError::RemoteCommand { status, .. }) => {
                format!("A command on the server failed with status {}.", status)
            }
            OrchestratorError::Session(SessionError::Cancelled) => {
                "The operation was cancelled.".to_string()
            }
            OrchestratorError::Session(_) | OrchestratorError::Store(_) => {
                "Stored credentials could not be read. Try removing and adding the server again."
                    .to_string()
            }
            OrchestratorError::Agent(_) => {
                "Connected, but the monitoring agent did not respond. Is it installed and running?"
                    .to_string()
            }
            OrchestratorError::Config(e) => format!("Could not save the server list: {}", e),
            OrchestratorError::AlreadyExists(_) => "This server is already added.".to_string(),
            OrchestratorError::NotFound(_) => "This server is not configured.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages_follow_failure_class() {
        let auth = OrchestratorError::from(SessionError::Auth("denied".into()));
        assert!(auth.user_message().contains("rejected"));

        let network = OrchestratorError::from(SessionError::Network("refused".into()));
        assert!(network.user_message().contains("Could not reach"));

        let agent = OrchestratorError::from(AgentError::Unreachable("refused".into()));
        assert!(agent.user_message().contains("agent"));

        let key = OrchestratorError::from(SessionError::InvalidKeyMaterial("short".into()));
        assert!(key.user_message().contains("credentials"));
    }
}
