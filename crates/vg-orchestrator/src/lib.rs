//! vg-orchestrator: Drives the connections to every monitored server
//!
//! The orchestrator owns one session manager per server, maps connection
//! phases to user-facing statuses, onboards new servers and provisions their
//! client keys, and relays agent statistics to subscribers.

pub mod agent;
pub mod error;
pub mod orchestrator;

pub use agent::{AgentClient, AgentError, HttpAgentClient};
pub use error::OrchestratorError;
pub use orchestrator::{Orchestrator, OrchestratorEvent, ServerSummary};
