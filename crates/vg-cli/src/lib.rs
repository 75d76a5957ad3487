//! vg-cli: Command-line interface for Vigil
//!
//! Provides the `vigil` binary for onboarding servers, watching their
//! connection status and statistics, and managing the app lock PIN.

pub mod commands;
pub mod context;
pub mod output;
pub mod prompt;
