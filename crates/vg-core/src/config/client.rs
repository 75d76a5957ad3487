//! Client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::lock::LockScope;

/// Configuration for the monitoring client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// SSH handshake timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// SSH keepalive interval; a dead peer is detected after three misses
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// Backoff for session reconnects and agent reachability probes
    pub backoff: BackoffConfig,

    /// Comment appended to generated authorized-keys lines
    pub key_comment: String,

    /// Service name used for entries in the OS credential store
    pub keyring_service: String,

    /// App lock settings
    pub lock: LockConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(15),
            backoff: BackoffConfig::default(),
            key_comment: "vigil-client".to_string(),
            keyring_service: "com.vigil.monitor".to_string(),
            lock: LockConfig::default(),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

/// App lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Which surfaces require the PIN
    pub scope: LockScope,

    /// Lock after this much inactivity
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Consecutive failures before the cooldown starts
    pub max_attempts: u32,

    /// Length of the cooldown window
    #[serde(with = "duration_secs")]
    pub cooldown: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            scope: LockScope::None,
            idle_timeout: Duration::from_secs(5 * 60),
            max_attempts: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_matches_reconnect_policy() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.initial, Duration::from_secs(2));
        assert_eq!(backoff.max, Duration::from_secs(30));
        assert_eq!(backoff.multiplier, 2.0);
        assert_eq!(backoff.jitter, 0.0);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            connect_timeout = 5

            [lock]
            scope = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.lock.scope, LockScope::Both);
        assert_eq!(config.lock.max_attempts, 5);
        assert_eq!(config.lock.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.key_comment, "vigil-client");
    }
}
