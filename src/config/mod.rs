//! # Configuration
//!
//! TOML configuration for the engine and the `nodelink` binary.
//!
//! ## Sections
//!
//! - [`SessionConfig`] - ring sizes, acknowledgement pacing, transfer limits,
//!   connection ceiling
//! - [`ReconnectPolicy`] - backoff base, cap and attempt ceiling
//! - [`ParserConfig`] - metric key policy
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use nodelink::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("nodelink.toml").await?;
//!     let config = Config::load("nodelink.toml").await?;
//!     println!("ack every {} fragments", config.session.ack_every);
//!     Ok(())
//! }
//! ```
//!
//! ## File Format
//!
//! ```toml
//! [session]
//! live_capacity = 120
//! history_capacity = 800
//! ack_every = 1
//! transfer_timeout_ms = 30000
//! drain_interval_ms = 100
//! drain_batch = 20
//! max_pending_lines = 2000
//! max_connections = 4
//!
//! [reconnect]
//! enabled = true
//! base_delay_ms = 1000
//! max_delay_ms = 15000
//! max_attempts = 6
//!
//! [parser]
//! key_policy = "permissive"
//!
//! [logging]
//! level = "info"
//! file = "nodelink.log"
//! ```
//!
//! Every section and field is optional; missing values fall back to the
//! defaults above.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::protocol::KeyPolicy;
use crate::session::series::{HISTORY_CAPACITY, LIVE_CAPACITY};
use crate::session::{ReconnectPolicy, SessionSettings, TransferSettings, MAX_CONNECTIONS};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub live_capacity: usize,
    pub history_capacity: usize,
    /// Acknowledge every Nth bulk fragment (the final one is always acked).
    pub ack_every: u32,
    pub transfer_timeout_ms: u64,
    pub drain_interval_ms: u64,
    /// History lines parsed per drain tick.
    pub drain_batch: usize,
    pub max_pending_lines: usize,
    pub max_connections: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            live_capacity: LIVE_CAPACITY,
            history_capacity: HISTORY_CAPACITY,
            ack_every: 1,
            transfer_timeout_ms: 30_000,
            drain_interval_ms: 100,
            drain_batch: 20,
            max_pending_lines: 2000,
            max_connections: MAX_CONNECTIONS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ParserConfig {
    pub key_policy: KeyPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config {
            logging: LoggingConfig {
                file: Some("nodelink.log".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.session;
        if s.live_capacity == 0 || s.history_capacity == 0 {
            return Err(anyhow!("session ring capacities must be at least 1"));
        }
        if s.ack_every == 0 {
            return Err(anyhow!("session.ack_every must be at least 1"));
        }
        if s.drain_batch == 0 || s.max_pending_lines == 0 {
            return Err(anyhow!(
                "session.drain_batch and session.max_pending_lines must be at least 1"
            ));
        }
        if s.max_connections == 0 {
            return Err(anyhow!("session.max_connections must be at least 1"));
        }
        let r = &self.reconnect;
        if r.base_delay_ms == 0 || r.max_delay_ms < r.base_delay_ms {
            return Err(anyhow!(
                "reconnect delays must satisfy 0 < base_delay_ms <= max_delay_ms"
            ));
        }
        Ok(())
    }

    /// Engine settings derived from this configuration.
    pub fn session_settings(&self) -> SessionSettings {
        let s = &self.session;
        SessionSettings {
            live_capacity: s.live_capacity,
            history_capacity: s.history_capacity,
            key_policy: self.parser.key_policy,
            transfer: TransferSettings {
                ack_every: s.ack_every,
                timeout: Duration::from_millis(s.transfer_timeout_ms),
                max_pending_lines: s.max_pending_lines,
                drain_batch: s.drain_batch,
                drain_interval: Duration::from_millis(s.drain_interval_ms),
            },
            reconnect: self.reconnect.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [session]
            ack_every = 4

            [parser]
            key_policy = "strict"
            "#,
        )
        .unwrap();
        assert_eq!(config.session.ack_every, 4);
        assert_eq!(config.session.drain_batch, 20);
        assert_eq!(config.parser.key_policy, KeyPolicy::Strict);
        assert_eq!(config.reconnect, ReconnectPolicy::default());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_session_settings_mapping() {
        let settings = Config::default().session_settings();
        assert_eq!(settings.transfer.timeout, Duration::from_secs(30));
        assert_eq!(settings.transfer.drain_batch, 20);
        assert_eq!(settings.reconnect.max_attempts, 6);
        assert_eq!(settings.key_policy, KeyPolicy::Permissive);
    }

    #[test]
    fn test_validation_rejects_zero_ack_interval() {
        let mut config = Config::default();
        config.session.ack_every = 0;
        assert!(config.validate().is_err());
        config.session.ack_every = 2;
        config.reconnect.max_delay_ms = 10;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_create_default_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodelink.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.session, SessionConfig::default());
        assert_eq!(loaded.logging.file.as_deref(), Some("nodelink.log"));
    }
}
