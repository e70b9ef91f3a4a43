//! Session configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config. The
//! binary loads a file and then applies CLI overrides on top.

use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub signaling: SignalingConfig,
    pub transport: TransportConfig,
    pub recovery: RecoveryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Endpoint that takes an offer and returns an answer.
    pub url: String,
    pub timeout_ms: u64,
    /// Sent as `Authorization: Bearer ...` when present.
    pub bearer_token: Option<String>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:3000/session".to_string(),
            timeout_ms: 30_000,
            bearer_token: None,
        }
    }
}

impl SignalingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Relay/reflection servers, e.g. `stun:stun.l.google.com:19302`.
    pub ice_servers: Vec<String>,
    pub candidate_pool_size: u8,
    pub channel_label: String,
    /// Address to bind the media socket to. Picked from the host's
    /// interfaces when unset.
    pub bind_ip: Option<IpAddr>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            candidate_pool_size: 10,
            channel_label: "oai-events".to_string(),
            bind_ip: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// `base * 2^(n-1)`
    Exponential,
    /// `base * n`
    Linear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub grace_period_ms: u64,
    pub backoff: Backoff,
    /// Try an in-place ICE restart before tearing the transport down.
    pub ice_restart_first: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            grace_period_ms: 5_000,
            backoff: Backoff::Exponential,
            ice_restart_first: false,
        }
    }
}

impl RecoveryConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Delay before reconnection attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        let ms = match self.backoff {
            Backoff::Linear => self.base_delay_ms.saturating_mul(u64::from(n)),
            Backoff::Exponential => {
                let factor = 1u64.checked_shl(n - 1).unwrap_or(u64::MAX);
                self.base_delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.signaling.url).map_err(|e| {
            ConfigError::Invalid(format!("signaling url {:?}: {e}", self.signaling.url))
        })?;

        if self.signaling.timeout_ms == 0 {
            return Err(ConfigError::Invalid("signaling timeout must be positive".into()));
        }

        for server in &self.transport.ice_servers {
            let scheme = server.split(':').next().unwrap_or_default();
            if !matches!(scheme, "stun" | "stuns" | "turn" | "turns") {
                return Err(ConfigError::Invalid(format!(
                    "unsupported ICE server {server:?}"
                )));
            }
        }

        if self.transport.channel_label.is_empty() {
            return Err(ConfigError::Invalid("channel label must not be empty".into()));
        }

        let r = &self.recovery;
        if r.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if r.max_delay_ms < r.base_delay_ms {
            return Err(ConfigError::Invalid(
                "max_delay_ms must not be below base_delay_ms".into(),
            ));
        }

        Ok(())
    }
}
