//! Client configuration.
//!
//! Loaded from TOML; every field has a default so a partial file (or none)
//! works. `INKPAD_API_URL` and `INKPAD_COLLAB_URL` override the endpoints.
//!
//! ```toml
//! api_base_url = "https://api.example.com"
//! collab_url = "wss://collab.example.com"
//! heartbeat_interval_ms = 10000
//!
//! [reconnect]
//! initial_delay_ms = 500
//! max_attempts = 20
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::reconnect::ReconnectPolicy;

pub const API_URL_ENV: &str = "INKPAD_API_URL";
pub const COLLAB_URL_ENV: &str = "INKPAD_COLLAB_URL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the collaborator HTTP API.
    pub api_base_url: String,
    /// WebSocket URL of the collaboration server.
    pub collab_url: String,
    pub request_timeout_secs: u64,
    /// Ping period; a link silent for three periods is treated as lost.
    pub heartbeat_interval_ms: u64,
    /// Queued deltas before the offline queue is compacted.
    pub offline_queue_limit: usize,
    /// Per-document inbound event buffer.
    pub event_buffer: usize,
    /// Resend the full local state after every rejoin.
    pub resync_on_rejoin: bool,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000".to_string(),
            collab_url: "ws://localhost:5000".to_string(),
            request_timeout_secs: 30,
            heartbeat_interval_ms: 15_000,
            offline_queue_limit: 1_024,
            event_buffer: 256,
            resync_on_rejoin: false,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&raw)?.with_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        log::info!("loaded client configuration from {}", path.display());
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::default().with_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply endpoint overrides from `lookup` (normally the process
    /// environment).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(API_URL_ENV).filter(|v| !v.is_empty()) {
            self.api_base_url = url;
        }
        if let Some(url) = lookup(COLLAB_URL_ENV).filter(|v| !v.is_empty()) {
            self.collab_url = url;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_scheme("api_base_url", &self.api_base_url, &["http://", "https://"], "http(s)")?;
        check_scheme("collab_url", &self.collab_url, &["ws://", "wss://"], "ws(s)")?;
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Zero("heartbeat_interval_ms"));
        }
        if self.offline_queue_limit == 0 {
            return Err(ConfigError::Zero("offline_queue_limit"));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Zero("event_buffer"));
        }
        Ok(())
    }

    /// Absolute API URL for `path` (which starts with `/`).
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url.trim_end_matches('/'), path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

fn check_scheme(
    field: &'static str,
    value: &str,
    schemes: &[&str],
    expected: &'static str,
) -> Result<(), ConfigError> {
    if schemes.iter().any(|scheme| value.starts_with(scheme)) {
        Ok(())
    } else {
        Err(ConfigError::InvalidUrl {
            field,
            expected,
            value: value.to_string(),
        })
    }
}
