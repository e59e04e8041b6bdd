//! Engine and remote configuration
//!
//! Both structs deserialize from JSON with every field optional; missing
//! fields take the defaults below. Durations are given in whole seconds.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::SyncResult;
use crate::queue::DEFAULT_MAX_RETRIES;

/// Tuning of the sync cycle
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Period of the background sync timer
    #[serde(with = "duration_secs")]
    pub sync_interval: Duration,
    /// Failed attempts before a pending action is dropped
    pub max_retries: u32,
    /// How far back the invoice pull reaches
    pub invoice_window_days: i64,
    /// Upper bound on invoices fetched per pull
    pub invoice_pull_limit: u32,
    /// Run a cycle from `init()` when already online
    pub sync_on_init: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            max_retries: DEFAULT_MAX_RETRIES,
            invoice_window_days: 30,
            invoice_pull_limit: 500,
            sync_on_init: true,
        }
    }
}

/// Connection settings for [`crate::sync::HttpRemote`]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// API root, e.g. `https://pos.example.com/api`
    pub base_url: String,
    /// Per-request timeout
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000/api".to_string(),
            timeout: Duration::from_secs(15),
        }
    }
}

/// Everything a host needs, as read from a config file
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PosSyncConfig {
    pub engine: EngineConfig,
    pub remote: RemoteConfig,
}

impl PosSyncConfig {
    /// Load a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.sync_interval, Duration::from_secs(30));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.invoice_window_days, 30);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: PosSyncConfig = serde_json::from_value(json!({
            "engine": { "sync_interval": 10 },
            "remote": { "base_url": "https://pos.example.com/api", "timeout": 3 }
        }))
        .unwrap();

        assert_eq!(config.engine.sync_interval, Duration::from_secs(10));
        assert_eq!(config.engine.max_retries, 5);
        assert_eq!(config.remote.timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("possync.json");
        std::fs::write(&path, r#"{"engine": {"max_retries": 3}}"#).unwrap();

        let config = PosSyncConfig::from_file(&path).unwrap();
        assert_eq!(config.engine.max_retries, 3);
        assert_eq!(config.remote, RemoteConfig::default());
    }
}
