use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Controller settings, read from YAML with every field optional
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// address the metrics server binds to, port 0 picks an ephemeral port
    pub metrics_listen_address: String,
    pub metrics_read_timeout_seconds: u64,
    /// bounds connection shutdown and idle keep-alive; actix has no deadline
    /// on a single response write
    pub metrics_write_timeout_seconds: u64,
    pub metrics_shutdown_timeout_seconds: u64,
    /// how often current_certificate_request_count is recomputed from a full list
    pub certificate_request_resync_seconds: u64,
    pub log_level: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            metrics_listen_address: "0.0.0.0:9402".to_owned(),
            metrics_read_timeout_seconds: 8,
            metrics_write_timeout_seconds: 8,
            metrics_shutdown_timeout_seconds: 5,
            certificate_request_resync_seconds: 300,
            log_level: "info".to_owned(),
        }
    }
}

impl ControllerConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml(&yaml).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Load from `CONTROLLER_CONFIG` if set, then apply env overrides
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("CONTROLLER_CONFIG") {
            Ok(path) if !path.is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = lookup("METRICS_LISTEN_ADDRESS").filter(|v| !v.is_empty()) {
            self.metrics_listen_address = address;
        }
        if let Some(level) = lookup("LOG_LEVEL").filter(|v| !v.is_empty()) {
            self.log_level = level;
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.metrics_read_timeout_seconds)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.metrics_write_timeout_seconds)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.certificate_request_resync_seconds.max(1))
    }
}
