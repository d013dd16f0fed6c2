//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `monitor.toml`.
//!     loads configuration from file or falls back to defaults.
//!     a file that exists but does not parse is an error, not a fallback.
//!
//! structure:
//!     - ServerConfig: bind address, log file, missing-field policy.
//!     - PollerConfig: server url, poll cadence, fetch timeout, series capacity.
//!     - RecorderConfig: where record_<n>.csv files go.
//!     - LoggingConfig: tracing level and per-reading output.
//!
//!     every field has a default, so a partial file (or none) is fine.
//!
//! ==============================================================================

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use tracing::info;

use crate::domain::MissingFieldPolicy;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MonitorConfig {
    pub server: ServerConfig,
    pub poller: PollerConfig,
    pub recorder: RecorderConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_path: PathBuf,
    pub missing_fields: MissingFieldPolicy,
}

/// what the monitor shows when a fetch fails
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// leave the series as it was
    #[default]
    KeepLast,
    /// if the series is empty, add a single "No Data" entry
    Sentinel,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PollerConfig {
    /// base url of the server, e.g. http://192.168.0.105:5000
    pub server_url: String,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub capacity: usize,
    pub on_failure: FailurePolicy,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RecorderConfig {
    pub output_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            log_path: PathBuf::from("database.csv"),
            missing_fields: MissingFieldPolicy::Strict,
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".to_string(),
            interval_ms: 2000,
            timeout_ms: 1500,
            capacity: 50,
            on_failure: FailurePolicy::KeepLast,
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self { output_dir: PathBuf::from(".") }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: true }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl MonitorConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: MonitorConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// first config file found in the usual places, if any
    pub fn locate() -> Option<PathBuf> {
        let paths = [
            PathBuf::from("config").join("monitor.toml"),
            PathBuf::from("..").join("config").join("monitor.toml"),
        ];
        paths.into_iter().find(|p| p.exists())
    }

    /// Load the given file, a located one, or defaults
    pub fn load_or_default(explicit: Option<&Path>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        match explicit.map(Path::to_path_buf).or_else(Self::locate) {
            Some(path) => Ok((Self::load(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    /// reject values that would stall or spin the poll loop
    pub fn validate(&self) -> anyhow::Result<()> {
        let p = &self.poller;
        if p.interval_ms == 0 {
            bail!("poller.interval_ms must be > 0");
        }
        if p.capacity == 0 {
            bail!("poller.capacity must be > 0");
        }
        if p.timeout_ms == 0 || p.timeout_ms >= p.interval_ms {
            bail!(
                "poller.timeout_ms ({}) must be > 0 and below poller.interval_ms ({})",
                p.timeout_ms,
                p.interval_ms
            );
        }
        Ok(())
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        let bind = format!("{}:{}", self.server.host, self.server.port);
        info!(
            bind = %bind,
            log_path = %self.server.log_path.display(),
            missing_fields = ?self.server.missing_fields,
            "server config"
        );
        info!(
            server_url = %self.poller.server_url,
            interval_ms = self.poller.interval_ms,
            timeout_ms = self.poller.timeout_ms,
            capacity = self.poller.capacity,
            on_failure = ?self.poller.on_failure,
            output_dir = %self.recorder.output_dir.display(),
            "monitor config"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.log_path, PathBuf::from("database.csv"));
        assert_eq!(config.poller.interval(), Duration::from_millis(2000));
        assert_eq!(config.poller.capacity, 50);
        assert_eq!(config.poller.on_failure, FailurePolicy::KeepLast);
        assert_eq!(config.server.missing_fields, MissingFieldPolicy::Strict);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file() {
        let config: MonitorConfig = toml::from_str(
            r#"
            [server]
            port = 8080
            missing_fields = "permissive"

            [poller]
            server_url = "http://10.0.0.7:8080"
            on_failure = "sentinel"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.missing_fields, MissingFieldPolicy::Permissive);
        assert_eq!(config.poller.server_url, "http://10.0.0.7:8080");
        assert_eq!(config.poller.on_failure, FailurePolicy::Sentinel);
        assert_eq!(config.poller.interval_ms, 2000);
        assert_eq!(config.server.bind_addr().unwrap().port(), 8080);
    }

    #[test]
    fn test_validate_rejects_timeout_past_interval() {
        let mut config = MonitorConfig::default();
        config.poller.timeout_ms = config.poller.interval_ms;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.poller.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.toml");
        std::fs::write(&path, "[recorder]\noutput_dir = \"sessions\"\n").unwrap();

        let config = MonitorConfig::load(&path).unwrap();
        assert_eq!(config.recorder.output_dir, PathBuf::from("sessions"));

        let (config, found) = MonitorConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(found.as_deref(), Some(path.as_path()));
        assert_eq!(config.recorder.output_dir, PathBuf::from("sessions"));

        std::fs::write(&path, "[poller]\ninterval_ms = 0\n").unwrap();
        assert!(MonitorConfig::load(&path).is_err());
        assert!(MonitorConfig::load_or_default(Some(&path)).is_err());
    }
}
