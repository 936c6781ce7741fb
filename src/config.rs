//! rtconfig Configuration
//!
//! Settings for a configuration service instance: where the configuration
//! blob is replicated and how the service talks to those locations.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::blob::BlobLocation;
use crate::manager::lock_timeout_from_secs;

/// Main service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Blob store configuration
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Blob store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Use HTTPS for endpoints given without a scheme
    #[serde(default = "default_true")]
    pub use_https: bool,

    /// Per-location operation timeout in seconds (0 = default)
    #[serde(default)]
    pub lock_timeout_secs: u64,

    /// Cache refresh interval in milliseconds
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// Locations holding a replica of the configuration blob
    #[serde(default)]
    pub locations: Vec<BlobLocation>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_monitor_interval_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ServiceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.store.locations.is_empty() {
            return Err(crate::Error::Config("store.locations cannot be empty".into()));
        }

        let mut seen = HashSet::new();
        for location in &self.store.locations {
            if location.endpoint.is_empty() {
                return Err(crate::Error::Config("store.locations endpoint cannot be empty".into()));
            }
            if location.container.is_empty() || location.blob_name.is_empty() {
                return Err(crate::Error::Config(format!(
                    "location {} needs a container and a blob name",
                    location.endpoint
                )));
            }
            if !seen.insert(location.to_string()) {
                return Err(crate::Error::Config(format!(
                    "location {} is listed more than once",
                    location
                )));
            }
        }

        if self.store.monitor_interval_ms == 0 {
            return Err(crate::Error::Config("store.monitor_interval_ms must be positive".into()));
        }

        if self.store.locations.len() % 2 == 0 {
            tracing::warn!(
                "{} locations configured; an odd count tolerates the same failures with one less store",
                self.store.locations.len()
            );
        }

        Ok(())
    }

    /// Get the per-location timeout as Duration
    pub fn lock_timeout(&self) -> Duration {
        lock_timeout_from_secs(self.store.lock_timeout_secs)
    }

    /// Get the monitor interval as Duration
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.store.monitor_interval_ms)
    }

    /// Calculate quorum size
    pub fn quorum_size(&self) -> usize {
        crate::quorum::majority(self.store.locations.len())
    }

    /// A sample configuration with three locations
    pub fn sample() -> Self {
        Self {
            store: StoreConfig {
                use_https: true,
                lock_timeout_secs: 0,
                monitor_interval_ms: default_monitor_interval_ms(),
                locations: vec![
                    BlobLocation::new("account1.blob.example.net"),
                    BlobLocation::new("account2.blob.example.net"),
                    BlobLocation::new("account3.blob.example.net"),
                ],
            },
            logging: LoggingConfig::default(),
        }
    }

    /// Write the configuration as TOML
    pub fn write_to(&self, path: &PathBuf) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("cannot render configuration: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
