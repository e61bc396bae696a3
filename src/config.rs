//! Configuration using Figment
//!
//! Sources, later ones winning:
//! 1. Built-in defaults
//! 2. Optional config file (`.toml`, or `.yaml`/`.yml`)
//! 3. Environment variables prefixed with `BLUESKY_BRIDGE_`, `__` between
//!    nesting levels (e.g. `BLUESKY_BRIDGE_INGEST__PORT=6000`)
//! 4. CLI overrides applied by the binary
//!
//! # Example
//! ```no_run
//! use bluesky_bridge::config::BridgeConfig;
//!
//! let config = BridgeConfig::load(Some("config/bridge.toml".as_ref()))?;
//! config.validate()?;
//! println!("Ingest port: {}", config.ingest.port);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use bridge_core::ScanDefaults;
use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "BLUESKY_BRIDGE_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Document listener settings
    pub ingest: IngestConfig,
    /// Stream store settings
    pub storage: StorageConfig,
    /// Relay settings
    pub relay: RelayConfig,
    /// Retrieval listener settings
    pub retrieval: RetrievalConfig,
    /// Scan metadata defaults
    pub scan: ScanDefaults,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored
    Pretty,
    /// Single line
    Compact,
    /// JSON lines
    Json,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "bluesky-bridge".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
        }
    }
}

/// Document listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Capacity of the queue between the engine connection and the dispatcher
    pub queue_capacity: usize,
    /// Capacity of each per-scan worker queue
    pub scan_queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5578,
            queue_capacity: 1024,
            scan_queue_capacity: 256,
        }
    }
}

/// Archival backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Segment files under `archive_dir`
    File,
    /// In-process only
    Memory,
}

/// Stream store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Archival backend
    pub backend: StorageBackend,
    /// Root directory of the file archive
    pub archive_dir: PathBuf,
    /// Ring capacity per channel (samples)
    pub ring_capacity: usize,
    /// Periodic flush interval in milliseconds (0 = flush only when rings fill or scans close)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            archive_dir: PathBuf::from("data/archive"),
            ring_capacity: bridge_storage::DEFAULT_RING_CAPACITY,
            flush_interval_ms: 1000,
        }
    }
}

/// Where relay records go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// In-process broker; subscribers attach through the bridge's subscriber port
    Local,
    /// Standalone broker process reached over TCP
    Remote,
    /// No live fan-out
    Disabled,
}

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay mode
    pub mode: RelayMode,
    /// Broker host (remote mode) or bind address (local mode, `broker` command)
    pub broker_host: String,
    /// Port publishers connect to
    pub publish_port: u16,
    /// Port subscribers connect to
    pub subscribe_port: u16,
    /// Bounded queue length per subscriber
    pub subscriber_queue_capacity: usize,
    /// Records per publish batch
    pub batch_size: usize,
    /// First reconnect delay in milliseconds
    pub reconnect_min_ms: u64,
    /// Reconnect delay cap in milliseconds
    pub reconnect_max_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: RelayMode::Local,
            broker_host: "127.0.0.1".to_string(),
            publish_port: 5579,
            subscribe_port: 5580,
            subscriber_queue_capacity: 1024,
            batch_size: 256,
            reconnect_min_ms: 100,
            reconnect_max_ms: 5000,
        }
    }
}

/// Retrieval listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Serve retrieval requests
    pub enabled: bool,
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Upper bound for blocking reads without an explicit timeout (milliseconds)
    pub default_timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 5581,
            default_timeout_ms: 30_000,
        }
    }
}

impl BridgeConfig {
    /// Load defaults, an optional file and environment overrides.
    ///
    /// The file format follows the extension: `.yaml`/`.yml` is read as YAML,
    /// anything else as TOML.
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(BridgeConfig::default()));
        if let Some(path) = path {
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
                .unwrap_or(false);
            figment = if is_yaml {
                figment.merge(Yaml::file(path))
            } else {
                figment.merge(Toml::file(path))
            };
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__")).extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let capacities = [
            ("ingest.queue_capacity", self.ingest.queue_capacity),
            ("ingest.scan_queue_capacity", self.ingest.scan_queue_capacity),
            ("storage.ring_capacity", self.storage.ring_capacity),
            (
                "relay.subscriber_queue_capacity",
                self.relay.subscriber_queue_capacity,
            ),
            ("relay.batch_size", self.relay.batch_size),
        ];
        if let Some((name, _)) = capacities.iter().find(|(_, value)| *value == 0) {
            return Err(format!("{} must be greater than 0", name));
        }

        if self.relay.mode != RelayMode::Disabled {
            if self.relay.publish_port == 0 || self.relay.subscribe_port == 0 {
                return Err("relay ports must be non-zero".to_string());
            }
            if self.relay.publish_port == self.relay.subscribe_port {
                return Err(format!(
                    "relay.publish_port and relay.subscribe_port must differ (both {})",
                    self.relay.publish_port
                ));
            }
        }
        if self.relay.reconnect_min_ms == 0
            || self.relay.reconnect_min_ms > self.relay.reconnect_max_ms
        {
            return Err(format!(
                "Invalid reconnect backoff {}..{} ms: min must be > 0 and <= max",
                self.relay.reconnect_min_ms, self.relay.reconnect_max_ms
            ));
        }

        if self.retrieval.enabled && self.retrieval.port == self.ingest.port {
            return Err(format!(
                "retrieval.port and ingest.port must differ (both {})",
                self.ingest.port
            ));
        }

        if self.storage.backend == StorageBackend::File
            && self.storage.archive_dir.as_os_str().is_empty()
        {
            return Err("storage.archive_dir must be set for the file backend".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ingest.port, 5578);
        assert_eq!(config.scan.session_name, "sim_session");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = BridgeConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.storage.ring_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("ring_capacity"));

        let mut config = BridgeConfig::default();
        config.relay.reconnect_min_ms = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bridge.toml",
                r#"
                [ingest]
                port = 6000

                [storage]
                backend = "memory"
                ring_capacity = 64
                "#,
            )?;
            jail.set_env("BLUESKY_BRIDGE_STORAGE__RING_CAPACITY", "128");

            let config = BridgeConfig::load(Some(Path::new("bridge.toml")))?;
            assert_eq!(config.ingest.port, 6000);
            assert_eq!(config.storage.backend, StorageBackend::Memory);
            assert_eq!(config.storage.ring_capacity, 128);
            // Untouched sections keep defaults
            assert_eq!(config.relay.publish_port, 5579);
            Ok(())
        });
    }

    #[test]
    fn test_yaml_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bridge.yaml",
                "relay:\n  mode: disabled\nscan:\n  session_name: p65\n",
            )?;
            let config = BridgeConfig::load(Some(Path::new("bridge.yaml")))?;
            assert_eq!(config.relay.mode, RelayMode::Disabled);
            assert_eq!(config.scan.session_name, "p65");
            assert_eq!(config.scan.number, 1);
            Ok(())
        });
    }
}
