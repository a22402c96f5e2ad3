//! Configuration management for the topology engine
//!
//! This module provides structured configuration using TOML/YAML files with
//! serde for serialization and deserialization. Every section has sensible
//! defaults so partial files are accepted.

use crate::gtid::RecoveryMethod;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
    /// Timeouts for probes and bounded waits
    pub timeouts: TimeoutConfig,
    /// Distributed lock configuration
    pub locks: LockConfig,
    /// Metadata store configuration
    pub metadata: MetadataConfig,
    /// Option defaults applied to newly created groups
    pub defaults: GroupDefaults,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Log format
    pub format: LogFormat,
    /// Explicit filter directive (overrides `level`), e.g. "topology_core=debug"
    pub filter: Option<String>,
    /// Log file path (optional)
    pub file_path: Option<String>,
    /// Log file rotation
    pub rotation: LogRotation,
}

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Log format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogFormat {
    /// Simple text format
    Simple,
    /// JSON format
    Json,
    /// Multi-line human readable format
    Pretty,
}

/// Log file rotation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogRotation {
    Never,
    Hourly,
    Daily,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter
    pub enabled: bool,
    /// Exporter bind address
    pub bind_address: String,
    /// Exporter port
    pub port: u16,
    /// Static labels attached to every series
    pub labels: HashMap<String, String>,
}

/// Timeouts for probes and bounded waits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Per-instance health probe timeout in milliseconds
    pub probe_timeout_ms: u64,
    /// Maximum time to wait for transaction catch-up in seconds
    pub sync_timeout_secs: u64,
    /// Maximum time to wait for a member to reach ONLINE in seconds
    pub member_online_timeout_secs: u64,
    /// Interval between polls of a bounded wait in milliseconds
    pub poll_interval_ms: u64,
}

/// Distributed lock configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    /// Lease length in seconds; a holder that stops renewing loses the lock after this
    pub lease_secs: u64,
    /// How long an operation retries a contended lock, in milliseconds (0 = fail immediately)
    pub acquire_timeout_ms: u64,
    /// Interval between acquisition attempts in milliseconds
    pub retry_interval_ms: u64,
}

/// Metadata backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetadataBackendKind {
    /// In-process store, lost on restart
    Memory,
    /// JSON document on local disk
    File,
}

/// Metadata store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetadataConfig {
    /// Backend used to persist the topology document
    pub backend: MetadataBackendKind,
    /// Document path for the file backend
    pub path: Option<String>,
    /// Maximum attempts for a single metadata write
    pub max_write_attempts: u32,
    /// Base backoff between write attempts in milliseconds
    pub retry_backoff_ms: u64,
}

/// TLS requirement for group communication
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SslMode {
    Disabled,
    Required,
    /// Require TLS when the seed supports it
    Auto,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disabled => "DISABLED",
            SslMode::Required => "REQUIRED",
            SslMode::Auto => "AUTO",
        }
    }
}

/// Option defaults applied to newly created groups
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GroupDefaults {
    pub ssl_mode: SslMode,
    /// Maximum transaction size in bytes (0 = unlimited)
    pub transaction_size_limit: u64,
    /// Seconds a suspected member is kept before expulsion
    pub expel_timeout: u32,
    pub exit_state_action: String,
    pub consistency: String,
    pub auto_rejoin_tries: u32,
    /// Host pattern for replication accounts
    pub replication_allowed_host: String,
    pub recovery_method: RecoveryMethod,
    pub disable_clone: bool,
    /// Priority assigned to new members when not given (lower is preferred)
    pub member_priority: u32,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Save configuration to a YAML file
    pub fn save_to_yaml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.timeouts.probe_timeout_ms == 0 {
            errors.push("Probe timeout must be greater than 0".to_string());
        }
        if self.timeouts.poll_interval_ms == 0 {
            errors.push("Poll interval must be greater than 0".to_string());
        }
        if self.timeouts.sync_timeout_secs == 0 {
            errors.push("Sync timeout must be greater than 0".to_string());
        }
        if self.timeouts.member_online_timeout_secs == 0 {
            errors.push("Member online timeout must be greater than 0".to_string());
        }

        if self.locks.lease_secs < 3 {
            errors.push("Lock lease must be at least 3 seconds".to_string());
        }
        if self.locks.retry_interval_ms == 0 {
            errors.push("Lock retry interval must be greater than 0".to_string());
        }

        if self.metadata.max_write_attempts == 0 {
            errors.push("Metadata write attempts must be greater than 0".to_string());
        }
        if self.metadata.backend == MetadataBackendKind::File && self.metadata.path.is_none() {
            errors.push("File metadata backend requires a path".to_string());
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            errors.push("Metrics port cannot be 0".to_string());
        }

        if self.defaults.expel_timeout > 3600 {
            errors.push("Expel timeout must be between 0 and 3600 seconds".to_string());
        }
        if self.defaults.auto_rejoin_tries > 2016 {
            errors.push("Auto rejoin tries must be between 0 and 2016".to_string());
        }
        if !EXIT_STATE_ACTIONS.contains(&self.defaults.exit_state_action.as_str()) {
            errors.push(format!("Invalid exit state action '{}'", self.defaults.exit_state_action));
        }
        if !CONSISTENCY_LEVELS.contains(&self.defaults.consistency.as_str()) {
            errors.push(format!("Invalid consistency level '{}'", self.defaults.consistency));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.probe_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.sync_timeout_secs)
    }

    pub fn member_online_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.member_online_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.timeouts.poll_interval_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.locks.lease_secs)
    }

    pub fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.locks.acquire_timeout_ms)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.locks.retry_interval_ms)
    }

    pub fn metadata_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.metadata.retry_backoff_ms)
    }
}

/// Accepted values of the `exitStateAction` option
pub const EXIT_STATE_ACTIONS: &[&str] = &["ABORT_SERVER", "READ_ONLY", "OFFLINE_MODE"];

/// Accepted values of the `consistency` option
pub const CONSISTENCY_LEVELS: &[&str] = &[
    "EVENTUAL",
    "BEFORE_ON_PRIMARY_FAILOVER",
    "BEFORE",
    "AFTER",
    "BEFORE_AND_AFTER",
];

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Simple,
            filter: None,
            file_path: None,
            rotation: LogRotation::Daily,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "127.0.0.1".to_string(),
            port: 9464,
            labels: HashMap::new(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 2_000,
            sync_timeout_secs: 60,
            member_online_timeout_secs: 120,
            poll_interval_ms: 250,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_secs: 30,
            acquire_timeout_ms: 0,
            retry_interval_ms: 100,
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            backend: MetadataBackendKind::Memory,
            path: None,
            max_write_attempts: 5,
            retry_backoff_ms: 50,
        }
    }
}

impl Default for GroupDefaults {
    fn default() -> Self {
        Self {
            ssl_mode: SslMode::Auto,
            transaction_size_limit: 150_000_000,
            expel_timeout: 5,
            exit_state_action: "READ_ONLY".to_string(),
            consistency: "BEFORE_ON_PRIMARY_FAILOVER".to_string(),
            auto_rejoin_tries: 3,
            replication_allowed_host: "%".to_string(),
            recovery_method: RecoveryMethod::Auto,
            disable_clone: false,
            member_priority: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.probe_timeout(), Duration::from_secs(2));
        assert_eq!(config.lock_lease(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
[timeouts]
sync_timeout_secs = 5

[locks]
lease_secs = 10
"#,
        )
        .unwrap();
        assert_eq!(config.sync_timeout(), Duration::from_secs(5));
        assert_eq!(config.lock_lease(), Duration::from_secs(10));
        assert_eq!(config.timeouts.poll_interval_ms, 250);
        assert_eq!(config.defaults.exit_state_action, "READ_ONLY");
    }

    #[test]
    fn test_validation_collects_errors() {
        let mut config = EngineConfig::default();
        config.timeouts.poll_interval_ms = 0;
        config.metadata.backend = MetadataBackendKind::File;
        config.defaults.consistency = "SOMETIMES".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("requires a path")));
    }

    #[test]
    fn test_toml_round_trip_through_file() {
        let mut config = EngineConfig::default();
        config.metadata.backend = MetadataBackendKind::File;
        config.metadata.path = Some("/var/lib/topology/metadata.json".to_string());

        let file = NamedTempFile::new().unwrap();
        config.save_to_file(file.path()).unwrap();
        let loaded = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_yaml_file() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            "logging:\n  level: Debug\n  format: Json\ndefaults:\n  disable_clone: true\n",
        )
        .unwrap();
        let config = EngineConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.defaults.disable_clone);
    }
}
