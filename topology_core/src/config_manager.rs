//! Layered configuration: file, then `TOPOLOGY_*` environment overrides,
//! checked by pluggable validators and published to subscribers.

use crate::config::{EngineConfig, LogLevel, MetadataBackendKind};
use crate::gtid::RecoveryMethod;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Where the current configuration came from
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    File(PathBuf),
    Environment,
    Default,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Configuration manager with reload support
pub struct ConfigManager {
    config: Arc<RwLock<EngineConfig>>,
    source: Arc<RwLock<ConfigSource>>,
    config_file_path: Option<PathBuf>,
    sender: watch::Sender<EngineConfig>,
    receiver: watch::Receiver<EngineConfig>,
    validators: Vec<Box<dyn ConfigValidator + Send + Sync>>,
    loaded_at: Arc<RwLock<Option<SystemTime>>>,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_file(path: &Path) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let content = fs::read_to_string(path)?;
    let yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if yaml {
        Ok(serde_yaml::from_str(&content)?)
    } else {
        Ok(toml::from_str(&content)?)
    }
}

fn parse_log_level(value: &str) -> Result<LogLevel, String> {
    match value.to_ascii_lowercase().as_str() {
        "error" => Ok(LogLevel::Error),
        "warn" | "warning" => Ok(LogLevel::Warn),
        "info" => Ok(LogLevel::Info),
        "debug" => Ok(LogLevel::Debug),
        "trace" => Ok(LogLevel::Trace),
        other => Err(format!("invalid log level '{}'", other)),
    }
}

fn parse_backend(value: &str) -> Result<MetadataBackendKind, String> {
    match value.to_ascii_lowercase().as_str() {
        "memory" => Ok(MetadataBackendKind::Memory),
        "file" => Ok(MetadataBackendKind::File),
        other => Err(format!("invalid metadata backend '{}'", other)),
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| format!("{}: cannot parse '{}': {}", key, value, e))
}

/// Apply `TOPOLOGY_*` overrides found through `lookup`.
///
/// Returns the names of the variables that were applied.
pub fn apply_env_overrides<F>(config: &mut EngineConfig, lookup: F) -> Result<Vec<String>, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut applied = Vec::new();
    let mut take = |key: &str| {
        let value = lookup(key);
        if value.is_some() {
            applied.push(key.to_string());
        }
        value
    };

    if let Some(v) = take("TOPOLOGY_LOG_LEVEL") {
        config.logging.level = parse_log_level(&v)?;
    }
    if let Some(v) = take("TOPOLOGY_LOG_FILTER") {
        config.logging.filter = Some(v);
    }
    if let Some(v) = take("TOPOLOGY_LOG_FILE") {
        config.logging.file_path = Some(v);
    }
    if let Some(v) = take("TOPOLOGY_METRICS_ENABLED") {
        config.metrics.enabled = parse("TOPOLOGY_METRICS_ENABLED", &v)?;
    }
    if let Some(v) = take("TOPOLOGY_METRICS_PORT") {
        config.metrics.port = parse("TOPOLOGY_METRICS_PORT", &v)?;
    }
    if let Some(v) = take("TOPOLOGY_PROBE_TIMEOUT_MS") {
        config.timeouts.probe_timeout_ms = parse("TOPOLOGY_PROBE_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = take("TOPOLOGY_SYNC_TIMEOUT_SECS") {
        config.timeouts.sync_timeout_secs = parse("TOPOLOGY_SYNC_TIMEOUT_SECS", &v)?;
    }
    if let Some(v) = take("TOPOLOGY_MEMBER_ONLINE_TIMEOUT_SECS") {
        config.timeouts.member_online_timeout_secs = parse("TOPOLOGY_MEMBER_ONLINE_TIMEOUT_SECS", &v)?;
    }
    if let Some(v) = take("TOPOLOGY_LOCK_LEASE_SECS") {
        config.locks.lease_secs = parse("TOPOLOGY_LOCK_LEASE_SECS", &v)?;
    }
    if let Some(v) = take("TOPOLOGY_LOCK_ACQUIRE_TIMEOUT_MS") {
        config.locks.acquire_timeout_ms = parse("TOPOLOGY_LOCK_ACQUIRE_TIMEOUT_MS", &v)?;
    }
    if let Some(v) = take("TOPOLOGY_METADATA_BACKEND") {
        config.metadata.backend = parse_backend(&v)?;
    }
    if let Some(v) = take("TOPOLOGY_METADATA_PATH") {
        config.metadata.path = Some(v);
    }
    if let Some(v) = take("TOPOLOGY_DEFAULT_RECOVERY_METHOD") {
        config.defaults.recovery_method = v.parse::<RecoveryMethod>().map_err(|e| e.to_string())?;
    }
    Ok(applied)
}

impl ConfigManager {
    pub fn new() -> Self {
        let default_config = EngineConfig::default();
        let (sender, receiver) = watch::channel(default_config.clone());

        Self {
            config: Arc::new(RwLock::new(default_config)),
            source: Arc::new(RwLock::new(ConfigSource::Default)),
            config_file_path: None,
            sender,
            receiver,
            validators: Vec::new(),
            loaded_at: Arc::new(RwLock::new(None)),
        }
    }

    /// Load configuration from a TOML or YAML file (by extension)
    pub async fn load_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let path = path.as_ref().to_path_buf();
        self.config_file_path = Some(path.clone());

        if !path.exists() {
            warn!("Configuration file not found: {}", path.display());
            return Ok(());
        }
        let config = parse_file(&path)?;
        self.publish(config, ConfigSource::File(path.clone())).await?;
        info!("Configuration loaded from file: {}", path.display());
        Ok(())
    }

    /// Apply `TOPOLOGY_*` environment variables on top of the current configuration
    pub async fn load_from_env(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut config = self.config.read().await.clone();
        let applied = apply_env_overrides(&mut config, |key| env::var(key).ok())?;
        if applied.is_empty() {
            return Ok(());
        }
        let source = match self.config_file_path.clone() {
            Some(path) => ConfigSource::File(path),
            None => ConfigSource::Environment,
        };
        self.publish(config, source).await?;
        info!("Configuration overridden from environment: {}", applied.join(", "));
        Ok(())
    }

    pub async fn get_config(&self) -> EngineConfig {
        self.config.read().await.clone()
    }

    /// Subscribe to configuration changes
    pub fn watch_config(&self) -> watch::Receiver<EngineConfig> {
        self.receiver.clone()
    }

    /// Replace the configuration, persisting it to the loaded file if any
    pub async fn update_config(&self, new_config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
        let source = self.source.read().await.clone();
        self.publish(new_config.clone(), source).await?;
        if let Some(path) = &self.config_file_path {
            match path.extension().and_then(|e| e.to_str()) {
                Some("yaml") | Some("yml") => new_config.save_to_yaml_file(path)?,
                _ => new_config.save_to_file(path)?,
            }
        }
        info!("Configuration updated");
        Ok(())
    }

    /// Re-read the configuration file if it changed since the last load
    pub async fn reload_if_changed(&self) -> Result<bool, Box<dyn std::error::Error>> {
        let Some(path) = &self.config_file_path else {
            return Ok(false);
        };
        let modified = fs::metadata(path)?.modified()?;
        let stale = match *self.loaded_at.read().await {
            Some(loaded) => modified > loaded,
            None => true,
        };
        if !stale {
            return Ok(false);
        }
        let config = parse_file(path)?;
        self.publish(config, ConfigSource::File(path.clone())).await?;
        info!("Configuration reloaded from file: {}", path.display());
        Ok(true)
    }

    /// Poll the configuration file until `cancel` fires
    pub fn spawn_reloader(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.reload_if_changed().await {
                            error!("Failed to reload configuration: {}", e);
                        }
                    }
                }
            }
        })
    }

    pub fn add_validator(&mut self, validator: Box<dyn ConfigValidator + Send + Sync>) {
        self.validators.push(validator);
    }

    /// Built-in checks plus every registered validator
    pub async fn validate_config(&self, config: &EngineConfig) -> ConfigValidationResult {
        let mut errors = config.validate().err().unwrap_or_default();
        let mut warnings = Vec::new();

        for validator in &self.validators {
            let result = validator.validate(config).await;
            errors.extend(result.errors);
            warnings.extend(result.warnings);
        }

        ConfigValidationResult {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    pub async fn config_source(&self) -> ConfigSource {
        self.source.read().await.clone()
    }

    async fn publish(&self, config: EngineConfig, source: ConfigSource) -> Result<(), Box<dyn std::error::Error>> {
        let validation = self.validate_config(&config).await;
        for warning in &validation.warnings {
            warn!("Configuration warning: {}", warning);
        }
        if !validation.is_valid {
            return Err(format!("Configuration validation failed: {}", validation.errors.join("; ")).into());
        }

        *self.config.write().await = config.clone();
        *self.source.write().await = source;
        *self.loaded_at.write().await = Some(SystemTime::now());
        self.sender.send_replace(config);
        Ok(())
    }
}

/// Extra checks layered over [`EngineConfig::validate`]
#[async_trait::async_trait]
pub trait ConfigValidator {
    async fn validate(&self, config: &EngineConfig) -> ConfigValidationResult;
}

/// Cross-field sanity checks
pub struct DefaultConfigValidator;

#[async_trait::async_trait]
impl ConfigValidator for DefaultConfigValidator {
    async fn validate(&self, config: &EngineConfig) -> ConfigValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if config.timeouts.poll_interval_ms >= config.timeouts.sync_timeout_secs.saturating_mul(1000) {
            errors.push("Poll interval must be shorter than the sync timeout".to_string());
        }
        if config.locks.retry_interval_ms >= config.locks.lease_secs.saturating_mul(1000) {
            errors.push("Lock retry interval must be shorter than the lock lease".to_string());
        }
        if config.timeouts.probe_timeout_ms > 30_000 {
            warnings.push("Probe timeouts above 30s make status calls slow".to_string());
        }

        ConfigValidationResult {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Warnings for settings that are fine in tests but risky in production
pub struct ProductionConfigValidator;

#[async_trait::async_trait]
impl ConfigValidator for ProductionConfigValidator {
    async fn validate(&self, config: &EngineConfig) -> ConfigValidationResult {
        let mut warnings = Vec::new();

        if config.metadata.backend == MetadataBackendKind::Memory {
            warnings.push("In-memory metadata is lost when the process exits".to_string());
        }
        if config.defaults.ssl_mode == crate::config::SslMode::Disabled {
            warnings.push("Group communication without TLS".to_string());
        }
        if config.locks.acquire_timeout_ms == 0 {
            warnings.push("Contended locks fail immediately; consider a short acquire timeout".to_string());
        }

        ConfigValidationResult {
            is_valid: true,
            errors: Vec::new(),
            warnings,
        }
    }
}
