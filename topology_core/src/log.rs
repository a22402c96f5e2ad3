//! Structured logging for the topology engine
//!
//! This module provides structured logging using the `tracing` crate with
//! support for console output, JSON output and rotated log files.

use crate::config::{EngineConfig, LogFormat, LogLevel, LogRotation, LoggingConfig};
use std::path::Path;
use std::sync::{Mutex, Once};
use std::time::Duration;
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::{format::FmtSpan, time::UtcTime};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

// Keeps the background file writer alive for the lifetime of the process.
static FILE_GUARD: Mutex<Option<WorkerGuard>> = Mutex::new(None);

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut outcome = Ok(());
    INIT.call_once(|| {
        outcome = init_logging_inner(config).map_err(|e| e.to_string());
    });
    outcome.map_err(|e| e.into())
}

fn init_logging_inner(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = match &config.filter {
        Some(directive) => EnvFilter::try_new(directive)?,
        None => EnvFilter::new(level_directive(config.level)),
    };

    let builder = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_timer(UtcTime::rfc_3339())
        .with_env_filter(filter);

    match &config.file_path {
        Some(path) => {
            let writer = file_writer(path, config.rotation)?;
            match config.format {
                LogFormat::Json => builder.json().with_writer(writer).try_init()?,
                _ => builder.with_ansi(false).with_writer(writer).try_init()?,
            }
        }
        None => match config.format {
            LogFormat::Json => builder.json().try_init()?,
            LogFormat::Pretty => builder.pretty().try_init()?,
            LogFormat::Simple => builder.try_init()?,
        },
    }

    tracing::info!("Logging system initialized with level: {:?}", config.level);
    Ok(())
}

fn file_writer(path: &str, rotation: LogRotation) -> Result<NonBlocking, Box<dyn std::error::Error + Send + Sync>> {
    let path = Path::new(path);
    let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| format!("log file path '{}' has no file name", path.display()))?;

    let appender = match rotation {
        LogRotation::Never => tracing_appender::rolling::never(directory, file_name),
        LogRotation::Hourly => tracing_appender::rolling::hourly(directory, file_name),
        LogRotation::Daily => tracing_appender::rolling::daily(directory, file_name),
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);
    if let Ok(mut slot) = FILE_GUARD.lock() {
        *slot = Some(guard);
    }
    Ok(writer)
}

fn level_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

/// Convert our log level to tracing level
pub fn convert_log_level(level: LogLevel) -> Level {
    match level {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    }
}

/// Log a topology operation with structured fields
pub fn log_topology_operation(
    operation: &str,
    target: &str,
    success: bool,
    duration: Duration,
    additional_fields: Option<Vec<(&str, String)>>,
) {
    let span = tracing::info_span!(
        "topology_operation",
        operation = operation,
        target = target,
        success = success,
        duration_ms = duration.as_millis() as u64,
        details = tracing::field::Empty,
    );

    if let Some(fields) = additional_fields {
        let details = fields
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join(" ");
        span.record("details", details.as_str());
    }

    let _enter = span.enter();

    if success {
        tracing::info!("Topology operation completed successfully");
    } else {
        tracing::error!("Topology operation failed");
    }
}

/// Log an operator override. Every use of `force` ends up here.
pub fn log_forced_override(operation: &str, target: &str, bypassed_check: &str) {
    tracing::warn!(
        operation = operation,
        target = target,
        bypassed_check = bypassed_check,
        "Forced override in {} on {}: {}",
        operation,
        target,
        bypassed_check
    );
}

/// Log a metadata write
pub fn log_metadata_write(scope: &str, document_version: u64, attempts: u32, success: bool) {
    let span = tracing::debug_span!(
        "metadata_write",
        scope = scope,
        document_version = document_version,
        attempts = attempts,
    );
    let _enter = span.enter();

    if success {
        tracing::debug!("Metadata committed");
    } else {
        tracing::warn!("Metadata write failed");
    }
}

/// Log engine startup
pub fn log_startup(config: &EngineConfig) {
    tracing::info!("Starting topology engine");
    tracing::info!(
        "Metadata backend: {:?} ({})",
        config.metadata.backend,
        config.metadata.path.as_deref().unwrap_or("in-memory")
    );
    tracing::info!(
        "Probe timeout {}ms, sync timeout {}s, lock lease {}s",
        config.timeouts.probe_timeout_ms,
        config.timeouts.sync_timeout_secs,
        config.locks.lease_secs
    );

    if config.metrics.enabled {
        tracing::info!("Metrics enabled: {}:{}", config.metrics.bind_address, config.metrics.port);
    }
}

/// Log engine shutdown
pub fn log_shutdown(reason: &str) {
    tracing::info!("Shutting down topology engine: {}", reason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(convert_log_level(LogLevel::Error), Level::ERROR);
        assert_eq!(convert_log_level(LogLevel::Warn), Level::WARN);
        assert_eq!(convert_log_level(LogLevel::Info), Level::INFO);
        assert_eq!(convert_log_level(LogLevel::Debug), Level::DEBUG);
        assert_eq!(convert_log_level(LogLevel::Trace), Level::TRACE);
    }

    #[test]
    fn test_logging_initialization() {
        let config = LoggingConfig::default();
        assert!(init_logging(&config).is_ok());
        // Second call is a no-op
        assert!(init_logging(&config).is_ok());
    }
}
