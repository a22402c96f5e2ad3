//! Metrics collection for the topology engine
//!
//! Counters are kept locally in atomics, so tests and callers can read a
//! [`MetricsSummary`], and mirrored into the `metrics` facade for the
//! Prometheus exporter.

use crate::config::MetricsConfig;
use crate::error::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Metrics collector for the engine
#[derive(Debug)]
pub struct MetricsCollector {
    config: MetricsConfig,
    operations: Arc<OperationMetrics>,
    probes: Arc<ProbeMetrics>,
    metadata: Arc<MetadataMetrics>,
    startup_time: Instant,
}

/// Administrative operation metrics
#[derive(Debug, Default)]
pub struct OperationMetrics {
    pub operations: AtomicU64,
    pub failures: AtomicU64,
    pub lock_contentions: AtomicU64,
    pub forced_overrides: AtomicU64,
    pub switchovers: AtomicU64,
    pub failovers: AtomicU64,
    pub last_duration_ms: AtomicU64,
}

/// Health probe metrics
#[derive(Debug, Default)]
pub struct ProbeMetrics {
    pub probes: AtomicU64,
    pub unreachable: AtomicU64,
}

/// Metadata store metrics
#[derive(Debug, Default)]
pub struct MetadataMetrics {
    pub writes: AtomicU64,
    pub conflicts: AtomicU64,
    pub retries: AtomicU64,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        let collector = Self {
            config,
            operations: Arc::new(OperationMetrics::default()),
            probes: Arc::new(ProbeMetrics::default()),
            metadata: Arc::new(MetadataMetrics::default()),
            startup_time: Instant::now(),
        };
        for (key, value) in &collector.config.labels {
            metrics::gauge!("topology_labels", 1.0, "key" => key.clone(), "value" => value.clone());
        }
        collector
    }

    /// Record the outcome of an administrative operation
    pub fn record_operation(&self, operation: &str, duration: Duration, error: Option<ErrorKind>) {
        let duration_ms = duration.as_millis() as u64;
        self.operations.operations.fetch_add(1, Ordering::Relaxed);
        self.operations.last_duration_ms.store(duration_ms, Ordering::Relaxed);

        metrics::counter!("topology_operations_total", 1, "operation" => operation.to_string());
        metrics::histogram!("topology_operation_duration_ms", duration_ms as f64);

        if let Some(kind) = error {
            self.operations.failures.fetch_add(1, Ordering::Relaxed);
            if kind == ErrorKind::LockContention {
                self.operations.lock_contentions.fetch_add(1, Ordering::Relaxed);
            }
            metrics::counter!(
                "topology_operation_errors_total",
                1,
                "operation" => operation.to_string(),
                "kind" => kind.as_str()
            );
        }
    }

    pub fn record_forced_override(&self, operation: &str) {
        self.operations.forced_overrides.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("topology_forced_overrides_total", 1, "operation" => operation.to_string());
    }

    pub fn record_switchover(&self, scope: &str) {
        self.operations.switchovers.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("topology_switchovers_total", 1, "scope" => scope.to_string());
    }

    pub fn record_failover(&self, scope: &str) {
        self.operations.failovers.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("topology_failovers_total", 1, "scope" => scope.to_string());
    }

    /// Record a health probe
    pub fn record_probe(&self, reachable: bool, latency: Duration) {
        self.probes.probes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("topology_probes_total", 1);
        metrics::histogram!("topology_probe_latency_ms", latency.as_millis() as f64);
        if !reachable {
            self.probes.unreachable.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("topology_probes_unreachable_total", 1);
        }
    }

    /// Record a committed metadata write and how many attempts it took
    pub fn record_metadata_write(&self, attempts: u32) {
        self.metadata.writes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("topology_metadata_writes_total", 1);
        if attempts > 1 {
            let retries = u64::from(attempts - 1);
            self.metadata.retries.fetch_add(retries, Ordering::Relaxed);
            metrics::counter!("topology_metadata_retries_total", retries);
        }
    }

    pub fn record_metadata_conflict(&self) {
        self.metadata.conflicts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("topology_metadata_conflicts_total", 1);
    }

    /// Publish the size of a group after an observation
    pub fn update_group_membership(&self, group: &str, online: usize, registered: usize) {
        metrics::gauge!("topology_group_online_members", online as f64, "group" => group.to_string());
        metrics::gauge!("topology_group_registered_members", registered as f64, "group" => group.to_string());
    }

    pub fn get_metrics_summary(&self) -> MetricsSummary {
        MetricsSummary {
            uptime_seconds: self.startup_time.elapsed().as_secs(),
            operations: self.operations.operations.load(Ordering::Relaxed),
            failures: self.operations.failures.load(Ordering::Relaxed),
            lock_contentions: self.operations.lock_contentions.load(Ordering::Relaxed),
            forced_overrides: self.operations.forced_overrides.load(Ordering::Relaxed),
            switchovers: self.operations.switchovers.load(Ordering::Relaxed),
            failovers: self.operations.failovers.load(Ordering::Relaxed),
            probes: self.probes.probes.load(Ordering::Relaxed),
            unreachable_probes: self.probes.unreachable.load(Ordering::Relaxed),
            metadata_writes: self.metadata.writes.load(Ordering::Relaxed),
            metadata_conflicts: self.metadata.conflicts.load(Ordering::Relaxed),
            metadata_retries: self.metadata.retries.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSummary {
    pub uptime_seconds: u64,
    pub operations: u64,
    pub failures: u64,
    pub lock_contentions: u64,
    pub forced_overrides: u64,
    pub switchovers: u64,
    pub failovers: u64,
    pub probes: u64,
    pub unreachable_probes: u64,
    pub metadata_writes: u64,
    pub metadata_conflicts: u64,
    pub metadata_retries: u64,
}

/// Install the Prometheus exporter as the global recorder.
///
/// Returns `Ok(false)` when metrics are disabled. Must run inside a tokio
/// runtime, the HTTP listener is spawned on it.
pub fn install_prometheus_exporter(config: &MetricsConfig) -> Result<bool, Box<dyn std::error::Error>> {
    if !config.enabled {
        return Ok(false);
    }

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port).parse()?;
    let mut builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
    for (key, value) in &config.labels {
        builder = builder.add_global_label(key.clone(), value.clone());
    }
    builder.install()?;

    tracing::info!("Prometheus exporter listening on {}", addr);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_recording() {
        let collector = MetricsCollector::new(MetricsConfig::default());

        collector.record_operation("add_instance", Duration::from_millis(12), None);
        collector.record_operation("add_instance", Duration::from_millis(3), Some(ErrorKind::LockContention));
        collector.record_operation("remove_instance", Duration::from_millis(3), Some(ErrorKind::Quorum));

        let summary = collector.get_metrics_summary();
        assert_eq!(summary.operations, 3);
        assert_eq!(summary.failures, 2);
        assert_eq!(summary.lock_contentions, 1);
    }

    #[test]
    fn test_metadata_retries_counted() {
        let collector = MetricsCollector::new(MetricsConfig::default());
        collector.record_metadata_write(1);
        collector.record_metadata_write(3);
        collector.record_metadata_conflict();

        let summary = collector.get_metrics_summary();
        assert_eq!(summary.metadata_writes, 2);
        assert_eq!(summary.metadata_retries, 2);
        assert_eq!(summary.metadata_conflicts, 1);
    }

    #[test]
    fn test_probe_recording() {
        let collector = MetricsCollector::new(MetricsConfig::default());
        collector.record_probe(true, Duration::from_millis(1));
        collector.record_probe(false, Duration::from_millis(200));

        let summary = collector.get_metrics_summary();
        assert_eq!(summary.probes, 2);
        assert_eq!(summary.unreachable_probes, 1);
    }

    #[test]
    fn test_disabled_exporter_is_noop() {
        let config = MetricsConfig {
            enabled: false,
            ..MetricsConfig::default()
        };
        assert!(!install_prometheus_exporter(&config).unwrap());
    }
}
