//! Span constructors for the topology engine
//!
//! Administrative operations are wrapped in these spans with
//! `tracing::Instrument` so every log line emitted while an operation runs
//! carries the operation name and its target.

use tracing::{debug_span, info_span, Span};

const SERVICE_NAME: &str = "topology-engine";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create a span for an operation on a single group
pub fn topology_operation_span(operation: &str, cluster: &str) -> Span {
    info_span!(
        "topology_operation",
        operation = operation,
        cluster = cluster,
        service.name = SERVICE_NAME,
        service.version = SERVICE_VERSION
    )
}

/// Create a span for an operation on a federation
pub fn federation_operation_span(operation: &str, domain: &str) -> Span {
    info_span!(
        "federation_operation",
        operation = operation,
        domain = domain,
        service.name = SERVICE_NAME,
        service.version = SERVICE_VERSION
    )
}

/// Create a span for a health probe
pub fn probe_span(address: &str) -> Span {
    debug_span!("probe", address = address)
}

/// Create a span for lock acquisition
pub fn lock_span(operation: &str, scopes: &str) -> Span {
    debug_span!("lock_acquisition", operation = operation, scopes = scopes)
}
