//! Durable topology metadata
//!
//! [`MetadataStore`] wraps a [`MetadataBackend`] with the read-modify-write
//! cycle every operation commits through:
//!
//! 1. load the document and check its schema version;
//! 2. verify the version of the record the caller depends on;
//! 3. apply the caller's mutation and bump the versions of changed records;
//! 4. compare-and-swap the document, retrying on races and transient loss.
//!
//! Each write carries a fresh `write_id` and the document keeps the ids of
//! its latest writes. When the backend drops the acknowledgement of a write
//! that did land, the next attempt finds its own id on the document, even if
//! other writers committed in between, and reports success without applying
//! the mutation a second time.

pub mod backend;
pub mod schema;

pub use backend::{FileBackend, MemoryBackend, MetadataBackend};
pub use schema::{
    FederationRecord, FederationRole, GroupKind, GroupOptions, GroupRecord, InstanceRecord, InstanceRole, LockHolder,
    LockRow, MetadataDocument, ReplicationSources, RouterRecord, RouterScope, SchemaVersion,
};

use crate::config::MetadataConfig;
use crate::error::{MetadataError, Result, TopologyError};
use crate::log::log_metadata_write;
use crate::metrics::MetricsCollector;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Part of the document a write depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyScope {
    Group(String),
    Federation(String),
    Routers,
    Locks,
}

impl TopologyScope {
    /// Record version of this scope, `None` if it has no versioned record
    fn version_in(&self, document: &MetadataDocument) -> Option<u64> {
        match self {
            TopologyScope::Group(name) => document.groups.get(name).map(|g| g.version),
            TopologyScope::Federation(domain) => document.federations.get(domain).map(|f| f.version),
            TopologyScope::Routers | TopologyScope::Locks => None,
        }
    }
}

impl fmt::Display for TopologyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyScope::Group(name) => write!(f, "cluster '{}'", name),
            TopologyScope::Federation(domain) => write!(f, "clusterset '{}'", domain),
            TopologyScope::Routers => f.write_str("routers"),
            TopologyScope::Locks => f.write_str("locks"),
        }
    }
}

fn bump_versions(original: &MetadataDocument, document: &mut MetadataDocument) {
    for (name, group) in document.groups.iter_mut() {
        let before = original.groups.get(name);
        if before != Some(&*group) {
            group.version = before.map(|g| g.version).unwrap_or(0) + 1;
        }
    }
    for (domain, federation) in document.federations.iter_mut() {
        let before = original.federations.get(domain);
        if before != Some(&*federation) {
            federation.version = before.map(|f| f.version).unwrap_or(0) + 1;
        }
    }
}

pub struct MetadataStore {
    backend: Arc<dyn MetadataBackend>,
    config: MetadataConfig,
    metrics: Arc<MetricsCollector>,
}

impl MetadataStore {
    pub fn new(backend: Arc<dyn MetadataBackend>, config: MetadataConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            backend,
            config,
            metrics,
        }
    }

    /// Linear backoff with up to 50% jitter so competing writers spread out
    fn backoff(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let base = self.config.retry_backoff_ms.saturating_mul(u64::from(attempt));
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(base + jitter)
    }

    fn check_schema(document: &MetadataDocument) -> std::result::Result<(), MetadataError> {
        let supported = SchemaVersion::CURRENT;
        if !document.schema_version.is_compatible_with(&supported) {
            return Err(MetadataError::IncompatibleSchema {
                found: document.schema_version.to_string(),
                supported: supported.to_string(),
            });
        }
        Ok(())
    }

    /// Load the raw document, retrying transient unavailability
    async fn load(&self) -> Result<Option<MetadataDocument>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.backend.load().await {
                Ok(document) => {
                    if let Some(doc) = &document {
                        Self::check_schema(doc)?;
                    }
                    return Ok(document);
                }
                Err(e) if e.is_transient() && attempt < self.config.max_write_attempts => {
                    tracing::debug!("Metadata load attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Install an empty document if none exists and verify the schema version
    pub async fn ensure_schema(&self) -> Result<MetadataDocument> {
        if let Some(document) = self.load().await? {
            return Ok(document);
        }

        let document = MetadataDocument::new();
        match self.backend.store(None, &document).await {
            Ok(version) => {
                tracing::info!("Installed metadata schema {}", SchemaVersion::CURRENT);
                Ok(MetadataDocument { version, ..document })
            }
            // Someone else installed it first
            Err(MetadataError::VersionMismatch { .. }) => self.read_topology().await,
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read_topology(&self) -> Result<MetadataDocument> {
        self.load().await?.ok_or(TopologyError::Metadata(MetadataError::NotInstalled))
    }

    pub async fn read_group(&self, name: &str) -> Result<GroupRecord> {
        self.read_topology()
            .await?
            .groups
            .remove(name)
            .ok_or_else(|| TopologyError::NotFound(format!("The cluster with the name '{}' does not exist.", name)))
    }

    pub async fn read_federation(&self, domain: &str) -> Result<FederationRecord> {
        self.read_topology()
            .await?
            .federations
            .remove(domain)
            .ok_or_else(|| TopologyError::NotFound(format!("The clusterset '{}' does not exist.", domain)))
    }

    /// Commit `mutation` to the document.
    ///
    /// With `expected` set, the write fails with [`MetadataError::Conflict`]
    /// when the scope's record version no longer matches. Races on the
    /// document itself re-run the mutation on the fresh copy.
    pub async fn write_topology<T, F>(&self, scope: TopologyScope, expected: Option<u64>, mut mutation: F) -> Result<T>
    where
        F: FnMut(&mut MetadataDocument) -> Result<T> + Send,
        T: Send,
    {
        let write_id = Uuid::new_v4().to_string();
        let scope_name = scope.to_string();
        let max_attempts = self.config.max_write_attempts.max(1);
        let mut unacknowledged: Option<T> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let original = match self.backend.load().await {
                Ok(Some(doc)) => doc,
                Ok(None) => return Err(MetadataError::NotInstalled.into()),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    tokio::time::sleep(self.backoff(attempt)).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            Self::check_schema(&original)?;

            if original.contains_write(&write_id) {
                if let Some(result) = unacknowledged.take() {
                    tracing::info!("Metadata write to {} landed despite a lost acknowledgement", scope_name);
                    self.metrics.record_metadata_write(attempt);
                    log_metadata_write(&scope_name, original.version, attempt, true);
                    return Ok(result);
                }
            }
            unacknowledged = None;

            if let Some(expected) = expected {
                match scope.version_in(&original) {
                    Some(actual) if actual == expected => {}
                    Some(actual) => {
                        self.metrics.record_metadata_conflict();
                        return Err(MetadataError::Conflict {
                            scope: scope_name,
                            expected,
                            actual,
                        }
                        .into());
                    }
                    None => {
                        self.metrics.record_metadata_conflict();
                        return Err(TopologyError::NotFound(format!("{} no longer exists", scope_name)));
                    }
                }
            }

            let mut document = original.clone();
            let result = mutation(&mut document)?;
            bump_versions(&original, &mut document);
            document.record_write(&write_id);

            match self.backend.store(Some(original.version), &document).await {
                Ok(version) => {
                    self.metrics.record_metadata_write(attempt);
                    log_metadata_write(&scope_name, version, attempt, true);
                    return Ok(result);
                }
                Err(MetadataError::VersionMismatch { .. }) if attempt < max_attempts => {
                    tracing::debug!("Metadata document raced on attempt {}, re-applying", attempt);
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    tracing::warn!("Metadata write to {} not acknowledged: {}", scope_name, e);
                    unacknowledged = Some(result);
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Err(MetadataError::VersionMismatch { .. }) => {
                    log_metadata_write(&scope_name, original.version, attempt, false);
                    return Err(MetadataError::Contended { attempts: attempt }.into());
                }
                Err(e) => {
                    log_metadata_write(&scope_name, original.version, attempt, false);
                    return Err(e.into());
                }
            }
        }
    }
}
