//! Topology state machine
//!
//! [`TopologyEngine`] owns the collaborators shared by every operation and
//! hands out [`Cluster`] handles. Each mutating operation follows the same
//! sequence: take locks, observe the live topology, validate, change the
//! replication configuration of the affected instances and finally commit
//! one metadata write.

pub mod add;
pub mod create;
pub mod dissolve;
pub mod options;
pub mod primary;
pub mod recovery;
pub mod rejoin;
pub mod remove;
pub mod status;

pub use add::{AddInstanceOptions, AddReplicaOptions};
pub use create::{CreateClusterOptions, CreateReplicaSetOptions};
pub use dissolve::{DissolveOptions, DissolveReport};
pub use options::{ClusterOptions, InstanceOptions};
pub use primary::{ForcePrimaryOptions, ForcePrimaryOutcome, SetPrimaryOptions};
pub use recovery::{RebootOptions, RebootReport, RescanOptions, RescanReport};
pub use rejoin::RejoinOptions;
pub use remove::RemoveInstanceOptions;
pub use status::{ClusterDescription, ClusterStatus, InstanceStateReport, MemberStatus};

use crate::address::InstanceAddress;
use crate::config::{EngineConfig, MetadataBackendKind};
use crate::connector::{InstanceConnector, InstanceProbe, MemberState, ReplicationCommand};
use crate::error::{Result, TopologyError};
use crate::gtid::GtidSet;
use crate::locks::{LockManager, LockRequest, LockScope, LockSet};
use crate::log::{log_forced_override, log_topology_operation};
use crate::membership::{MembershipEvaluator, TopologyView};
use crate::metadata::{
    FileBackend, GroupRecord, InstanceRecord, InstanceRole, MemoryBackend, MetadataBackend, MetadataStore,
    ReplicationSources, TopologyScope,
};
use crate::metrics::{MetricsCollector, MetricsSummary};
use crate::trace::topology_operation_span;
use crate::wait::{poll_until, PollSettings};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// State shared by every handle of one engine
pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) connector: Arc<dyn InstanceConnector>,
    pub(crate) store: Arc<MetadataStore>,
    pub(crate) locks: LockManager,
    pub(crate) evaluator: MembershipEvaluator,
    pub(crate) metrics: Arc<MetricsCollector>,
    pub(crate) shutdown: CancellationToken,
}

pub(crate) fn parse_address(address: &str) -> Result<InstanceAddress> {
    address.parse()
}

/// Account names are derived from the server id so they are stable across renames
pub(crate) fn cluster_account(server_id: u32) -> String {
    format!("mysql_innodb_cluster_{}", server_id)
}

pub(crate) fn replica_set_account(server_id: u32) -> String {
    format!("mysql_innodb_rs_{}", server_id)
}

pub(crate) fn read_replica_account(server_id: u32) -> String {
    format!("mysql_innodb_replica_{}", server_id)
}

pub(crate) fn clusterset_account(server_id: u32) -> String {
    format!("mysql_innodb_cs_{}", server_id)
}

impl EngineInner {
    pub(crate) fn poll(&self, timeout: Duration) -> PollSettings {
        PollSettings::new(timeout, self.config.poll_interval())
    }

    /// Run a replication command, translating collaborator errors
    pub(crate) async fn execute(&self, address: &InstanceAddress, command: ReplicationCommand) -> Result<()> {
        let kind = command.kind();
        tracing::debug!("Executing {} on {}", kind, address);
        self.connector
            .execute(address, command)
            .await
            .map_err(|e| TopologyError::from_connector(address, e))
    }

    /// Run a command whose failure only deserves a warning
    pub(crate) async fn execute_best_effort(&self, address: &InstanceAddress, command: ReplicationCommand) -> bool {
        let kind = command.kind();
        match self.execute(address, command).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("{} on {} failed: {}", kind, address, e);
                false
            }
        }
    }

    pub(crate) async fn lock(&self, requests: Vec<LockRequest>, operation: &str, dry_run: bool) -> Result<LockSet> {
        if dry_run {
            return Ok(LockSet::none());
        }
        self.locks
            .acquire_all(requests, operation, self.config.lock_acquire_timeout())
            .await
    }

    pub(crate) fn forced(&self, operation: &str, target: &str, bypassed_check: &str) {
        log_forced_override(operation, target, bypassed_check);
        self.metrics.record_forced_override(operation);
    }

    pub(crate) async fn observe(&self, group: &GroupRecord) -> TopologyView {
        self.evaluator.observe(group).await
    }

    /// Wait until the instance reports itself ONLINE in a group
    pub(crate) async fn wait_for_online(
        &self,
        address: &InstanceAddress,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let evaluator = &self.evaluator;
        let what = format!("instance '{}' to become ONLINE", address);
        poll_until(&what, self.poll(timeout), cancel, move || async move {
            match evaluator.probe(address).await {
                Ok(probe) if probe.member_state == MemberState::Online && probe.group.is_some() => Ok(Some(())),
                Ok(probe) if probe.member_state == MemberState::Error => Err(TopologyError::Replication {
                    address: address.to_string(),
                    message: "member entered the ERROR state while joining the group".to_string(),
                }),
                _ => Ok(None),
            }
        })
        .await
    }

    /// Wait until `address` has applied every transaction in `target`
    pub(crate) async fn wait_for_transactions(
        &self,
        address: &InstanceAddress,
        target: &GtidSet,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let evaluator = &self.evaluator;
        let what = format!("instance '{}' to apply all transactions", address);
        poll_until(&what, self.poll(timeout), cancel, move || async move {
            match evaluator.probe(address).await {
                Ok(probe) if target.is_subset_of(&probe.gtid_executed) => Ok(Some(())),
                Ok(_) => Ok(None),
                Err(message) => Err(TopologyError::connectivity(address, message)),
            }
        })
        .await
    }

    /// Wait until a replication channel reports healthy
    pub(crate) async fn wait_for_channel(
        &self,
        address: &InstanceAddress,
        channel: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let evaluator = &self.evaluator;
        let what = format!("replication channel '{}' on '{}' to start", channel, address);
        poll_until(&what, self.poll(timeout), cancel, move || async move {
            let probe = evaluator
                .probe(address)
                .await
                .map_err(|message| TopologyError::connectivity(address, message))?;
            match probe.channel(channel) {
                Some(status) if status.is_healthy() => Ok(Some(())),
                Some(status) => match &status.last_error {
                    Some(error) if !status.sql_running || !status.io_running => Err(TopologyError::Replication {
                        address: address.to_string(),
                        message: format!("replication channel '{}' failed: {}", channel, error),
                    }),
                    _ => Ok(None),
                },
                None => Ok(None),
            }
        })
        .await
    }

    /// Wait until the group as seen from `address` elects `primary`
    pub(crate) async fn wait_for_primary(
        &self,
        address: &InstanceAddress,
        primary: &InstanceAddress,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let evaluator = &self.evaluator;
        let what = format!("instance '{}' to become PRIMARY", primary);
        poll_until(&what, self.poll(timeout), cancel, move || async move {
            let current = evaluator
                .probe(address)
                .await
                .ok()
                .and_then(|p| p.group.and_then(|v| v.primary().map(|m| m.address.clone())));
            Ok((current.as_ref() == Some(primary)).then_some(()))
        })
        .await
    }
}

impl EngineInner {
    /// Member that donates state to joining instances: the primary, else any online voter
    pub(crate) fn donor(&self, view: &TopologyView) -> Option<InstanceAddress> {
        view.primary.clone().or_else(|| view.online_voters().into_iter().next())
    }

    /// Resolve the upstream of an async channel against the live view
    pub(crate) fn resolve_source(
        &self,
        group: &GroupRecord,
        view: &TopologyView,
        sources: &ReplicationSources,
    ) -> Result<InstanceAddress> {
        let online = view.online_voters();
        let resolved = match sources {
            ReplicationSources::Primary => self.donor(view),
            ReplicationSources::Secondary => online
                .iter()
                .find(|a| Some(*a) != view.primary.as_ref())
                .cloned()
                .or_else(|| self.donor(view)),
            ReplicationSources::Custom(list) => {
                if let Some(unknown) = list.iter().find(|a| !group.voters().any(|v| &v.address == *a)) {
                    return Err(TopologyError::Validation(format!(
                        "Replication source '{}' is not a member of the cluster '{}'",
                        unknown, group.name
                    )));
                }
                list.iter().find(|a| online.contains(a)).cloned()
            }
        };
        resolved.ok_or_else(|| {
            TopologyError::Quorum(format!(
                "None of the replication sources ({}) of cluster '{}' is ONLINE",
                sources, group.name
            ))
        })
    }

    /// Point an instance's async channel at `source` and wait until it caught up
    pub(crate) async fn attach_channel(
        &self,
        address: &InstanceAddress,
        channel: &str,
        source: &InstanceAddress,
        account: &str,
        clone: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if clone {
            tracing::info!("Provisioning {} with a clone of {}", address, source);
            self.execute(address, ReplicationCommand::CloneFrom { donor: source.clone() })
                .await?;
        }
        self.execute(address, ReplicationCommand::SetSuperReadOnly(true)).await?;
        self.execute(
            address,
            ReplicationCommand::ConfigureChannel {
                channel: channel.to_string(),
                source: source.clone(),
                account: account.to_string(),
            },
        )
        .await?;
        self.execute(
            address,
            ReplicationCommand::StartChannel {
                channel: channel.to_string(),
            },
        )
        .await?;
        self.wait_for_channel(address, channel, self.config.member_online_timeout(), cancel)
            .await?;

        let target = self.evaluator.probe_reachable(source).await?.gtid_executed;
        self.wait_for_transactions(address, &target, self.config.sync_timeout(), cancel)
            .await
    }

    /// Stop and forget an async channel; both steps are idempotent
    pub(crate) async fn detach_channel(&self, address: &InstanceAddress, channel: &str) -> Result<()> {
        self.execute(
            address,
            ReplicationCommand::StopChannel {
                channel: channel.to_string(),
            },
        )
        .await?;
        self.execute(
            address,
            ReplicationCommand::ResetChannel {
                channel: channel.to_string(),
            },
        )
        .await
    }

    /// Move a running channel to a new source without re-provisioning
    pub(crate) async fn repoint_channel(
        &self,
        address: &InstanceAddress,
        channel: &str,
        source: &InstanceAddress,
        account: &str,
    ) -> Result<()> {
        self.execute(
            address,
            ReplicationCommand::StopChannel {
                channel: channel.to_string(),
            },
        )
        .await?;
        self.execute(
            address,
            ReplicationCommand::ConfigureChannel {
                channel: channel.to_string(),
                source: source.clone(),
                account: account.to_string(),
            },
        )
        .await?;
        self.execute(
            address,
            ReplicationCommand::StartChannel {
                channel: channel.to_string(),
            },
        )
        .await
    }
}

/// Build the metadata row of an instance from its probe
pub(crate) fn instance_record(
    probe: &InstanceProbe,
    role: InstanceRole,
    recovery_account: String,
    label: Option<String>,
    priority: u32,
) -> InstanceRecord {
    InstanceRecord {
        address: probe.address.clone(),
        server_uuid: probe.server_uuid.clone(),
        server_id: probe.server_id,
        label: label.unwrap_or_else(|| probe.address.to_string()),
        role,
        replication_sources: None,
        recovery_account,
        tags: BTreeMap::new(),
        priority,
        invalidated: false,
    }
}

/// Entry point of the orchestration core
#[derive(Clone)]
pub struct TopologyEngine {
    inner: Arc<EngineInner>,
}

impl TopologyEngine {
    pub fn new(config: EngineConfig, connector: Arc<dyn InstanceConnector>, backend: Arc<dyn MetadataBackend>) -> Self {
        let metrics = Arc::new(MetricsCollector::new(config.metrics.clone()));
        let store = Arc::new(MetadataStore::new(backend, config.metadata.clone(), metrics.clone()));
        let locks = LockManager::new(store.clone(), config.locks.clone());
        let evaluator = MembershipEvaluator::new(connector.clone(), config.probe_timeout(), metrics.clone());

        Self {
            inner: Arc::new(EngineInner {
                config,
                connector,
                store,
                locks,
                evaluator,
                metrics,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Build an engine with the metadata backend named in the configuration
    pub fn from_config(config: EngineConfig, connector: Arc<dyn InstanceConnector>) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| TopologyError::Validation(format!("Invalid configuration: {}", errors.join("; "))))?;

        let backend: Arc<dyn MetadataBackend> = match config.metadata.backend {
            MetadataBackendKind::Memory => Arc::new(MemoryBackend::new()),
            MetadataBackendKind::File => {
                let path = config
                    .metadata
                    .path
                    .clone()
                    .ok_or_else(|| TopologyError::Validation("File metadata backend requires a path".to_string()))?;
                Arc::new(FileBackend::new(path))
            }
        };
        Ok(Self::new(config, connector, backend))
    }

    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Install the metadata schema, or verify an existing one
    pub async fn install_metadata(&self) -> Result<()> {
        self.inner.store.ensure_schema().await.map(|_| ())
    }

    /// Handle on a registered cluster
    pub async fn get_cluster(&self, name: &str) -> Result<Cluster> {
        self.inner.store.read_group(name).await?;
        Ok(Cluster::new(self.inner.clone(), name))
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.inner.locks
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.inner.store
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.inner.metrics.get_metrics_summary()
    }

    /// Cancel every in-flight wait of every handle
    pub fn shutdown(&self) {
        crate::log::log_shutdown("engine shutdown requested");
        self.inner.shutdown.cancel();
    }
}

/// Handle on one registered group
#[derive(Clone)]
pub struct Cluster {
    pub(crate) engine: Arc<EngineInner>,
    pub(crate) name: String,
    pub(crate) cancel: CancellationToken,
    dissolved: Arc<AtomicBool>,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("dissolved", &self.dissolved.load(Ordering::SeqCst))
            .finish()
    }
}

impl Cluster {
    pub(crate) fn new(engine: Arc<EngineInner>, name: &str) -> Self {
        let cancel = engine.shutdown.child_token();
        Self {
            engine,
            name: name.to_string(),
            cancel,
            dissolved: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind the waits of this handle's operations to a caller token
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            cancel: token,
            ..self.clone()
        }
    }

    pub(crate) fn mark_dissolved(&self) {
        self.dissolved.store(true, Ordering::SeqCst);
    }

    pub(crate) async fn record(&self) -> Result<GroupRecord> {
        self.engine.store.read_group(&self.name).await
    }

    /// Commit a change to this group's metadata record
    pub(crate) async fn commit<T, F>(&self, mut mutation: F) -> Result<T>
    where
        F: FnMut(&mut GroupRecord) -> Result<T> + Send,
        T: Send,
    {
        let name = self.name.clone();
        self.engine
            .store
            .write_topology(TopologyScope::Group(name.clone()), None, move |document| {
                let group = document
                    .groups
                    .get_mut(&name)
                    .ok_or_else(|| TopologyError::NotFound(format!("The cluster '{}' no longer exists", name)))?;
                mutation(group)
            })
            .await
    }

    pub(crate) fn group_lock(&self) -> LockRequest {
        LockRequest::exclusive(LockScope::Group(self.name.clone()))
    }

    /// Group SHARED plus instance EXCLUSIVE, for single-member operations
    pub(crate) fn member_locks(&self, address: &InstanceAddress) -> Vec<LockRequest> {
        vec![
            LockRequest::shared(LockScope::Group(self.name.clone())),
            LockRequest::exclusive(LockScope::Instance(address.clone())),
        ]
    }

    /// Run an operation inside its span, recording metrics and the outcome
    pub(crate) async fn run<T, Fut>(&self, operation: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        if self.dissolved.load(Ordering::SeqCst) {
            return Err(TopologyError::Dissolved {
                name: self.name.clone(),
                operation: operation.to_string(),
            });
        }

        let start = Instant::now();
        let result = fut.instrument(topology_operation_span(operation, &self.name)).await;
        let elapsed = start.elapsed();

        self.engine
            .metrics
            .record_operation(operation, elapsed, result.as_ref().err().map(|e| e.kind()));
        let details = result.as_ref().err().map(|e| vec![("error", e.to_string())]);
        log_topology_operation(operation, &self.name, result.is_ok(), elapsed, details);
        result
    }
}
