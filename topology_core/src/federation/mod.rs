//! Multi-group coordinator
//!
//! A federation ("clusterset") is one PRIMARY group and any number of
//! REPLICA groups. The primary member of every replica group pulls from the
//! primary member of the primary group through the `clusterset_replication`
//! channel; replica groups keep their own primary read-only by switching the
//! group's "lift super_read_only on election" action OFF.

pub mod membership;
pub mod switchover;

pub use membership::{CreateReplicaClusterOptions, RejoinClusterOptions, RemoveClusterOptions};
pub use switchover::{ForcePrimaryClusterOptions, SetPrimaryClusterOptions};

use crate::address::InstanceAddress;
use crate::connector::{ChannelStatus, InstanceProbe, ReplicationCommand, ACTION_DISABLE_READ_ONLY_IF_PRIMARY, CLUSTERSET_CHANNEL};
use crate::error::{MemberFailure, Result, TopologyError};
use crate::gtid::GtidSet;
use crate::locks::{LockRequest, LockScope};
use crate::log::log_topology_operation;
use crate::membership::{GroupStatus, TopologyView};
use crate::metadata::{FederationRecord, FederationRole, GroupRecord, MetadataDocument, TopologyScope};
use crate::topology::{Cluster, EngineInner, TopologyEngine};
use crate::trace::federation_operation_span;
use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Group attribute naming the account a replica group replicates with
pub(crate) const CLUSTERSET_ACCOUNT: &str = "clusterset_replication_account";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FederationStatus {
    /// Primary available and every replica replicating consistently
    Healthy,
    /// Primary available, some replica group is not
    Available,
    Unavailable,
}

impl fmt::Display for FederationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FederationStatus::Healthy => f.write_str("HEALTHY"),
            FederationStatus::Available => f.write_str("AVAILABLE"),
            FederationStatus::Unavailable => f.write_str("UNAVAILABLE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSetMemberStatus {
    pub name: String,
    pub role: FederationRole,
    /// `OK`, `OK_NOT_REPLICATING`, `OK_NOT_CONSISTENT`, `NOT_OK` or `INVALIDATED`
    pub global_status: String,
    pub status: GroupStatus,
    pub primary: Option<InstanceAddress>,
    pub channel: Option<ChannelStatus>,
    /// Transactions of the primary group not yet applied
    pub transaction_lag: Option<u64>,
    pub errant_transactions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSetStatus {
    pub domain: String,
    pub primary_cluster: String,
    pub status: FederationStatus,
    pub status_text: String,
    pub clusters: Vec<ClusterSetMemberStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DescribedCluster {
    pub name: String,
    pub role: FederationRole,
    pub instances: Vec<InstanceAddress>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSetDescription {
    pub domain: String,
    pub primary_cluster: String,
    pub clusters: Vec<DescribedCluster>,
}

/// One member group with its role and live view
pub(crate) struct MemberGroup {
    pub(crate) record: GroupRecord,
    pub(crate) role: FederationRole,
    pub(crate) view: TopologyView,
}

impl MemberGroup {
    pub(crate) fn name(&self) -> &str {
        &self.record.name
    }

    pub(crate) fn primary_probe(&self) -> Option<&InstanceProbe> {
        if self.view.has_quorum() {
            self.view.primary_probe()
        } else {
            None
        }
    }

    pub(crate) fn primary(&self) -> Option<&InstanceAddress> {
        self.primary_probe().map(|p| &p.address)
    }

    pub(crate) fn is_available(&self) -> bool {
        self.primary_probe().is_some()
    }

    pub(crate) fn account(&self) -> Result<String> {
        self.record.attributes.get(CLUSTERSET_ACCOUNT).cloned().ok_or_else(|| {
            TopologyError::Consistency(format!(
                "The cluster '{}' has no clusterset replication account registered",
                self.name()
            ))
        })
    }

    pub(crate) fn executed(&self) -> Option<&GtidSet> {
        self.primary_probe().map(|p| &p.gtid_executed)
    }
}

impl EngineInner {
    /// Switch the "lift super_read_only on the elected primary" action of a group
    pub(crate) async fn set_primary_writable(&self, view: &TopologyView, writable: bool) -> Result<()> {
        let value = if writable { "ON" } else { "OFF" };
        let mut failures = Vec::new();
        for address in view.online_voters() {
            let command = ReplicationCommand::SetVariable {
                name: ACTION_DISABLE_READ_ONLY_IF_PRIMARY.to_string(),
                value: value.to_string(),
            };
            if let Err(e) = self.execute(&address, command).await {
                failures.push(MemberFailure::new(&address, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(TopologyError::PartialFailure {
                operation: "setPrimaryWritable".to_string(),
                failures,
            })
        }
    }

    pub(crate) async fn apply_transaction_size_limit(&self, view: &TopologyView, limit: u64) {
        for address in view.online_voters() {
            self.execute_best_effort(
                &address,
                ReplicationCommand::SetVariable {
                    name: "group_replication_transaction_size_limit".to_string(),
                    value: limit.to_string(),
                },
            )
            .await;
        }
    }

    /// Point the clusterset channel of `target` at `source` and wait until it runs
    pub(crate) async fn follow_source(
        &self,
        target: &InstanceAddress,
        source: &InstanceAddress,
        account: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.repoint_channel(target, CLUSTERSET_CHANNEL, source, account).await?;
        self.wait_for_channel(target, CLUSTERSET_CHANNEL, self.config.member_online_timeout(), cancel)
            .await
    }

    /// Keep inter-group replication attached after a group changed its primary.
    ///
    /// In the primary group every replica group is moved to the new primary;
    /// in a replica group the channel moves from the old primary to the new one.
    /// Returns the members that could not be repointed.
    pub(crate) async fn follow_primary_change(
        &self,
        group: &GroupRecord,
        old_primary: Option<&InstanceAddress>,
        new_primary: &InstanceAddress,
        cancel: &CancellationToken,
    ) -> Vec<MemberFailure> {
        let Some(domain) = &group.federation else {
            return Vec::new();
        };
        let document = match self.store.read_topology().await {
            Ok(document) => document,
            Err(e) => return vec![MemberFailure::new(new_primary, e)],
        };
        let Some(federation) = document.federations.get(domain) else {
            return Vec::new();
        };

        let mut failures = Vec::new();
        match federation.role_of(&group.name) {
            Some(FederationRole::Primary) => {
                for name in federation.replicas() {
                    let Some(replica) = document.groups.get(name) else {
                        continue;
                    };
                    let view = self.observe(replica).await;
                    let (Some(target), Some(account)) = (view.primary.clone(), replica.attributes.get(CLUSTERSET_ACCOUNT))
                    else {
                        failures.push(MemberFailure::new(name, "replica cluster has no reachable PRIMARY"));
                        continue;
                    };
                    if let Err(e) = self.follow_source(&target, new_primary, account, cancel).await {
                        tracing::warn!("Replica cluster '{}' could not follow the new primary: {}", name, e);
                        failures.push(MemberFailure::new(&target, e));
                    }
                }
            }
            Some(FederationRole::Replica) => {
                let Some(account) = group.attributes.get(CLUSTERSET_ACCOUNT) else {
                    return vec![MemberFailure::new(new_primary, "no clusterset replication account registered")];
                };
                let source = match document.groups.get(&federation.primary_group) {
                    Some(primary_group) => self.observe(primary_group).await.primary,
                    None => None,
                };
                let Some(source) = source else {
                    return vec![MemberFailure::new(new_primary, "the PRIMARY cluster has no reachable PRIMARY")];
                };
                if let Some(old) = old_primary.filter(|old| *old != new_primary) {
                    if let Err(e) = self.detach_channel(old, CLUSTERSET_CHANNEL).await {
                        tracing::warn!("Could not stop the clusterset channel on {}: {}", old, e);
                    }
                }
                if let Err(e) = self.follow_source(new_primary, &source, account, cancel).await {
                    failures.push(MemberFailure::new(new_primary, e));
                }
            }
            _ => {}
        }
        failures
    }
}

impl TopologyEngine {
    /// Handle on a registered clusterset
    pub async fn get_cluster_set(&self, domain: &str) -> Result<ClusterSet> {
        self.inner().store.read_federation(domain).await?;
        Ok(ClusterSet::new(self.inner().clone(), domain))
    }
}

impl Cluster {
    /// Handle on the clusterset this cluster belongs to
    pub async fn get_cluster_set(&self) -> Result<ClusterSet> {
        let group = self.record().await?;
        let domain = group.federation.ok_or_else(|| {
            TopologyError::Validation(format!("The cluster '{}' is not part of a clusterset", self.name))
        })?;
        Ok(ClusterSet::new(self.engine.clone(), &domain))
    }
}

/// Handle on one federation
#[derive(Clone)]
pub struct ClusterSet {
    pub(crate) engine: Arc<EngineInner>,
    pub(crate) domain: String,
    pub(crate) cancel: CancellationToken,
}

impl fmt::Debug for ClusterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterSet").field("domain", &self.domain).finish()
    }
}

impl ClusterSet {
    pub(crate) fn new(engine: Arc<EngineInner>, domain: &str) -> Self {
        let cancel = engine.shutdown.child_token();
        Self {
            engine,
            domain: domain.to_string(),
            cancel,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            cancel: token,
            ..self.clone()
        }
    }

    pub(crate) async fn record(&self) -> Result<FederationRecord> {
        self.engine.store.read_federation(&self.domain).await
    }

    /// Exclusive locks on every member group
    pub(crate) fn member_locks(&self, federation: &FederationRecord) -> Vec<LockRequest> {
        federation
            .members
            .keys()
            .map(|name| LockRequest::exclusive(LockScope::Group(name.clone())))
            .collect()
    }

    /// Commit a change that depends on the federation record at `expected`
    pub(crate) async fn commit<T, F>(&self, expected: u64, mut mutation: F) -> Result<T>
    where
        F: FnMut(&mut MetadataDocument) -> Result<T> + Send,
        T: Send,
    {
        self.engine
            .store
            .write_topology(TopologyScope::Federation(self.domain.clone()), Some(expected), move |document| {
                mutation(document)
            })
            .await
    }

    /// Observe every member group concurrently
    pub(crate) async fn observe_members(&self, federation: &FederationRecord) -> Result<Vec<MemberGroup>> {
        let document = self.engine.store.read_topology().await?;
        let mut records = Vec::new();
        for (name, role) in &federation.members {
            let record = document.groups.get(name).cloned().ok_or_else(|| {
                TopologyError::Consistency(format!(
                    "The cluster '{}' of clusterset '{}' is missing from the metadata",
                    name, self.domain
                ))
            })?;
            records.push((record, *role));
        }
        let views = join_all(records.iter().map(|(record, _)| self.engine.observe(record))).await;
        Ok(records
            .into_iter()
            .zip(views)
            .map(|((record, role), view)| MemberGroup { record, role, view })
            .collect())
    }

    pub(crate) async fn run<T, Fut>(&self, operation: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = fut.instrument(federation_operation_span(operation, &self.domain)).await;
        let elapsed = start.elapsed();

        self.engine
            .metrics
            .record_operation(operation, elapsed, result.as_ref().err().map(|e| e.kind()));
        let details = result.as_ref().err().map(|e| vec![("error", e.to_string())]);
        log_topology_operation(operation, &self.domain, result.is_ok(), elapsed, details);
        result
    }

    /// Role, availability and replication health of every member group
    pub async fn status(&self) -> Result<ClusterSetStatus> {
        self.run("clusterSetStatus", async {
            let federation = self.record().await?;
            let members = self.observe_members(&federation).await?;
            let primary = members.iter().find(|m| m.role == FederationRole::Primary);
            let primary_executed = primary.and_then(|p| p.executed()).cloned();

            let mut clusters = Vec::new();
            for member in &members {
                let channel = member
                    .primary_probe()
                    .and_then(|p| p.channel(CLUSTERSET_CHANNEL))
                    .cloned();
                let (lag, errant) = match (member.role, member.executed(), &primary_executed) {
                    (FederationRole::Primary, _, _) => (None, None),
                    (_, Some(executed), Some(source)) => {
                        let errant = executed.subtract(source);
                        (
                            Some(source.subtract(executed).count()),
                            (!errant.is_empty()).then(|| errant.to_string()),
                        )
                    }
                    _ => (None, None),
                };
                let global_status = match member.role {
                    FederationRole::Invalidated => "INVALIDATED",
                    _ if !member.is_available() => "NOT_OK",
                    FederationRole::Primary => "OK",
                    FederationRole::Replica if errant.is_some() => "OK_NOT_CONSISTENT",
                    FederationRole::Replica if !channel.as_ref().map(|c| c.is_healthy()).unwrap_or(false) => {
                        "OK_NOT_REPLICATING"
                    }
                    FederationRole::Replica => "OK",
                };
                clusters.push(ClusterSetMemberStatus {
                    name: member.name().to_string(),
                    role: member.role,
                    global_status: global_status.to_string(),
                    status: member.view.status,
                    primary: member.view.primary.clone(),
                    channel,
                    transaction_lag: lag,
                    errant_transactions: errant,
                });
            }

            let (status, status_text) = if !primary.map(|p| p.is_available()).unwrap_or(false) {
                (
                    FederationStatus::Unavailable,
                    format!(
                        "Primary Cluster '{}' is not available; use force_primary_cluster() to fail over.",
                        federation.primary_group
                    ),
                )
            } else if clusters.iter().all(|c| c.global_status == "OK") {
                (FederationStatus::Healthy, "All Clusters available.".to_string())
            } else {
                let degraded: Vec<&str> = clusters
                    .iter()
                    .filter(|c| c.global_status != "OK")
                    .map(|c| c.name.as_str())
                    .collect();
                (
                    FederationStatus::Available,
                    format!("Primary Cluster available, there are issues with: {}", degraded.join(", ")),
                )
            };

            Ok(ClusterSetStatus {
                domain: self.domain.clone(),
                primary_cluster: federation.primary_group.clone(),
                status,
                status_text,
                clusters,
            })
        })
        .await
    }

    pub async fn describe(&self) -> Result<ClusterSetDescription> {
        self.run("clusterSetDescribe", async {
            let federation = self.record().await?;
            let document = self.engine.store.read_topology().await?;
            let clusters = federation
                .members
                .iter()
                .map(|(name, role)| DescribedCluster {
                    name: name.clone(),
                    role: *role,
                    instances: document.groups.get(name).map(|g| g.addresses()).unwrap_or_default(),
                })
                .collect();
            Ok(ClusterSetDescription {
                domain: self.domain.clone(),
                primary_cluster: federation.primary_group,
                clusters,
            })
        })
        .await
    }
}
