//! Changing the PRIMARY cluster of a clusterset

use super::membership::{demote_record, original_limit, promote_record};
use super::{ClusterSet, MemberGroup, CLUSTERSET_ACCOUNT};
use crate::address::InstanceAddress;
use crate::connector::{ReplicationCommand, CLUSTERSET_CHANNEL};
use crate::error::{MemberFailure, Result, TopologyError};
use crate::gtid::GtidSet;
use crate::metadata::{FederationRecord, FederationRole};
use crate::topology::clusterset_account;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPrimaryClusterOptions {
    /// Unreachable replica clusters to mark INVALIDATED instead of failing
    pub invalidate_replica_clusters: Vec<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForcePrimaryClusterOptions {
    pub invalidate_replica_clusters: Vec<String>,
    pub dry_run: bool,
}

fn find<'a>(members: &'a [MemberGroup], name: &str) -> Result<&'a MemberGroup> {
    members
        .iter()
        .find(|m| m.name() == name)
        .ok_or_else(|| TopologyError::NotFound(format!("The cluster '{}' does not exist.", name)))
}

/// Every unreachable replica must be listed for invalidation, and only those
fn check_invalidations(members: &[MemberGroup], target: &str, listed: &[String]) -> Result<()> {
    for name in listed {
        let member = members.iter().find(|m| m.name() == name).ok_or_else(|| {
            TopologyError::Validation(format!("The cluster '{}' is not part of the clusterset", name))
        })?;
        if name == target {
            return Err(TopologyError::Validation(format!(
                "The cluster '{}' is the target of the operation and cannot be invalidated",
                name
            )));
        }
        if member.role == FederationRole::Replica && member.is_available() {
            return Err(TopologyError::Validation(format!(
                "The cluster '{}' is reachable and cannot be invalidated",
                name
            )));
        }
    }
    let unlisted: Vec<&str> = members
        .iter()
        .filter(|m| m.role == FederationRole::Replica && m.name() != target && !m.is_available())
        .map(|m| m.name())
        .filter(|name| !listed.iter().any(|l| l == name))
        .collect();
    if unlisted.is_empty() {
        Ok(())
    } else {
        Err(TopologyError::Validation(format!(
            "The following clusters are unreachable: {}. Add them to invalidate_replica_clusters to proceed.",
            unlisted.join(", ")
        )))
    }
}

impl ClusterSet {
    /// Planned switch of the PRIMARY cluster to `name`.
    ///
    /// The current primary cluster is fenced, the target catches up with it,
    /// then the roles swap and every other replica is repointed.
    pub async fn set_primary_cluster(&self, name: &str, options: SetPrimaryClusterOptions) -> Result<()> {
        self.run("setPrimaryCluster", async {
            let federation = self.record().await?;
            let locks = self
                .engine
                .lock(self.member_locks(&federation), "setPrimaryCluster", options.dry_run)
                .await?;
            let result = self.set_primary_locked(&federation, name, &options).await;
            locks.release().await;
            result
        })
        .await
    }

    async fn set_primary_locked(
        &self,
        federation: &FederationRecord,
        name: &str,
        options: &SetPrimaryClusterOptions,
    ) -> Result<()> {
        match federation.role_of(name) {
            None => {
                return Err(TopologyError::Validation(format!(
                    "The cluster '{}' is not part of the clusterset '{}'",
                    name, self.domain
                )))
            }
            Some(FederationRole::Primary) => {
                return Err(TopologyError::Validation(format!(
                    "The cluster '{}' is already the PRIMARY cluster",
                    name
                )))
            }
            Some(FederationRole::Invalidated) => {
                return Err(TopologyError::Validation(format!(
                    "The cluster '{}' is INVALIDATED; rejoin it before promoting",
                    name
                )))
            }
            Some(FederationRole::Replica) => {}
        }

        let members = self.observe_members(federation).await?;
        let old = find(&members, &federation.primary_group)?;
        let (Some(old_primary), Some(old_executed)) = (old.primary().cloned(), old.executed().cloned()) else {
            return Err(TopologyError::Quorum(format!(
                "The PRIMARY cluster '{}' is not available; use force_primary_cluster() instead",
                old.name()
            )));
        };
        let target = find(&members, name)?;
        let (Some(target_primary), Some(target_executed)) = (target.primary().cloned(), target.executed()) else {
            return Err(TopologyError::Connectivity {
                address: name.to_string(),
                message: "the cluster has no reachable PRIMARY with quorum".to_string(),
            });
        };
        check_invalidations(&members, name, &options.invalidate_replica_clusters)?;

        let channel_healthy = target
            .primary_probe()
            .and_then(|p| p.channel(CLUSTERSET_CHANNEL))
            .map(|c| c.is_healthy())
            .unwrap_or(false);
        if !channel_healthy {
            return Err(TopologyError::Replication {
                address: target_primary.to_string(),
                message: format!("the clusterset replication channel of cluster '{}' is not running", name),
            });
        }
        let errant = target_executed.subtract(&old_executed);
        if !errant.is_empty() {
            return Err(TopologyError::Consistency(format!(
                "The cluster '{}' has errant transactions '{}' and cannot be promoted",
                name, errant
            )));
        }

        if options.dry_run {
            tracing::info!(
                "Dry run: '{}' would become the PRIMARY cluster, replacing '{}'",
                name,
                old.name()
            );
            return Ok(());
        }

        self.engine.set_primary_writable(&old.view, false).await?;
        let fenced = self.engine.evaluator.probe_reachable(&old_primary).await.map(|p| p.gtid_executed);
        let caught_up = match fenced {
            Ok(executed) => {
                self.engine
                    .wait_for_transactions(&target_primary, &executed, self.engine.config.sync_timeout(), &self.cancel)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = caught_up {
            tracing::warn!("Cluster '{}' did not catch up with '{}': {}", name, old.name(), e);
            self.unfence(old).await;
            return Err(e);
        }
        if let Err(e) = self.promote(target).await {
            self.unfence(old).await;
            return Err(e);
        }

        let mut failures = Vec::new();
        let old_probe = old.primary_probe().map(|p| p.server_id).unwrap_or_default();
        let demoted_account = clusterset_account(old_probe);
        if let Err(e) = self.demote(old, &target_primary, &demoted_account).await {
            tracing::warn!("Former PRIMARY cluster '{}' could not be attached as a replica: {}", old.name(), e);
            failures.push(MemberFailure::new(old.name(), e));
        }
        failures.extend(self.repoint_replicas(&members, &[name, old.name()], &target_primary).await);

        let name = name.to_string();
        let domain = self.domain.clone();
        let old_name = old.name().to_string();
        let invalidated = options.invalidate_replica_clusters.clone();
        self.commit(federation.version, move |document| {
            if let Some(federation) = document.federations.get_mut(&domain) {
                federation.primary_group = name.clone();
                federation.members.insert(name.clone(), FederationRole::Primary);
                federation.members.insert(old_name.clone(), FederationRole::Replica);
                for group in &invalidated {
                    federation.members.insert(group.clone(), FederationRole::Invalidated);
                }
            }
            if let Some(group) = document.groups.get_mut(&name) {
                promote_record(group);
            }
            if let Some(group) = document.groups.get_mut(&old_name) {
                demote_record(group, &demoted_account);
            }
            Ok(())
        })
        .await?;

        self.engine.metrics.record_switchover("clusterset");
        self.finish("setPrimaryCluster", &target_primary, failures)
    }

    /// Emergency promotion of `name` while the PRIMARY cluster is unavailable.
    ///
    /// Transactions the old primary cluster did not replicate are lost; it
    /// is marked INVALIDATED and must be rejoined once it is back.
    pub async fn force_primary_cluster(&self, name: &str, options: ForcePrimaryClusterOptions) -> Result<()> {
        self.run("forcePrimaryCluster", async {
            let federation = self.record().await?;
            let locks = self
                .engine
                .lock(self.member_locks(&federation), "forcePrimaryCluster", options.dry_run)
                .await?;
            let result = self.force_primary_locked(&federation, name, &options).await;
            locks.release().await;
            result
        })
        .await
    }

    async fn force_primary_locked(
        &self,
        federation: &FederationRecord,
        name: &str,
        options: &ForcePrimaryClusterOptions,
    ) -> Result<()> {
        match federation.role_of(name) {
            Some(FederationRole::Replica) => {}
            None => {
                return Err(TopologyError::Validation(format!(
                    "The cluster '{}' is not part of the clusterset '{}'",
                    name, self.domain
                )))
            }
            Some(role) => {
                return Err(TopologyError::Validation(format!(
                    "The cluster '{}' is {} and cannot be force-promoted",
                    name, role
                )))
            }
        }

        let members = self.observe_members(federation).await?;
        let old = find(&members, &federation.primary_group)?;
        if old.is_available() {
            return Err(TopologyError::Quorum(format!(
                "The PRIMARY cluster '{}' is still available; use set_primary_cluster() instead",
                old.name()
            )));
        }
        let target = find(&members, name)?;
        let (Some(target_primary), Some(target_executed)) = (target.primary().cloned(), target.executed()) else {
            return Err(TopologyError::Connectivity {
                address: name.to_string(),
                message: "the cluster has no reachable PRIMARY with quorum".to_string(),
            });
        };
        check_invalidations(&members, name, &options.invalidate_replica_clusters)?;

        let ahead: Vec<&str> = members
            .iter()
            .filter(|m| m.role == FederationRole::Replica && m.name() != name)
            .filter(|m| {
                m.executed()
                    .map(|executed| !executed.is_subset_of(target_executed))
                    .unwrap_or(false)
            })
            .map(|m| m.name())
            .collect();
        if !ahead.is_empty() {
            return Err(TopologyError::Consistency(format!(
                "The target cluster is behind other candidates: {} have transactions '{}' lacks",
                ahead.join(", "),
                name
            )));
        }

        if options.dry_run {
            tracing::info!(
                "Dry run: '{}' would be forced to be the PRIMARY cluster, invalidating '{}'",
                name,
                old.name()
            );
            return Ok(());
        }

        let lost = old
            .view
            .members
            .values()
            .filter_map(|m| m.gtid_executed.as_ref())
            .fold(GtidSet::new(), |acc, g| acc.union(g))
            .subtract(target_executed);
        self.engine.forced(
            "forcePrimaryCluster",
            name,
            &format!(
                "PRIMARY cluster '{}' unavailable{}",
                old.name(),
                if lost.is_empty() {
                    String::new()
                } else {
                    format!(", transactions '{}' may be lost", lost)
                }
            ),
        );

        self.promote(target).await?;
        let failures = self.repoint_replicas(&members, &[name, old.name()], &target_primary).await;

        let name = name.to_string();
        let domain = self.domain.clone();
        let old_name = old.name().to_string();
        let invalidated = options.invalidate_replica_clusters.clone();
        self.commit(federation.version, move |document| {
            if let Some(federation) = document.federations.get_mut(&domain) {
                federation.primary_group = name.clone();
                federation.members.insert(name.clone(), FederationRole::Primary);
                federation.members.insert(old_name.clone(), FederationRole::Invalidated);
                for group in &invalidated {
                    federation.members.insert(group.clone(), FederationRole::Invalidated);
                }
            }
            if let Some(group) = document.groups.get_mut(&name) {
                promote_record(group);
            }
            Ok(())
        })
        .await?;

        self.engine.metrics.record_failover("clusterset");
        self.finish("forcePrimaryCluster", &target_primary, failures)
    }

    async fn unfence(&self, member: &MemberGroup) {
        tracing::warn!("Lifting the write fence on '{}'", member.name());
        if let Err(e) = self.engine.set_primary_writable(&member.view, true).await {
            tracing::error!("Could not lift the write fence on '{}': {}", member.name(), e);
        }
    }

    /// Stop pulling from the old primary cluster and accept writes
    async fn promote(&self, member: &MemberGroup) -> Result<()> {
        let Some(primary) = member.primary() else {
            return Err(TopologyError::Quorum(format!("The cluster '{}' has no reachable PRIMARY", member.name())));
        };
        self.engine.detach_channel(primary, CLUSTERSET_CHANNEL).await?;
        self.engine.set_primary_writable(&member.view, true).await?;
        self.engine
            .apply_transaction_size_limit(&member.view, original_limit(&member.record))
            .await;
        tracing::info!("Cluster '{}' promoted, {} accepts writes", member.name(), primary);
        Ok(())
    }

    /// Turn the former primary cluster into a replica of `source`
    async fn demote(&self, member: &MemberGroup, source: &InstanceAddress, account: &str) -> Result<()> {
        let Some(primary) = member.primary() else {
            return Err(TopologyError::Quorum(format!("The cluster '{}' has no reachable PRIMARY", member.name())));
        };
        self.engine
            .execute(
                source,
                ReplicationCommand::CreateReplicationAccount {
                    user: account.to_string(),
                    host: member.record.options.replication_allowed_host.clone(),
                },
            )
            .await?;
        self.engine.follow_source(primary, source, account, &self.cancel).await?;
        self.engine.apply_transaction_size_limit(&member.view, 0).await;
        Ok(())
    }

    /// Move every other reachable replica to the new primary cluster
    async fn repoint_replicas(
        &self,
        members: &[MemberGroup],
        skip: &[&str],
        source: &InstanceAddress,
    ) -> Vec<MemberFailure> {
        let mut failures = Vec::new();
        for member in members
            .iter()
            .filter(|m| m.role == FederationRole::Replica && !skip.contains(&m.name()))
        {
            let Some(primary) = member.primary() else {
                continue;
            };
            let Some(account) = member.record.attributes.get(CLUSTERSET_ACCOUNT) else {
                failures.push(MemberFailure::new(member.name(), "no clusterset replication account registered"));
                continue;
            };
            if let Err(e) = self.engine.follow_source(primary, source, account, &self.cancel).await {
                tracing::warn!("Replica cluster '{}' could not follow {}: {}", member.name(), source, e);
                failures.push(MemberFailure::new(member.name(), e));
            }
        }
        failures
    }

    fn finish(&self, operation: &str, primary: &InstanceAddress, failures: Vec<MemberFailure>) -> Result<()> {
        if failures.is_empty() {
            tracing::info!("Clusterset '{}' now replicates from {}", self.domain, primary);
            Ok(())
        } else {
            Err(TopologyError::PartialFailure {
                operation: operation.to_string(),
                failures,
            })
        }
    }
}
