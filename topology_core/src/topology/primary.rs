//! Primary changes: planned switchover, forced failover, quorum restoration
//! and topology mode switches

use super::{parse_address, Cluster};
use crate::address::InstanceAddress;
use crate::connector::{
    GroupMode, MemberRole, MemberState, ReplicationCommand, READ_REPLICA_CHANNEL, REPLICASET_CHANNEL,
};
use crate::error::{MemberFailure, Result, TopologyError};
use crate::gtid::{compare, GtidRelation};
use crate::membership::{rank_candidates, Candidate, InstanceStatus, TopologyView};
use crate::metadata::{GroupKind, GroupRecord, ReplicationSources};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetPrimaryOptions {
    /// Overrides the configured sync timeout
    pub timeout: Option<Duration>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForcePrimaryOptions {
    /// Mark unreachable members INVALIDATED instead of leaving them untouched
    pub invalidate_error_instances: bool,
    pub dry_run: bool,
}

/// Result of a forced failover
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForcePrimaryOutcome {
    pub primary: InstanceAddress,
    pub invalidated: Vec<InstanceAddress>,
    /// Unreachable members kept as they are; they may rejoin once back
    pub left_untouched: Vec<InstanceAddress>,
}

fn last_known_primary(group: &GroupRecord, view: &TopologyView) -> Option<InstanceAddress> {
    view.live_view
        .as_ref()
        .and_then(|v| v.members.iter().find(|m| m.role == MemberRole::Primary))
        .map(|m| m.address.clone())
        .or_else(|| group.primary.clone())
}

/// Explicit candidate must hold every transaction the other candidates have
fn check_not_behind(candidate: &Candidate, others: &[Candidate]) -> Result<()> {
    if let Some(ahead) = others.iter().find(|o| {
        o.address != candidate.address && compare(&o.gtid_executed, &candidate.gtid_executed) == GtidRelation::ASuperset
    }) {
        return Err(TopologyError::Consistency(format!(
            "The instance '{}' cannot be promoted: it is missing transactions that '{}' has applied",
            candidate.address, ahead.address
        )));
    }
    Ok(())
}

fn pick_candidate(candidates: Vec<Candidate>, requested: Option<&InstanceAddress>) -> Result<InstanceAddress> {
    match requested {
        Some(address) => {
            let candidate = candidates.iter().find(|c| &c.address == address).ok_or_else(|| {
                TopologyError::Validation(format!(
                    "The instance '{}' is not a reachable member eligible for promotion",
                    address
                ))
            })?;
            check_not_behind(candidate, &candidates)?;
            Ok(address.clone())
        }
        None => {
            let ranked = rank_candidates(candidates)?;
            ranked
                .into_iter()
                .next()
                .map(|c| c.address)
                .ok_or_else(|| TopologyError::Quorum("No eligible candidate is reachable".to_string()))
        }
    }
}

impl Cluster {
    /// Planned switchover to `address`
    pub async fn set_primary_instance(&self, address: &str, options: SetPrimaryOptions) -> Result<()> {
        let address = parse_address(address)?;
        self.run("setPrimaryInstance", async {
            let locks = self
                .engine
                .lock(vec![self.group_lock()], "setPrimaryInstance", options.dry_run)
                .await?;
            let result = self.set_primary_locked(&address, &options).await;
            locks.release().await;
            result
        })
        .await
    }

    /// Failover after the primary is lost; only valid without quorum
    pub async fn force_primary_instance(
        &self,
        address: Option<&str>,
        options: ForcePrimaryOptions,
    ) -> Result<ForcePrimaryOutcome> {
        let requested = address.map(parse_address).transpose()?;
        self.run("forcePrimaryInstance", async {
            let locks = self
                .engine
                .lock(vec![self.group_lock()], "forcePrimaryInstance", options.dry_run)
                .await?;
            let result = self.force_primary_locked(requested.as_ref(), &options).await;
            locks.release().await;
            result
        })
        .await
    }

    /// Restore quorum from the partition `address` belongs to
    pub async fn force_quorum_using_partition_of(&self, address: &str) -> Result<()> {
        let address = parse_address(address)?;
        self.run("forceQuorumUsingPartitionOf", async {
            let locks = self
                .engine
                .lock(vec![self.group_lock()], "forceQuorumUsingPartitionOf", false)
                .await?;
            let result = self.force_quorum_locked(&address).await;
            locks.release().await;
            result
        })
        .await
    }

    pub async fn switch_to_single_primary_mode(&self, primary: Option<&str>) -> Result<()> {
        let primary = primary.map(parse_address).transpose()?;
        self.run("switchToSinglePrimaryMode", async {
            let locks = self
                .engine
                .lock(vec![self.group_lock()], "switchToSinglePrimaryMode", false)
                .await?;
            let result = self.switch_mode_locked(GroupMode::SinglePrimary, primary.as_ref()).await;
            locks.release().await;
            result
        })
        .await
    }

    pub async fn switch_to_multi_primary_mode(&self) -> Result<()> {
        self.run("switchToMultiPrimaryMode", async {
            let locks = self
                .engine
                .lock(vec![self.group_lock()], "switchToMultiPrimaryMode", false)
                .await?;
            let result = self.switch_mode_locked(GroupMode::MultiPrimary, None).await;
            locks.release().await;
            result
        })
        .await
    }

    async fn set_primary_locked(&self, target: &InstanceAddress, options: &SetPrimaryOptions) -> Result<()> {
        let group = self.record().await?;
        if group.is_replica_set() {
            return self.switchover_replica_set(&group, target, options).await;
        }
        if group.mode() != Some(GroupMode::SinglePrimary) {
            return Err(TopologyError::Validation(format!(
                "Operation not allowed: cluster '{}' is in Multi-Primary mode",
                self.name
            )));
        }
        match group.instances.get(target) {
            Some(record) if record.is_voter() => {}
            Some(_) => {
                return Err(TopologyError::Validation(format!(
                    "The instance '{}' is a read replica and cannot become PRIMARY",
                    target
                )))
            }
            None => {
                return Err(TopologyError::Validation(format!(
                    "The instance '{}' does not belong to the cluster '{}'",
                    target, self.name
                )))
            }
        }

        let view = self.engine.observe(&group).await;
        if !view.has_quorum() {
            return Err(TopologyError::Quorum(format!(
                "There is no quorum to perform the operation on '{}'",
                self.name
            )));
        }
        if view.status_of(target) != Some(InstanceStatus::Online) {
            return Err(TopologyError::Validation(format!(
                "The instance '{}' is not ONLINE and cannot be promoted",
                target
            )));
        }
        let old_primary = view
            .primary
            .clone()
            .ok_or_else(|| TopologyError::Quorum(format!("Cluster '{}' has no PRIMARY", self.name)))?;
        if &old_primary == target {
            return Err(TopologyError::Validation(format!(
                "The instance '{}' is already the PRIMARY of '{}'",
                target, self.name
            )));
        }

        let timeout = options.timeout.unwrap_or(self.engine.config.sync_timeout());
        let executed = view.group_executed();
        for member in view.online_voters() {
            self.engine
                .wait_for_transactions(&member, &executed, timeout, &self.cancel)
                .await?;
        }

        if options.dry_run {
            tracing::info!("Dry run: PRIMARY of '{}' would move from {} to {}", self.name, old_primary, target);
            return Ok(());
        }

        let switched = async {
            self.engine
                .execute(
                    target,
                    ReplicationCommand::SetPrimary {
                        primary: target.clone(),
                    },
                )
                .await?;
            self.engine
                .wait_for_primary(target, target, timeout, &self.cancel)
                .await
        }
        .await;

        if let Err(e) = switched {
            tracing::warn!("Switchover to {} failed, restoring {} as PRIMARY: {}", target, old_primary, e);
            self.engine
                .execute_best_effort(
                    &old_primary,
                    ReplicationCommand::SetPrimary {
                        primary: old_primary.clone(),
                    },
                )
                .await;
            return Err(e);
        }

        let mut failures = self.repoint_read_replicas(&group, &view, target).await;
        failures.extend(
            self.engine
                .follow_primary_change(&group, Some(&old_primary), target, &self.cancel)
                .await,
        );

        let promoted = target.clone();
        self.commit(move |group| {
            group.primary = Some(promoted.clone());
            Ok(())
        })
        .await?;
        self.engine.metrics.record_switchover("instance");

        if !failures.is_empty() {
            return Err(TopologyError::PartialFailure {
                operation: "setPrimaryInstance".to_string(),
                failures,
            });
        }
        tracing::info!("'{}' is the new PRIMARY of '{}'", target, self.name);
        Ok(())
    }

    /// Move read replicas that follow the primary to the new one
    pub(crate) async fn repoint_read_replicas(
        &self,
        group: &GroupRecord,
        view: &TopologyView,
        new_primary: &InstanceAddress,
    ) -> Vec<MemberFailure> {
        let mut failures = Vec::new();
        for replica in group.read_replicas().filter(|r| !r.invalidated) {
            let follows_primary = matches!(replica.replication_sources, None | Some(ReplicationSources::Primary));
            if !follows_primary {
                continue;
            }
            if !view.is_reachable(&replica.address) {
                failures.push(MemberFailure::new(&replica.address, "unreachable, still replicating from the former PRIMARY"));
                continue;
            }
            if let Err(e) = self
                .engine
                .repoint_channel(&replica.address, READ_REPLICA_CHANNEL, new_primary, &replica.recovery_account)
                .await
            {
                failures.push(MemberFailure::new(&replica.address, e));
            }
        }
        failures
    }

    async fn switchover_replica_set(
        &self,
        group: &GroupRecord,
        target: &InstanceAddress,
        options: &SetPrimaryOptions,
    ) -> Result<()> {
        let target_record = group.instances.get(target).cloned().ok_or_else(|| {
            TopologyError::Validation(format!("The instance '{}' does not belong to the replicaset '{}'", target, self.name))
        })?;
        let view = self.engine.observe(group).await;
        let old_primary = match (&view.primary, view.has_quorum()) {
            (Some(primary), true) => primary.clone(),
            _ => {
                return Err(TopologyError::Quorum(format!(
                    "The PRIMARY of replicaset '{}' is unavailable; use force_primary_instance() instead",
                    self.name
                )))
            }
        };
        if &old_primary == target {
            return Err(TopologyError::Validation(format!(
                "The instance '{}' is already the PRIMARY of '{}'",
                target, self.name
            )));
        }
        if view.status_of(target) != Some(InstanceStatus::Online) {
            return Err(TopologyError::Validation(format!(
                "The instance '{}' is not replicating from the PRIMARY and cannot be promoted",
                target
            )));
        }
        if options.dry_run {
            tracing::info!("Dry run: PRIMARY of '{}' would move from {} to {}", self.name, old_primary, target);
            return Ok(());
        }

        let timeout = options.timeout.unwrap_or(self.engine.config.sync_timeout());
        let old_account = group
            .instances
            .get(&old_primary)
            .map(|r| r.recovery_account.clone())
            .unwrap_or_default();

        // Fence writes, then let the target drain the primary's transactions
        self.engine
            .execute(&old_primary, ReplicationCommand::SetSuperReadOnly(true))
            .await?;
        let caught_up = async {
            let fenced = self.engine.evaluator.probe_reachable(&old_primary).await?.gtid_executed;
            self.engine
                .wait_for_transactions(target, &fenced, timeout, &self.cancel)
                .await
        }
        .await;
        if let Err(e) = caught_up {
            tracing::warn!("{} did not catch up with {}, unfencing: {}", target, old_primary, e);
            self.engine
                .execute_best_effort(&old_primary, ReplicationCommand::SetSuperReadOnly(false))
                .await;
            return Err(e);
        }

        let promoted = async {
            self.engine.detach_channel(target, REPLICASET_CHANNEL).await?;
            self.engine
                .execute(target, ReplicationCommand::SetSuperReadOnly(false))
                .await
        }
        .await;
        if let Err(e) = promoted {
            tracing::warn!("Promotion of {} failed, restoring {}: {}", target, old_primary, e);
            self.engine
                .execute_best_effort(target, ReplicationCommand::SetSuperReadOnly(true))
                .await;
            if let Err(restore) = self
                .engine
                .repoint_channel(target, REPLICASET_CHANNEL, &old_primary, &target_record.recovery_account)
                .await
            {
                tracing::warn!("Could not restore replication on {}: {}", target, restore);
            }
            self.engine
                .execute_best_effort(&old_primary, ReplicationCommand::SetSuperReadOnly(false))
                .await;
            return Err(e);
        }

        let mut failures = Vec::new();
        if let Err(e) = self
            .engine
            .repoint_channel(&old_primary, REPLICASET_CHANNEL, target, &old_account)
            .await
        {
            failures.push(MemberFailure::new(&old_primary, e));
        }
        for replica in group
            .instances
            .values()
            .filter(|r| &r.address != target && r.address != old_primary && !r.invalidated)
        {
            if !view.is_reachable(&replica.address) {
                failures.push(MemberFailure::new(&replica.address, "unreachable, still replicating from the former PRIMARY"));
                continue;
            }
            if let Err(e) = self
                .engine
                .repoint_channel(&replica.address, REPLICASET_CHANNEL, target, &replica.recovery_account)
                .await
            {
                failures.push(MemberFailure::new(&replica.address, e));
            }
        }

        let new_primary = target.clone();
        self.commit(move |group| {
            group.primary = Some(new_primary.clone());
            Ok(())
        })
        .await?;
        self.engine.metrics.record_switchover("instance");

        if !failures.is_empty() {
            return Err(TopologyError::PartialFailure {
                operation: "setPrimaryInstance".to_string(),
                failures,
            });
        }
        tracing::info!("'{}' is the new PRIMARY of replicaset '{}'", target, self.name);
        Ok(())
    }

    async fn force_primary_locked(
        &self,
        requested: Option<&InstanceAddress>,
        options: &ForcePrimaryOptions,
    ) -> Result<ForcePrimaryOutcome> {
        let group = self.record().await?;
        let view = self.engine.observe(&group).await;
        if view.has_quorum() {
            return Err(TopologyError::Quorum(format!(
                "Cannot force a new PRIMARY on '{}': the PRIMARY still available and the group has quorum. \
                 Use set_primary_instance() for a planned switchover.",
                self.name
            )));
        }

        // Members that can take part in the new membership
        let candidates: Vec<Candidate> = group
            .voters()
            .filter(|r| !r.invalidated)
            .filter(|r| Some(&r.address) != group.primary.as_ref() || !group.is_replica_set())
            .filter_map(|r| {
                let probe = view.probe(&r.address)?;
                let eligible = if group.is_replica_set() {
                    true
                } else {
                    probe.view_of(&group.group_id).is_some() && probe.member_state == MemberState::Online
                };
                eligible.then(|| Candidate {
                    address: r.address.clone(),
                    gtid_executed: probe.gtid_executed.clone(),
                    priority: r.priority,
                    server_id: r.server_id,
                })
            })
            .collect();
        let partition: Vec<InstanceAddress> = candidates.iter().map(|c| c.address.clone()).collect();
        let chosen = pick_candidate(candidates, requested)?;

        let former = last_known_primary(&group, &view);
        let mut invalidated = Vec::new();
        let mut left_untouched = Vec::new();
        for record in group.voters().filter(|r| !r.invalidated && !partition.contains(&r.address)) {
            if Some(&record.address) == former.as_ref() || options.invalidate_error_instances {
                invalidated.push(record.address.clone());
            } else {
                left_untouched.push(record.address.clone());
            }
        }
        let outcome = ForcePrimaryOutcome {
            primary: chosen.clone(),
            invalidated,
            left_untouched,
        };

        if options.dry_run {
            tracing::info!("Dry run: '{}' would be forced to PRIMARY of '{}'", chosen, self.name);
            return Ok(outcome);
        }

        self.engine.forced(
            "forcePrimaryInstance",
            &self.name,
            &format!(
                "PRIMARY lost; promoting '{}' without the unreachable members {:?}",
                chosen, outcome.invalidated
            ),
        );

        let mut failures = Vec::new();
        if group.is_replica_set() {
            self.engine.detach_channel(&chosen, REPLICASET_CHANNEL).await?;
            self.engine
                .execute(&chosen, ReplicationCommand::SetSuperReadOnly(false))
                .await?;
            for member in partition.iter().filter(|a| *a != &chosen) {
                let account = group
                    .instances
                    .get(member)
                    .map(|r| r.recovery_account.clone())
                    .unwrap_or_default();
                if let Err(e) = self
                    .engine
                    .repoint_channel(member, REPLICASET_CHANNEL, &chosen, &account)
                    .await
                {
                    failures.push(MemberFailure::new(member, e));
                }
            }
        } else {
            self.engine
                .execute(
                    &chosen,
                    ReplicationCommand::ForceMembers {
                        members: partition.clone(),
                    },
                )
                .await?;
            if group.mode() == Some(GroupMode::SinglePrimary) {
                self.engine
                    .execute(
                        &chosen,
                        ReplicationCommand::SetPrimary {
                            primary: chosen.clone(),
                        },
                    )
                    .await?;
                self.engine
                    .wait_for_primary(&chosen, &chosen, self.engine.config.sync_timeout(), &self.cancel)
                    .await?;
            }
            let refreshed = self.engine.observe(&group).await;
            failures.extend(self.repoint_read_replicas(&group, &refreshed, &chosen).await);
            failures.extend(
                self.engine
                    .follow_primary_change(&group, former.as_ref(), &chosen, &self.cancel)
                    .await,
            );
        }

        let written_off = outcome.invalidated.clone();
        let new_primary = chosen.clone();
        self.commit(move |group| {
            for address in &written_off {
                if let Some(instance) = group.instances.get_mut(address) {
                    instance.invalidated = true;
                }
            }
            group.primary = Some(new_primary.clone());
            Ok(())
        })
        .await?;
        self.engine.metrics.record_failover("instance");

        for failure in &failures {
            tracing::warn!("Member {} was not reconfigured after failover: {}", failure.address, failure.reason);
        }
        tracing::info!("'{}' forced to PRIMARY of '{}'", chosen, self.name);
        Ok(outcome)
    }

    async fn force_quorum_locked(&self, address: &InstanceAddress) -> Result<()> {
        let group = self.record().await?;
        if group.is_replica_set() {
            return Err(TopologyError::Validation(
                "force_quorum_using_partition_of() is not available for replicasets".to_string(),
            ));
        }
        if !group.instances.get(address).map(|r| r.is_voter()).unwrap_or(false) {
            return Err(TopologyError::Validation(format!(
                "The instance '{}' is not a voting member of '{}'",
                address, self.name
            )));
        }

        let view = self.engine.observe(&group).await;
        if view.has_quorum() {
            return Err(TopologyError::Quorum(format!(
                "Cannot perform operation on an healthy cluster '{}' because it can only be used to restore a cluster from quorum loss.",
                self.name
            )));
        }

        let probe = self.engine.evaluator.probe_reachable(address).await?;
        let partition_view = probe
            .view_of(&group.group_id)
            .filter(|_| probe.member_state == MemberState::Online)
            .ok_or_else(|| {
                TopologyError::Validation(format!(
                    "The instance '{}' is not ONLINE in the group; use reboot_cluster_from_complete_outage() if no member is",
                    address
                ))
            })?;
        let partition: Vec<InstanceAddress> = partition_view
            .online()
            .map(|m| m.address.clone())
            .filter(|a| view.is_reachable(a))
            .collect();
        let dropped: Vec<String> = partition_view
            .members
            .iter()
            .filter(|m| !partition.contains(&m.address))
            .map(|m| m.address.to_string())
            .collect();

        self.engine.forced(
            "forceQuorumUsingPartitionOf",
            &self.name,
            &format!("membership restricted to the partition of '{}', dropping {:?}", address, dropped),
        );
        self.engine
            .execute(address, ReplicationCommand::ForceMembers { members: partition })
            .await?;

        let primary = self
            .engine
            .evaluator
            .probe_reachable(address)
            .await?
            .group
            .and_then(|v| v.primary().map(|m| m.address.clone()));
        self.commit(move |group| {
            if primary.is_some() {
                group.primary = primary.clone();
            }
            Ok(())
        })
        .await?;

        tracing::info!("Quorum of '{}' restored using the partition of '{}'", self.name, address);
        Ok(())
    }

    async fn switch_mode_locked(&self, mode: GroupMode, primary: Option<&InstanceAddress>) -> Result<()> {
        let group = self.record().await?;
        if group.is_replica_set() {
            return Err(TopologyError::Validation("Replicasets have no topology mode to switch".to_string()));
        }
        if let Some(domain) = &group.federation {
            return Err(TopologyError::Validation(format!(
                "Cluster '{}' is a member of ClusterSet '{}' and must stay in Single-Primary mode",
                self.name, domain
            )));
        }
        if group.mode() == Some(mode) {
            return Err(TopologyError::Validation(format!(
                "Cluster '{}' is already in {} mode",
                self.name, mode
            )));
        }
        if mode == GroupMode::MultiPrimary && primary.is_some() {
            return Err(TopologyError::Validation("A PRIMARY can only be chosen for Single-Primary mode".to_string()));
        }

        let view = self.engine.observe(&group).await;
        if !view.has_quorum() {
            return Err(TopologyError::Quorum(format!(
                "There is no quorum to perform the operation on '{}'",
                self.name
            )));
        }
        let online = view.online_voters();
        if let Some(p) = primary {
            if !online.contains(p) {
                return Err(TopologyError::Validation(format!(
                    "The instance '{}' is not an ONLINE member of '{}'",
                    p, self.name
                )));
            }
        }
        let executor = online
            .first()
            .cloned()
            .ok_or_else(|| TopologyError::Quorum(format!("Cluster '{}' has no ONLINE member", self.name)))?;

        self.engine
            .execute(
                &executor,
                ReplicationCommand::SwitchMode {
                    mode,
                    primary: primary.cloned(),
                },
            )
            .await?;

        let new_primary = self
            .engine
            .evaluator
            .probe_reachable(&executor)
            .await?
            .group
            .and_then(|v| v.primary().map(|m| m.address.clone()));
        self.commit(move |group| {
            group.kind = GroupKind::Replicated { mode };
            group.primary = new_primary.clone();
            Ok(())
        })
        .await?;

        tracing::info!("Cluster '{}' switched to {} mode", self.name, mode);
        Ok(())
    }
}
