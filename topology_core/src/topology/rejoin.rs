//! Bringing a registered instance back into its group

use super::remove::inbound_channel;
use super::{parse_address, Cluster};
use crate::address::InstanceAddress;
use crate::connector::{InstanceProbe, ReplicationCommand};
use crate::error::{Result, TopologyError};
use crate::gtid::{assess, choose_recovery, GtidAssessment, RecoveryMethod};
use crate::membership::{InstanceStatus, TopologyView};
use crate::metadata::{GroupRecord, InstanceRecord, ReplicationSources};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RejoinOptions {
    pub recovery_method: Option<RecoveryMethod>,
    /// Overwrite an incompatible transaction set with a clone
    pub force: bool,
    pub dry_run: bool,
}

impl Cluster {
    /// Rejoin a registered instance that left or was expelled
    pub async fn rejoin_instance(&self, address: &str, options: RejoinOptions) -> Result<()> {
        let address = parse_address(address)?;
        self.run("rejoinInstance", async {
            let locks = self
                .engine
                .lock(self.member_locks(&address), "rejoinInstance", options.dry_run)
                .await?;
            let result = self.rejoin_locked(&address, &options).await;
            locks.release().await;
            result
        })
        .await
    }

    /// Pick the recovery method, accepting an incompatible set only under force
    fn rejoin_recovery(
        &self,
        group: &GroupRecord,
        address: &InstanceAddress,
        assessment: &GtidAssessment,
        options: &RejoinOptions,
    ) -> Result<RecoveryMethod> {
        let requested = options
            .recovery_method
            .unwrap_or(self.engine.config.defaults.recovery_method);
        match choose_recovery(&address.to_string(), assessment, requested, group.options.disable_clone) {
            Ok(method) => Ok(method),
            Err(e) if options.force && !group.options.disable_clone && !assessment.is_compatible() => {
                self.engine.forced(
                    "rejoinInstance",
                    &address.to_string(),
                    &format!("incompatible transaction set overwritten by clone ({})", e),
                );
                Ok(RecoveryMethod::Clone)
            }
            Err(e) => Err(e),
        }
    }

    async fn rejoin_locked(&self, address: &InstanceAddress, options: &RejoinOptions) -> Result<()> {
        let group = self.record().await?;
        let record = group.instances.get(address).cloned().ok_or_else(|| {
            TopologyError::Validation(format!(
                "The instance '{}' does not belong to the cluster '{}'. Use add_instance() to add it.",
                address, self.name
            ))
        })?;

        let view = self.engine.observe(&group).await;
        if !view.has_quorum() {
            return Err(TopologyError::Quorum(format!(
                "There is no quorum to perform the operation on '{}'",
                self.name
            )));
        }
        let probe = self.engine.evaluator.probe_reachable(address).await?;
        if matches!(
            view.status_of(address),
            Some(InstanceStatus::Online) | Some(InstanceStatus::Recovering)
        ) {
            return Err(TopologyError::Validation(format!(
                "The instance '{}' is already an active member of '{}'.",
                address, self.name
            )));
        }

        match inbound_channel(&group, &record) {
            Some(channel) => self.rejoin_channel(&group, &view, &record, &probe, channel, options).await?,
            None => self.rejoin_group(&group, &view, &probe, options).await?,
        }

        if options.dry_run {
            return Ok(());
        }
        let rejoined = address.clone();
        self.commit(move |group| {
            if let Some(instance) = group.instances.get_mut(&rejoined) {
                instance.invalidated = false;
            }
            Ok(())
        })
        .await?;

        tracing::info!("Instance '{}' rejoined '{}'", address, self.name);
        Ok(())
    }

    async fn rejoin_group(
        &self,
        group: &GroupRecord,
        view: &TopologyView,
        probe: &InstanceProbe,
        options: &RejoinOptions,
    ) -> Result<()> {
        let address = &probe.address;
        if let Some(other) = &probe.group {
            if other.group_name != group.group_id {
                return Err(TopologyError::Validation(format!(
                    "The instance '{}' belongs to a different replication group ({})",
                    address, other.group_name
                )));
            }
        }

        let donor = self
            .engine
            .donor(view)
            .ok_or_else(|| TopologyError::Quorum(format!("No ONLINE member of '{}' can act as donor", self.name)))?;
        let donor_probe = view
            .probe(&donor)
            .ok_or_else(|| TopologyError::connectivity(&donor, "donor is not reachable"))?;
        let assessment = assess(&probe.gtid_executed, &view.group_executed(), &donor_probe.gtid_purged);
        let recovery = self.rejoin_recovery(group, address, &assessment, options)?;

        if options.dry_run {
            tracing::info!("Dry run: '{}' would rejoin '{}' using {} recovery", address, self.name, recovery);
            return Ok(());
        }

        if probe.group.is_some() {
            self.engine.execute(address, ReplicationCommand::LeaveGroup).await?;
        }
        let account = group
            .instances
            .get(address)
            .map(|r| r.recovery_account.clone())
            .unwrap_or_default();
        self.engine
            .execute(
                &donor,
                ReplicationCommand::CreateReplicationAccount {
                    user: account.clone(),
                    host: group.options.replication_allowed_host.clone(),
                },
            )
            .await?;

        let joined = async {
            self.engine
                .execute(
                    address,
                    ReplicationCommand::JoinGroup {
                        group_name: group.group_id.clone(),
                        seeds: view.online_voters(),
                        donor: donor.clone(),
                        recovery,
                        recovery_account: account,
                        settings: group.options.settings(),
                    },
                )
                .await?;
            self.engine
                .wait_for_online(address, self.engine.config.member_online_timeout(), &self.cancel)
                .await
        }
        .await;

        if let Err(e) = joined {
            tracing::warn!("Rejoin of {} failed, leaving the group again: {}", address, e);
            self.engine.execute_best_effort(address, ReplicationCommand::LeaveGroup).await;
            return Err(e);
        }
        Ok(())
    }

    async fn rejoin_channel(
        &self,
        group: &GroupRecord,
        view: &TopologyView,
        record: &InstanceRecord,
        probe: &InstanceProbe,
        channel: &str,
        options: &RejoinOptions,
    ) -> Result<()> {
        let address = &probe.address;
        let source = if group.is_replica_set() {
            view.primary
                .clone()
                .ok_or_else(|| TopologyError::Quorum(format!("Replicaset '{}' has no PRIMARY", self.name)))?
        } else {
            let sources = record
                .replication_sources
                .clone()
                .unwrap_or(ReplicationSources::Primary);
            self.engine.resolve_source(group, view, &sources)?
        };
        let source_probe = view
            .probe(&source)
            .ok_or_else(|| TopologyError::connectivity(&source, "replication source is not reachable"))?;

        let assessment = assess(&probe.gtid_executed, &source_probe.gtid_executed, &source_probe.gtid_purged);
        let recovery = self.rejoin_recovery(group, address, &assessment, options)?;

        if options.dry_run {
            tracing::info!("Dry run: '{}' would resume replicating from {}", address, source);
            return Ok(());
        }

        self.engine
            .execute(
                &source,
                ReplicationCommand::CreateReplicationAccount {
                    user: record.recovery_account.clone(),
                    host: group.options.replication_allowed_host.clone(),
                },
            )
            .await?;
        self.engine.detach_channel(address, channel).await?;
        self.engine
            .attach_channel(
                address,
                channel,
                &source,
                &record.recovery_account,
                recovery == RecoveryMethod::Clone,
                &self.cancel,
            )
            .await
    }
}
