//! Admitting instances: group members, read replicas and replica-set replicas

use super::{
    cluster_account, instance_record, parse_address, read_replica_account, replica_set_account, Cluster,
};
use crate::address::InstanceAddress;
use crate::config::SslMode;
use crate::connector::{InstanceProbe, ReplicationCommand, READ_REPLICA_CHANNEL, REPLICASET_CHANNEL};
use crate::error::{Result, TopologyError};
use crate::gtid::{assess, choose_recovery, RecoveryMethod};
use crate::membership::TopologyView;
use crate::metadata::{GroupRecord, InstanceRole, ReplicationSources};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddInstanceOptions {
    /// Defaults to the configured recovery method
    pub recovery_method: Option<RecoveryMethod>,
    pub label: Option<String>,
    pub priority: Option<u32>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddReplicaOptions {
    /// Defaults to the primary
    pub replication_sources: Option<ReplicationSources>,
    pub recovery_method: Option<RecoveryMethod>,
    pub label: Option<String>,
    pub dry_run: bool,
}

/// TLS requirement of the group as seen by a joining instance
fn check_ssl(group: &GroupRecord, donor: Option<&InstanceProbe>, probe: &InstanceProbe) -> Result<()> {
    let required = match group.options.ssl_mode {
        SslMode::Required => true,
        SslMode::Disabled => false,
        SslMode::Auto => donor.map(|d| d.ssl_capable).unwrap_or(false),
    };
    if required && !probe.ssl_capable {
        return Err(TopologyError::Validation(format!(
            "Instance '{}' does not support TLS and cannot join cluster '{}' which requires memberSslMode REQUIRED",
            probe.address, group.name
        )));
    }
    Ok(())
}

impl Cluster {
    /// Add an instance to the cluster.
    ///
    /// For a replicated group the instance joins as a voting member; for a
    /// replica set it becomes an async replica of the primary.
    pub async fn add_instance(&self, address: &str, options: AddInstanceOptions) -> Result<()> {
        let address = parse_address(address)?;
        self.run("addInstance", async {
            let locks = self
                .engine
                .lock(self.member_locks(&address), "addInstance", options.dry_run)
                .await?;
            let result = self.add_locked(&address, &options).await;
            locks.release().await;
            result
        })
        .await
    }

    /// Attach a read replica fed by an async channel from the group
    pub async fn add_replica_instance(&self, address: &str, options: AddReplicaOptions) -> Result<()> {
        let address = parse_address(address)?;
        self.run("addReplicaInstance", async {
            let locks = self
                .engine
                .lock(self.member_locks(&address), "addReplicaInstance", options.dry_run)
                .await?;
            let result = self.add_read_replica_locked(&address, &options).await;
            locks.release().await;
            result
        })
        .await
    }

    /// Common admission checks; returns the group, its live view and the instance probe
    async fn admission(&self, address: &InstanceAddress) -> Result<(GroupRecord, TopologyView, InstanceProbe)> {
        let group = self.record().await?;
        if group.instances.contains_key(address) {
            return Err(TopologyError::Validation(format!(
                "The instance '{}' is already part of this cluster.",
                address
            )));
        }
        let document = self.engine.store.read_topology().await?;
        if let Some(owner) = document.group_of_instance(address) {
            return Err(TopologyError::Validation(format!(
                "The instance '{}' is already part of the cluster '{}'.",
                address, owner
            )));
        }

        let view = self.engine.observe(&group).await;
        if !view.has_quorum() {
            let message = if group.is_replica_set() {
                format!("The PRIMARY instance of replicaset '{}' is not available", self.name)
            } else {
                format!("There is no quorum to perform the operation on cluster '{}'", self.name)
            };
            return Err(TopologyError::Quorum(message));
        }

        let probe = self.engine.evaluator.probe_reachable(address).await?;
        if let Some(other) = &probe.group {
            return Err(TopologyError::Validation(format!(
                "The instance '{}' is already part of replication group {}",
                address, other.group_name
            )));
        }
        Ok((group, view, probe))
    }

    async fn add_locked(&self, address: &InstanceAddress, options: &AddInstanceOptions) -> Result<()> {
        let (group, view, probe) = self.admission(address).await?;
        if group.is_replica_set() {
            return self.add_replica_set_member(&group, &view, &probe, options).await;
        }

        let donor = self
            .engine
            .donor(&view)
            .ok_or_else(|| TopologyError::Quorum(format!("No ONLINE member of '{}' can act as donor", self.name)))?;
        let donor_probe = view
            .probe(&donor)
            .ok_or_else(|| TopologyError::connectivity(&donor, "donor is not reachable"))?;
        check_ssl(&group, view.primary_probe().or(Some(donor_probe)), &probe)?;

        let assessment = assess(&probe.gtid_executed, &view.group_executed(), &donor_probe.gtid_purged);
        let requested = options
            .recovery_method
            .unwrap_or(self.engine.config.defaults.recovery_method);
        let recovery = choose_recovery(&address.to_string(), &assessment, requested, group.options.disable_clone)?;

        if options.dry_run {
            tracing::info!(
                "Dry run: '{}' would join cluster '{}' using {} recovery from {}",
                address,
                self.name,
                recovery,
                donor
            );
            return Ok(());
        }

        let account = cluster_account(probe.server_id);
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
                        recovery_account: account.clone(),
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
            tracing::warn!("Instance {} failed to join cluster '{}', reverting: {}", address, self.name, e);
            self.engine.execute_best_effort(address, ReplicationCommand::LeaveGroup).await;
            self.engine
                .execute_best_effort(&donor, ReplicationCommand::DropReplicationAccount { user: account })
                .await;
            return Err(e);
        }

        let priority = options.priority.unwrap_or(self.engine.config.defaults.member_priority);
        let record = instance_record(&probe, InstanceRole::Ha, account, options.label.clone(), priority);
        self.commit(move |group| {
            group.instances.insert(record.address.clone(), record.clone());
            Ok(())
        })
        .await?;

        tracing::info!("Instance '{}' added to cluster '{}' ({} recovery)", address, self.name, recovery);
        Ok(())
    }

    async fn add_replica_set_member(
        &self,
        group: &GroupRecord,
        view: &TopologyView,
        probe: &InstanceProbe,
        options: &AddInstanceOptions,
    ) -> Result<()> {
        let address = &probe.address;
        let primary = view
            .primary
            .clone()
            .ok_or_else(|| TopologyError::Quorum(format!("Replicaset '{}' has no PRIMARY", self.name)))?;
        let primary_probe = view
            .probe(&primary)
            .ok_or_else(|| TopologyError::connectivity(&primary, "PRIMARY is not reachable"))?;

        let assessment = assess(&probe.gtid_executed, &primary_probe.gtid_executed, &primary_probe.gtid_purged);
        let requested = options
            .recovery_method
            .unwrap_or(self.engine.config.defaults.recovery_method);
        let recovery = choose_recovery(&address.to_string(), &assessment, requested, group.options.disable_clone)?;

        if options.dry_run {
            tracing::info!(
                "Dry run: '{}' would replicate from {} in replicaset '{}' ({} recovery)",
                address,
                primary,
                self.name,
                recovery
            );
            return Ok(());
        }

        let account = replica_set_account(probe.server_id);
        self.engine
            .execute(
                &primary,
                ReplicationCommand::CreateReplicationAccount {
                    user: account.clone(),
                    host: group.options.replication_allowed_host.clone(),
                },
            )
            .await?;

        let attached = self
            .engine
            .attach_channel(
                address,
                REPLICASET_CHANNEL,
                &primary,
                &account,
                recovery == RecoveryMethod::Clone,
                &self.cancel,
            )
            .await;
        if let Err(e) = attached {
            tracing::warn!("Replica {} failed to attach to {}, reverting: {}", address, primary, e);
            self.revert_channel(address, REPLICASET_CHANNEL, &primary, &account).await;
            return Err(e);
        }

        let priority = options.priority.unwrap_or(self.engine.config.defaults.member_priority);
        let record = instance_record(probe, InstanceRole::Ha, account, options.label.clone(), priority);
        self.commit(move |group| {
            group.instances.insert(record.address.clone(), record.clone());
            Ok(())
        })
        .await?;

        tracing::info!("Instance '{}' added to replicaset '{}'", address, self.name);
        Ok(())
    }

    async fn add_read_replica_locked(&self, address: &InstanceAddress, options: &AddReplicaOptions) -> Result<()> {
        let (group, view, probe) = self.admission(address).await?;
        if group.is_replica_set() {
            return Err(TopologyError::Validation(
                "Read replicas can only be added to a cluster; use add_instance() on a replicaset".to_string(),
            ));
        }

        let sources = options
            .replication_sources
            .clone()
            .unwrap_or(ReplicationSources::Primary);
        let source = self.engine.resolve_source(&group, &view, &sources)?;
        let source_probe = view
            .probe(&source)
            .ok_or_else(|| TopologyError::connectivity(&source, "replication source is not reachable"))?;

        let assessment = assess(&probe.gtid_executed, &source_probe.gtid_executed, &source_probe.gtid_purged);
        let requested = options
            .recovery_method
            .unwrap_or(self.engine.config.defaults.recovery_method);
        let recovery = choose_recovery(&address.to_string(), &assessment, requested, group.options.disable_clone)?;

        if options.dry_run {
            tracing::info!(
                "Dry run: '{}' would be added as read replica of {} ({} recovery)",
                address,
                source,
                recovery
            );
            return Ok(());
        }

        let account = read_replica_account(probe.server_id);
        self.engine
            .execute(
                &source,
                ReplicationCommand::CreateReplicationAccount {
                    user: account.clone(),
                    host: group.options.replication_allowed_host.clone(),
                },
            )
            .await?;

        let attached = self
            .engine
            .attach_channel(
                address,
                READ_REPLICA_CHANNEL,
                &source,
                &account,
                recovery == RecoveryMethod::Clone,
                &self.cancel,
            )
            .await;
        if let Err(e) = attached {
            tracing::warn!("Read replica {} failed to attach to {}, reverting: {}", address, source, e);
            self.revert_channel(address, READ_REPLICA_CHANNEL, &source, &account).await;
            return Err(e);
        }

        let mut record = instance_record(
            &probe,
            InstanceRole::ReadReplica,
            account,
            options.label.clone(),
            self.engine.config.defaults.member_priority,
        );
        record.replication_sources = Some(sources);
        self.commit(move |group| {
            group.instances.insert(record.address.clone(), record.clone());
            Ok(())
        })
        .await?;

        tracing::info!("Read replica '{}' added to cluster '{}' from {}", address, self.name, source);
        Ok(())
    }

    async fn revert_channel(&self, address: &InstanceAddress, channel: &str, source: &InstanceAddress, account: &str) {
        if let Err(e) = self.engine.detach_channel(address, channel).await {
            tracing::warn!("Could not reset channel on {}: {}", address, e);
        }
        self.engine
            .execute_best_effort(
                source,
                ReplicationCommand::DropReplicationAccount {
                    user: account.to_string(),
                },
            )
            .await;
    }
}
