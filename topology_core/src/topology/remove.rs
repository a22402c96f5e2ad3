//! Evicting instances

use super::{parse_address, Cluster};
use crate::address::InstanceAddress;
use crate::connector::{GroupMode, ReplicationCommand, READ_REPLICA_CHANNEL, REPLICASET_CHANNEL};
use crate::error::{Result, TopologyError};
use crate::gtid::{unreplicated, GtidSet};
use crate::membership::{InstanceStatus, TopologyView};
use crate::metadata::{GroupRecord, InstanceRecord, ReplicationSources};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoveInstanceOptions {
    /// Remove even if the instance is unreachable, unhealthy or not caught up
    pub force: bool,
    pub dry_run: bool,
}

/// Channel an instance replicates through, if it is not a group member
pub(crate) fn inbound_channel(group: &GroupRecord, record: &InstanceRecord) -> Option<&'static str> {
    if group.is_replica_set() {
        Some(REPLICASET_CHANNEL)
    } else if !record.is_voter() {
        Some(READ_REPLICA_CHANNEL)
    } else {
        None
    }
}

fn is_primary(group: &GroupRecord, view: &TopologyView, address: &InstanceAddress) -> bool {
    if group.is_replica_set() {
        group.primary.as_ref() == Some(address)
    } else {
        group.mode() == Some(GroupMode::SinglePrimary) && view.primary.as_ref() == Some(address)
    }
}

impl Cluster {
    /// Remove an instance from the cluster and drop its replication account
    pub async fn remove_instance(&self, address: &str, options: RemoveInstanceOptions) -> Result<()> {
        let address = parse_address(address)?;
        self.run("removeInstance", async {
            let locks = self
                .engine
                .lock(self.member_locks(&address), "removeInstance", options.dry_run)
                .await?;
            let result = self.remove_locked(&address, &options).await;
            locks.release().await;
            result
        })
        .await
    }

    async fn remove_locked(&self, address: &InstanceAddress, options: &RemoveInstanceOptions) -> Result<()> {
        let group = self.record().await?;
        let record = group.instances.get(address).cloned().ok_or_else(|| {
            TopologyError::Validation(format!("The instance '{}' does not belong to the cluster '{}'.", address, self.name))
        })?;

        let view = self.engine.observe(&group).await;
        if is_primary(&group, &view, address) {
            return Err(TopologyError::Validation(format!(
                "PRIMARY instance cannot be removed from '{}'. Use set_primary_instance() to promote another instance first.",
                self.name
            )));
        }
        if record.is_voter() && group.voters().count() == 1 {
            return Err(TopologyError::Validation(format!(
                "The instance '{}' is the last member of '{}'; use dissolve() instead.",
                address, self.name
            )));
        }
        if !view.has_quorum() {
            return Err(TopologyError::Quorum(format!(
                "There is no quorum to perform the operation on '{}'",
                self.name
            )));
        }

        let channel = inbound_channel(&group, &record);
        let live = match view.probe(address).cloned() {
            None => {
                if !options.force {
                    return Err(TopologyError::connectivity(
                        address,
                        "the instance is not reachable. Use the force option to remove it from the metadata only.",
                    ));
                }
                self.engine
                    .forced("removeInstance", &address.to_string(), "instance unreachable, only its metadata is removed");
                false
            }
            Some(probe) => {
                let status = view.status_of(address).unwrap_or(InstanceStatus::Unreachable);
                let healthy = matches!(status, InstanceStatus::Online | InstanceStatus::Recovering);
                if !healthy {
                    if !options.force {
                        return Err(TopologyError::Replication {
                            address: address.to_string(),
                            message: format!(
                                "replication is stopped or failing on the instance (status {}). Use the force option to remove it anyway.",
                                status
                            ),
                        });
                    }
                    self.engine.forced(
                        "removeInstance",
                        &address.to_string(),
                        &format!("replication on the instance is not healthy (status {})", status),
                    );
                }

                let others: Vec<&GtidSet> = view
                    .probes
                    .iter()
                    .filter(|(a, _)| *a != address)
                    .filter_map(|(_, p)| p.as_ref().ok())
                    .map(|p| &p.gtid_executed)
                    .collect();
                let extra = unreplicated(&probe.gtid_executed, &others);
                if !extra.is_empty() {
                    if !options.force {
                        return Err(TopologyError::Consistency(format!(
                            "The instance '{}' has transactions '{}' that were not replicated to any other member. Use the force option to remove it anyway.",
                            address, extra
                        )));
                    }
                    self.engine.forced(
                        "removeInstance",
                        &address.to_string(),
                        &format!("unreplicated transactions '{}' will be lost", extra),
                    );
                }

                if healthy && !options.dry_run {
                    self.sync_before_removal(&group, &view, address, options.force).await?;
                }
                true
            }
        };

        if options.dry_run {
            tracing::info!("Dry run: '{}' would be removed from '{}'", address, self.name);
            return Ok(());
        }

        if live {
            let outcome = match channel {
                Some(channel) => self.engine.detach_channel(address, channel).await,
                None => self.engine.execute(address, ReplicationCommand::LeaveGroup).await,
            };
            match outcome {
                Ok(()) => {}
                Err(e) if options.force => {
                    self.engine.forced(
                        "removeInstance",
                        &address.to_string(),
                        &format!("failed to stop replication on the instance: {}", e),
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(primary) = self.engine.donor(&view).or_else(|| group.primary.clone()) {
            self.engine
                .execute_best_effort(
                    &primary,
                    ReplicationCommand::DropReplicationAccount {
                        user: record.recovery_account.clone(),
                    },
                )
                .await;
        }

        let removed = address.clone();
        self.commit(move |group| {
            group.instances.remove(&removed);
            for replica in group.instances.values_mut() {
                if let Some(ReplicationSources::Custom(list)) = replica.replication_sources.as_mut() {
                    list.retain(|a| a != &removed);
                    if list.is_empty() {
                        replica.replication_sources = Some(ReplicationSources::Primary);
                    }
                }
            }
            Ok(())
        })
        .await?;

        tracing::info!("Instance '{}' removed from '{}'", address, self.name);
        Ok(())
    }

    /// Wait for the leaving instance to apply everything the group has executed
    async fn sync_before_removal(
        &self,
        group: &GroupRecord,
        view: &TopologyView,
        address: &InstanceAddress,
        force: bool,
    ) -> Result<()> {
        let target = if group.is_replica_set() {
            view.primary_probe().map(|p| p.gtid_executed.clone()).unwrap_or_default()
        } else {
            view.group_executed()
        };
        match self
            .engine
            .wait_for_transactions(address, &target, self.engine.config.sync_timeout(), &self.cancel)
            .await
        {
            Ok(()) => Ok(()),
            Err(e @ TopologyError::Timeout { .. }) if force => {
                self.engine.forced(
                    "removeInstance",
                    &address.to_string(),
                    &format!("instance did not catch up before removal: {}", e),
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
