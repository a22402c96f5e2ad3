//! Tearing a cluster down

use super::remove::inbound_channel;
use super::Cluster;
use crate::address::InstanceAddress;
use crate::connector::ReplicationCommand;
use crate::error::{MemberFailure, Result, TopologyError};
use crate::membership::{InstanceStatus, TopologyView};
use crate::metadata::{GroupRecord, RouterScope, TopologyScope};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DissolveOptions {
    /// Proceed past unreachable members and failed steps
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DissolveReport {
    /// Instances whose replication was stopped
    pub removed: Vec<InstanceAddress>,
    pub failures: Vec<MemberFailure>,
}

impl Cluster {
    /// Stop replication on every member and delete the cluster's metadata.
    ///
    /// The handle is unusable afterwards: every further call fails with
    /// [`TopologyError::Dissolved`].
    pub async fn dissolve(&self, options: DissolveOptions) -> Result<DissolveReport> {
        self.run("dissolve", async {
            let locks = self.engine.lock(vec![self.group_lock()], "dissolve", false).await?;
            let result = self.dissolve_locked(&options).await;
            locks.release().await;
            result
        })
        .await
    }

    async fn dissolve_locked(&self, options: &DissolveOptions) -> Result<DissolveReport> {
        let group = self.record().await?;
        if let Some(domain) = &group.federation {
            return Err(TopologyError::Validation(format!(
                "The cluster '{}' is a member of the clusterset '{}'; remove it from the clusterset first.",
                self.name, domain
            )));
        }

        let view = self.engine.observe(&group).await;
        let absent: Vec<String> = view
            .members
            .values()
            .filter(|m| m.status != InstanceStatus::Online && m.status != InstanceStatus::Invalidated)
            .map(|m| format!("{} ({})", m.address, m.status))
            .collect();
        if !absent.is_empty() {
            if !options.force {
                return Err(TopologyError::Connectivity {
                    address: absent.join(", "),
                    message: "the instances are not ONLINE and cannot be removed cleanly. Use the force option to dissolve anyway.".to_string(),
                });
            }
            self.engine
                .forced("dissolve", &self.name, &format!("members not ONLINE: {}", absent.join(", ")));
        }

        let mut report = DissolveReport::default();
        self.sync_all(&view, options, &mut report).await?;
        self.stop_replication(&group, &view, &mut report).await;

        let name = self.name.clone();
        self.engine
            .store
            .write_topology(TopologyScope::Group(name.clone()), None, move |document| {
                document.groups.remove(&name);
                document
                    .routers
                    .retain(|_, r| !(r.scope == RouterScope::Group && r.target == name));
                Ok(())
            })
            .await?;
        self.mark_dissolved();

        if report.failures.is_empty() || options.force {
            tracing::info!(
                "Cluster '{}' dissolved; {} instance(s) stopped, {} failure(s)",
                self.name,
                report.removed.len(),
                report.failures.len()
            );
            Ok(report)
        } else {
            Err(TopologyError::PartialFailure {
                operation: "dissolve".to_string(),
                failures: report.failures,
            })
        }
    }

    /// Let every online member apply what the primary has before stopping it
    async fn sync_all(&self, view: &TopologyView, options: &DissolveOptions, report: &mut DissolveReport) -> Result<()> {
        let target = view
            .primary_probe()
            .map(|p| p.gtid_executed.clone())
            .unwrap_or_else(|| view.group_executed());
        let mut lagging = Vec::new();
        for member in view.members.values().filter(|m| m.status == InstanceStatus::Online) {
            if let Err(e) = self
                .engine
                .wait_for_transactions(&member.address, &target, self.engine.config.sync_timeout(), &self.cancel)
                .await
            {
                lagging.push(MemberFailure::new(&member.address, e));
            }
        }
        if lagging.is_empty() {
            return Ok(());
        }
        if !options.force {
            return Err(TopologyError::PartialFailure {
                operation: "dissolve".to_string(),
                failures: lagging,
            });
        }
        for failure in &lagging {
            self.engine
                .forced("dissolve", &failure.address, &format!("did not catch up: {}", failure.reason));
        }
        report.failures.extend(lagging);
        Ok(())
    }

    /// Replicas and secondaries first, the primary last
    async fn stop_replication(&self, group: &GroupRecord, view: &TopologyView, report: &mut DissolveReport) {
        let mut order: Vec<(&InstanceAddress, bool)> = group
            .instances
            .values()
            .filter(|r| view.is_reachable(&r.address))
            .map(|r| (&r.address, view.primary.as_ref() == Some(&r.address)))
            .collect();
        order.sort_by_key(|(address, is_primary)| {
            let replica = group.instances.get(*address).map(|r| !r.is_voter()).unwrap_or(false);
            (*is_primary, !replica)
        });

        for (address, _) in order {
            let Some(record) = group.instances.get(address) else {
                continue;
            };
            let outcome = match inbound_channel(group, record) {
                Some(channel) => self.engine.detach_channel(address, channel).await,
                None => self.engine.execute(address, ReplicationCommand::LeaveGroup).await,
            };
            match outcome {
                Ok(()) => {
                    if group.is_replica_set() {
                        self.engine
                            .execute_best_effort(address, ReplicationCommand::SetSuperReadOnly(false))
                            .await;
                    }
                    report.removed.push(address.clone());
                }
                Err(e) => {
                    tracing::warn!("Could not stop replication on {}: {}", address, e);
                    report.failures.push(MemberFailure::new(address, e));
                }
            }
            self.engine
                .execute_best_effort(
                    address,
                    ReplicationCommand::DropReplicationAccount {
                        user: record.recovery_account.clone(),
                    },
                )
                .await;
        }
    }
}
