//! Recovery from a complete outage and metadata reconciliation

use super::{cluster_account, instance_record, parse_address, Cluster, TopologyEngine};
use crate::address::InstanceAddress;
use crate::connector::{InstanceProbe, MemberState, ReplicationCommand, ACTION_DISABLE_READ_ONLY_IF_PRIMARY};
use crate::error::{MemberFailure, Result, TopologyError};
use crate::gtid::{assess, compare, GtidRelation, RecoveryMethod};
use crate::membership::{rank_candidates, Candidate, InstanceStatus};
use crate::metadata::{FederationRole, GroupKind, GroupRecord, InstanceRole};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebootOptions {
    /// Accept unreachable members, an empty or divergent seed
    pub force: bool,
    /// Members to rejoin after the seed is up; all reachable members when `None`
    pub rejoin_instances: Option<Vec<String>>,
    /// Explicit seed
    pub primary: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebootReport {
    pub seed: InstanceAddress,
    pub rejoined: Vec<InstanceAddress>,
    /// Members that were not rejoined, with the reason
    pub skipped: Vec<MemberFailure>,
    pub unreachable: Vec<InstanceAddress>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RescanOptions {
    pub add_unmanaged: bool,
    pub remove_obsolete: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RescanReport {
    /// Members of the live group missing from the metadata
    pub unmanaged: Vec<InstanceAddress>,
    /// Registered members no longer in the live group
    pub obsolete: Vec<InstanceAddress>,
    pub added: Vec<InstanceAddress>,
    pub removed: Vec<InstanceAddress>,
    /// Set when the registered topology mode differed from the live one
    pub mode_updated: bool,
}

impl TopologyEngine {
    /// Restart a cluster whose members are all offline or unreachable
    pub async fn reboot_cluster_from_complete_outage(&self, name: &str, options: RebootOptions) -> Result<RebootReport> {
        let cluster = Cluster::new(self.inner().clone(), name);
        cluster
            .run("rebootClusterFromCompleteOutage", async {
                let locks = cluster
                    .engine
                    .lock(vec![cluster.group_lock()], "rebootClusterFromCompleteOutage", options.dry_run)
                    .await?;
                let result = cluster.reboot_locked(&options).await;
                locks.release().await;
                result
            })
            .await
    }
}

impl Cluster {
    fn choose_seed(&self, reachable: &[(InstanceAddress, InstanceProbe)], group: &GroupRecord, options: &RebootOptions) -> Result<InstanceAddress> {
        let candidates: Vec<Candidate> = reachable
            .iter()
            .map(|(address, probe)| Candidate {
                address: address.clone(),
                gtid_executed: probe.gtid_executed.clone(),
                priority: group.instances.get(address).map(|r| r.priority).unwrap_or(u32::MAX),
                server_id: probe.server_id,
            })
            .collect();

        if let Some(requested) = &options.primary {
            let requested = parse_address(requested)?;
            let candidate = candidates.iter().find(|c| c.address == requested).ok_or_else(|| {
                TopologyError::Validation(format!(
                    "The requested seed '{}' is not a reachable member of '{}'",
                    requested, self.name
                ))
            })?;
            for other in candidates.iter().filter(|c| c.address != requested) {
                match compare(&candidate.gtid_executed, &other.gtid_executed) {
                    GtidRelation::Equal | GtidRelation::ASuperset => {}
                    relation if options.force => self.engine.forced(
                        "rebootClusterFromCompleteOutage",
                        &requested.to_string(),
                        &format!("seed has an incompatible GTID set with '{}' ({:?})", other.address, relation),
                    ),
                    _ => {
                        return Err(TopologyError::Consistency(format!(
                            "The instance '{}' has an incompatible GTID set with '{}' and cannot be used as seed; the most up-to-date instance should be used",
                            requested, other.address
                        )))
                    }
                }
            }
            return Ok(requested);
        }

        match rank_candidates(candidates.clone()) {
            Ok(ranked) => ranked
                .into_iter()
                .next()
                .map(|c| c.address)
                .ok_or_else(|| TopologyError::Quorum("No reachable member can seed the cluster".to_string())),
            Err(e) if options.force => {
                let best = candidates
                    .iter()
                    .max_by(|a, b| {
                        a.gtid_executed
                            .count()
                            .cmp(&b.gtid_executed.count())
                            .then(b.priority.cmp(&a.priority))
                            .then(b.address.cmp(&a.address))
                    })
                    .map(|c| c.address.clone())
                    .ok_or(e)?;
                self.engine.forced(
                    "rebootClusterFromCompleteOutage",
                    &best.to_string(),
                    "members have an incompatible GTID set; the largest set was chosen as seed",
                );
                Ok(best)
            }
            Err(e) => Err(TopologyError::Consistency(format!(
                "The members of '{}' have an incompatible GTID set: {}",
                self.name, e
            ))),
        }
    }

    async fn reboot_locked(&self, options: &RebootOptions) -> Result<RebootReport> {
        let group = self.record().await?;
        if group.is_replica_set() {
            return Err(TopologyError::Validation(
                "rebootClusterFromCompleteOutage() is not available for replicasets; use force_primary_instance()"
                    .to_string(),
            ));
        }

        let voters: Vec<InstanceAddress> = group.voters().filter(|r| !r.invalidated).map(|r| r.address.clone()).collect();
        let probes = self.engine.evaluator.probe_all(&voters).await;

        if let Some((address, _)) = probes.iter().find(|(_, p)| {
            p.as_ref()
                .map(|p| p.view_of(&group.group_id).is_some() && p.member_state == MemberState::Online)
                .unwrap_or(false)
        }) {
            return Err(TopologyError::Validation(format!(
                "The cluster '{}' is not in a complete outage: instance '{}' is still ONLINE. \
                 Use rejoin_instance() or force_quorum_using_partition_of() instead.",
                self.name, address
            )));
        }

        let unreachable: Vec<InstanceAddress> = probes
            .iter()
            .filter(|(_, p)| p.is_err())
            .map(|(a, _)| a.clone())
            .collect();
        if !unreachable.is_empty() {
            let names: Vec<String> = unreachable.iter().map(|a| a.to_string()).collect();
            if !options.force {
                return Err(TopologyError::Connectivity {
                    address: names.join(", "),
                    message: "the members are unreachable and their transaction sets cannot be compared. Use the force option to reboot without them.".to_string(),
                });
            }
            self.engine.forced(
                "rebootClusterFromCompleteOutage",
                &self.name,
                &format!("unreachable members {} were not considered as seed", names.join(", ")),
            );
        }

        let reachable: Vec<(InstanceAddress, InstanceProbe)> = probes
            .into_iter()
            .filter_map(|(a, p)| p.ok().map(|p| (a, p)))
            .collect();
        if reachable.is_empty() {
            return Err(TopologyError::Connectivity {
                address: self.name.clone(),
                message: "no registered member of the cluster is reachable".to_string(),
            });
        }

        let seed = self.choose_seed(&reachable, &group, options)?;
        let seed_probe = reachable
            .iter()
            .find(|(a, _)| a == &seed)
            .map(|(_, p)| p.clone())
            .ok_or_else(|| TopologyError::connectivity(&seed, "seed is not reachable"))?;
        if seed_probe.gtid_executed.is_empty() {
            if !options.force {
                return Err(TopologyError::Consistency(format!(
                    "The instance '{}' has an empty GTID set and cannot be used to restore the cluster '{}'. \
                     Use the force option to reboot from it anyway.",
                    seed, self.name
                )));
            }
            self.engine.forced(
                "rebootClusterFromCompleteOutage",
                &seed.to_string(),
                "seed has an empty GTID set",
            );
        }

        let to_rejoin: Vec<InstanceAddress> = match &options.rejoin_instances {
            Some(list) => {
                let mut addresses = Vec::new();
                for entry in list {
                    let address = parse_address(entry)?;
                    if !voters.contains(&address) {
                        return Err(TopologyError::Validation(format!(
                            "The instance '{}' is not a member of '{}'",
                            address, self.name
                        )));
                    }
                    if address != seed {
                        addresses.push(address);
                    }
                }
                addresses
            }
            None => reachable.iter().map(|(a, _)| a.clone()).filter(|a| a != &seed).collect(),
        };

        if options.dry_run {
            tracing::info!(
                "Dry run: '{}' would be rebooted from {} rejoining {} member(s)",
                self.name,
                seed,
                to_rejoin.len()
            );
            return Ok(RebootReport {
                seed,
                rejoined: Vec::new(),
                skipped: Vec::new(),
                unreachable,
            });
        }

        let federation_role = match &group.federation {
            Some(domain) => self.engine.store.read_federation(domain).await?.role_of(&self.name),
            None => None,
        };
        let mut settings = group.options.settings();
        if matches!(federation_role, Some(FederationRole::Replica) | Some(FederationRole::Invalidated)) {
            settings.insert(ACTION_DISABLE_READ_ONLY_IF_PRIMARY.to_string(), "OFF".to_string());
        }
        let mode = group.mode().unwrap_or(crate::connector::GroupMode::SinglePrimary);

        self.engine
            .execute(
                &seed,
                ReplicationCommand::BootstrapGroup {
                    group_name: group.group_id.clone(),
                    mode,
                    settings: settings.clone(),
                },
            )
            .await?;
        self.engine
            .wait_for_online(&seed, self.engine.config.member_online_timeout(), &self.cancel)
            .await?;

        let mut rejoined = Vec::new();
        let mut skipped = Vec::new();
        for address in &to_rejoin {
            let Some((_, probe)) = reachable.iter().find(|(a, _)| a == address) else {
                skipped.push(MemberFailure::new(address, "unreachable"));
                continue;
            };
            let assessment = assess(&probe.gtid_executed, &seed_probe.gtid_executed, &seed_probe.gtid_purged);
            if !assessment.is_compatible() {
                tracing::warn!("Not rejoining {} after reboot: {:?}", address, assessment);
                skipped.push(MemberFailure::new(address, format!("incompatible GTID set: {:?}", assessment)));
                continue;
            }
            let account = group
                .instances
                .get(address)
                .map(|r| r.recovery_account.clone())
                .unwrap_or_default();
            let joined = async {
                self.engine
                    .execute(
                        address,
                        ReplicationCommand::JoinGroup {
                            group_name: group.group_id.clone(),
                            seeds: vec![seed.clone()],
                            donor: seed.clone(),
                            recovery: RecoveryMethod::Incremental,
                            recovery_account: account,
                            settings: settings.clone(),
                        },
                    )
                    .await?;
                self.engine
                    .wait_for_online(address, self.engine.config.member_online_timeout(), &self.cancel)
                    .await
            }
            .await;
            match joined {
                Ok(()) => rejoined.push(address.clone()),
                Err(e) => {
                    self.engine.execute_best_effort(address, ReplicationCommand::LeaveGroup).await;
                    skipped.push(MemberFailure::new(address, e));
                }
            }
        }

        for (address, probe) in &reachable {
            if probe.offline_mode {
                self.engine
                    .execute_best_effort(address, ReplicationCommand::SetOfflineMode(false))
                    .await;
            }
        }
        if federation_role.is_some() {
            let old_primary = group.primary.clone();
            for failure in self
                .engine
                .follow_primary_change(&group, old_primary.as_ref(), &seed, &self.cancel)
                .await
            {
                skipped.push(failure);
            }
        }

        let new_primary = seed.clone();
        self.commit(move |group| {
            group.primary = Some(new_primary.clone());
            Ok(())
        })
        .await?;

        tracing::info!(
            "Cluster '{}' rebooted from {}; {} member(s) rejoined, {} skipped",
            self.name,
            seed,
            rejoined.len(),
            skipped.len()
        );
        Ok(RebootReport {
            seed,
            rejoined,
            skipped,
            unreachable,
        })
    }

    /// Reconcile the registered members with the live group
    pub async fn rescan(&self, options: RescanOptions) -> Result<RescanReport> {
        self.run("rescan", async {
            let locks = self.engine.lock(vec![self.group_lock()], "rescan", options.dry_run).await?;
            let result = self.rescan_locked(&options).await;
            locks.release().await;
            result
        })
        .await
    }

    async fn rescan_locked(&self, options: &RescanOptions) -> Result<RescanReport> {
        let group = self.record().await?;
        if group.is_replica_set() {
            return Err(TopologyError::Validation("rescan() is not available for replicasets".to_string()));
        }
        let view = self.engine.observe(&group).await;
        let live = view.live_view.clone().ok_or_else(|| {
            TopologyError::Quorum(format!("No reachable member of '{}' is part of the group", self.name))
        })?;
        if !view.has_quorum() {
            return Err(TopologyError::Quorum(format!(
                "There is no quorum to perform the operation on '{}'",
                self.name
            )));
        }

        let mut report = RescanReport {
            unmanaged: view.unmanaged.clone(),
            obsolete: view
                .members
                .values()
                .filter(|m| m.role == InstanceRole::Ha && m.status == InstanceStatus::Missing)
                .map(|m| m.address.clone())
                .collect(),
            mode_updated: group.mode() != Some(live.mode),
            ..RescanReport::default()
        };

        let mut additions = BTreeMap::new();
        if options.add_unmanaged {
            let probes = self.engine.evaluator.probe_all(&report.unmanaged).await;
            for (address, probe) in probes {
                match probe {
                    Ok(probe) => {
                        let record = instance_record(
                            &probe,
                            InstanceRole::Ha,
                            cluster_account(probe.server_id),
                            None,
                            self.engine.config.defaults.member_priority,
                        );
                        additions.insert(address.clone(), record);
                        report.added.push(address);
                    }
                    Err(e) => tracing::warn!("Unmanaged member {} is unreachable, not added: {}", address, e),
                }
            }
        }
        if options.remove_obsolete {
            report.removed = report.obsolete.clone();
        }

        let changed = !additions.is_empty() || !report.removed.is_empty() || report.mode_updated;
        if options.dry_run || !changed {
            return Ok(report);
        }

        if let Some(donor) = self.engine.donor(&view) {
            for record in additions.values() {
                self.engine
                    .execute_best_effort(
                        &donor,
                        ReplicationCommand::CreateReplicationAccount {
                            user: record.recovery_account.clone(),
                            host: group.options.replication_allowed_host.clone(),
                        },
                    )
                    .await;
            }
        }

        let removed = report.removed.clone();
        let live_mode = live.mode;
        self.commit(move |group| {
            for (address, record) in &additions {
                group.instances.insert(address.clone(), record.clone());
            }
            for address in &removed {
                group.instances.remove(address);
            }
            group.kind = GroupKind::Replicated { mode: live_mode };
            Ok(())
        })
        .await?;

        tracing::info!(
            "Rescan of '{}': {} added, {} removed",
            self.name,
            report.added.len(),
            report.removed.len()
        );
        Ok(report)
    }
}
