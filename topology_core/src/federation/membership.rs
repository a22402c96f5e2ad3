//! Creating a clusterset and attaching or detaching its member clusters

use super::{ClusterSet, MemberGroup, CLUSTERSET_ACCOUNT};
use crate::address::InstanceAddress;
use crate::connector::{GroupMode, ReplicationCommand, ACTION_DISABLE_READ_ONLY_IF_PRIMARY, CLUSTERSET_CHANNEL};
use crate::error::{Result, TopologyError};
use crate::gtid::{assess, choose_recovery, RecoveryMethod};
use crate::locks::{LockRequest, LockScope};
use crate::metadata::{FederationRecord, FederationRole, GroupKind, GroupRecord, InstanceRole, TopologyScope};
use crate::topology::create::{resolve_ssl_mode, validate_name};
use crate::topology::options::ORIGINAL_TRANSACTION_SIZE_LIMIT;
use crate::topology::{cluster_account, clusterset_account, instance_record, parse_address, Cluster};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateReplicaClusterOptions {
    pub recovery_method: Option<RecoveryMethod>,
    pub label: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveClusterOptions {
    /// Remove an unreachable or lagging cluster from the metadata anyway
    pub force: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejoinClusterOptions {
    pub dry_run: bool,
}

/// The cluster's own transaction size limit, from before it became a replica
pub(crate) fn original_limit(group: &GroupRecord) -> u64 {
    group
        .attributes
        .get(ORIGINAL_TRANSACTION_SIZE_LIMIT)
        .and_then(|v| v.parse().ok())
        .unwrap_or(group.options.transaction_size_limit)
}

/// Metadata side of turning a group into a replica of the federation
pub(crate) fn demote_record(group: &mut GroupRecord, account: &str) {
    if !group.attributes.contains_key(ORIGINAL_TRANSACTION_SIZE_LIMIT) {
        group.attributes.insert(
            ORIGINAL_TRANSACTION_SIZE_LIMIT.to_string(),
            group.options.transaction_size_limit.to_string(),
        );
    }
    group.options.transaction_size_limit = 0;
    group
        .attributes
        .insert(CLUSTERSET_ACCOUNT.to_string(), account.to_string());
}

/// Metadata side of a group leaving the replica role
pub(crate) fn promote_record(group: &mut GroupRecord) {
    group.options.transaction_size_limit = original_limit(group);
    group.attributes.remove(ORIGINAL_TRANSACTION_SIZE_LIMIT);
    group.attributes.remove(CLUSTERSET_ACCOUNT);
}

fn primary_of<'a>(members: &'a [MemberGroup], federation: &FederationRecord) -> Result<&'a MemberGroup> {
    members
        .iter()
        .find(|m| m.role == FederationRole::Primary)
        .filter(|m| m.is_available())
        .ok_or_else(|| {
            TopologyError::Quorum(format!(
                "The PRIMARY cluster '{}' of clusterset '{}' is not available",
                federation.primary_group, federation.domain
            ))
        })
}

impl Cluster {
    /// Create a clusterset with this cluster as its PRIMARY
    pub async fn create_cluster_set(&self, domain: &str) -> Result<ClusterSet> {
        validate_name("clusterset", domain)?;
        self.run("createClusterSet", async {
            let locks = self.engine.lock(vec![self.group_lock()], "createClusterSet", false).await?;
            let result = self.create_cluster_set_locked(domain).await;
            locks.release().await;
            result
        })
        .await?;
        Ok(ClusterSet::new(self.engine.clone(), domain))
    }

    async fn create_cluster_set_locked(&self, domain: &str) -> Result<()> {
        let group = self.record().await?;
        if group.is_replica_set() {
            return Err(TopologyError::Validation(
                "A clusterset can only be created from a cluster, not a replicaset".to_string(),
            ));
        }
        if let Some(existing) = &group.federation {
            return Err(TopologyError::Validation(format!(
                "The cluster '{}' is already part of the clusterset '{}'",
                self.name, existing
            )));
        }
        if group.mode() != Some(GroupMode::SinglePrimary) {
            return Err(TopologyError::Validation(format!(
                "The cluster '{}' is in multi-primary mode; clustersets require single-primary clusters",
                self.name
            )));
        }
        let view = self.engine.observe(&group).await;
        if !view.has_quorum() {
            return Err(TopologyError::Quorum(format!(
                "There is no quorum to perform the operation on '{}'",
                self.name
            )));
        }

        let name = self.name.clone();
        let domain = domain.to_string();
        self.engine
            .store
            .write_topology(TopologyScope::Group(name.clone()), Some(group.version), move |document| {
                if document.federations.contains_key(&domain) {
                    return Err(TopologyError::Validation(format!(
                        "A clusterset named '{}' already exists",
                        domain
                    )));
                }
                document
                    .federations
                    .insert(domain.clone(), FederationRecord::new(&domain, &name));
                if let Some(group) = document.groups.get_mut(&name) {
                    group.federation = Some(domain.clone());
                }
                Ok(())
            })
            .await?;

        tracing::info!("Clusterset created with '{}' as PRIMARY cluster", self.name);
        Ok(())
    }
}

impl ClusterSet {
    /// Bootstrap a new cluster on `seed` replicating from the PRIMARY cluster.
    ///
    /// A dry run validates the seed and returns a handle to the cluster that
    /// would have been created; nothing is registered.
    pub async fn create_replica_cluster(
        &self,
        seed: &str,
        name: &str,
        options: CreateReplicaClusterOptions,
    ) -> Result<Cluster> {
        validate_name("cluster", name)?;
        let seed = parse_address(seed)?;
        self.run("createReplicaCluster", async {
            let federation = self.record().await?;
            let mut requests = self.member_locks(&federation);
            requests.push(LockRequest::exclusive(LockScope::Group(name.to_string())));
            requests.push(LockRequest::exclusive(LockScope::Instance(seed.clone())));
            let locks = self
                .engine
                .lock(requests, "createReplicaCluster", options.dry_run)
                .await?;
            let result = self.create_replica_locked(&federation, &seed, name, &options).await;
            locks.release().await;
            result
        })
        .await?;
        Ok(Cluster::new(self.engine.clone(), name))
    }

    async fn create_replica_locked(
        &self,
        federation: &FederationRecord,
        seed: &InstanceAddress,
        name: &str,
        options: &CreateReplicaClusterOptions,
    ) -> Result<()> {
        let document = self.engine.store.read_topology().await?;
        if document.groups.contains_key(name) {
            return Err(TopologyError::Validation(format!(
                "A cluster or replicaset named '{}' already exists.",
                name
            )));
        }
        if let Some(owner) = document.group_of_instance(seed) {
            return Err(TopologyError::Validation(format!(
                "The instance '{}' is already part of the cluster '{}'.",
                seed, owner
            )));
        }

        let members = self.observe_members(federation).await?;
        let primary = primary_of(&members, federation)?;
        let (source, source_probe) = match primary.primary_probe() {
            Some(probe) => (probe.address.clone(), probe.clone()),
            None => {
                return Err(TopologyError::Quorum(format!(
                    "The PRIMARY cluster '{}' has no reachable PRIMARY",
                    federation.primary_group
                )))
            }
        };

        let probe = self.engine.evaluator.probe_reachable(seed).await?;
        if let Some(view) = &probe.group {
            return Err(TopologyError::Validation(format!(
                "The instance '{}' is already part of replication group {}",
                seed, view.group_name
            )));
        }

        let mut group_options = primary.record.options.clone();
        group_options.ssl_mode = resolve_ssl_mode(group_options.ssl_mode, &probe)?;
        let assessment = assess(&probe.gtid_executed, &source_probe.gtid_executed, &source_probe.gtid_purged);
        let requested = options
            .recovery_method
            .unwrap_or(self.engine.config.defaults.recovery_method);
        let recovery = choose_recovery(&seed.to_string(), &assessment, requested, group_options.disable_clone)?;

        if options.dry_run {
            tracing::info!(
                "Dry run: replica cluster '{}' would be created on {} using {} recovery from {}",
                name,
                seed,
                recovery,
                source
            );
            return Ok(());
        }

        let cs_account = clusterset_account(probe.server_id);
        let member_account = cluster_account(probe.server_id);
        self.engine
            .execute(
                &source,
                ReplicationCommand::CreateReplicationAccount {
                    user: cs_account.clone(),
                    host: group_options.replication_allowed_host.clone(),
                },
            )
            .await?;

        let mut record = GroupRecord::new(
            name,
            &Uuid::new_v4().to_string(),
            GroupKind::Replicated {
                mode: GroupMode::SinglePrimary,
            },
            group_options,
        );
        demote_record(&mut record, &cs_account);
        let mut settings = record.options.settings();
        settings.insert(ACTION_DISABLE_READ_ONLY_IF_PRIMARY.to_string(), "OFF".to_string());

        let provisioned = async {
            if recovery == RecoveryMethod::Clone {
                self.engine
                    .execute(seed, ReplicationCommand::CloneFrom { donor: source.clone() })
                    .await?;
            }
            self.engine
                .execute(
                    seed,
                    ReplicationCommand::CreateReplicationAccount {
                        user: member_account.clone(),
                        host: record.options.replication_allowed_host.clone(),
                    },
                )
                .await?;
            self.engine
                .execute(
                    seed,
                    ReplicationCommand::BootstrapGroup {
                        group_name: record.group_id.clone(),
                        mode: GroupMode::SinglePrimary,
                        settings: settings.clone(),
                    },
                )
                .await?;
            self.engine
                .wait_for_online(seed, self.engine.config.member_online_timeout(), &self.cancel)
                .await?;
            self.engine.follow_source(seed, &source, &cs_account, &self.cancel).await?;
            self.engine
                .wait_for_transactions(seed, &source_probe.gtid_executed, self.engine.config.sync_timeout(), &self.cancel)
                .await
        }
        .await;

        if let Err(e) = provisioned {
            tracing::warn!("Replica cluster '{}' could not be created on {}, reverting: {}", name, seed, e);
            if let Err(reset) = self.engine.detach_channel(seed, CLUSTERSET_CHANNEL).await {
                tracing::warn!("Could not reset the clusterset channel on {}: {}", seed, reset);
            }
            self.engine.execute_best_effort(seed, ReplicationCommand::LeaveGroup).await;
            self.engine
                .execute_best_effort(&source, ReplicationCommand::DropReplicationAccount { user: cs_account })
                .await;
            return Err(e);
        }

        record.federation = Some(self.domain.clone());
        record.primary = Some(seed.clone());
        record.instances.insert(
            seed.clone(),
            instance_record(
                &probe,
                InstanceRole::Ha,
                member_account,
                options.label.clone(),
                self.engine.config.defaults.member_priority,
            ),
        );
        let name = name.to_string();
        let domain = self.domain.clone();
        self.commit(federation.version, move |document| {
            if document.groups.contains_key(&name) {
                return Err(TopologyError::Validation(format!(
                    "A cluster or replicaset named '{}' already exists.",
                    name
                )));
            }
            document.groups.insert(name.clone(), record.clone());
            if let Some(federation) = document.federations.get_mut(&domain) {
                federation.members.insert(name.clone(), FederationRole::Replica);
            }
            Ok(())
        })
        .await?;

        tracing::info!("Replica cluster created on {} replicating from {}", seed, source);
        Ok(())
    }

    /// Detach a cluster from the clusterset, leaving it a standalone writable cluster
    pub async fn remove_cluster(&self, name: &str, options: RemoveClusterOptions) -> Result<()> {
        self.run("removeCluster", async {
            let federation = self.record().await?;
            let locks = self
                .engine
                .lock(self.member_locks(&federation), "removeCluster", options.dry_run)
                .await?;
            let result = self.remove_cluster_locked(&federation, name, &options).await;
            locks.release().await;
            result
        })
        .await
    }

    async fn remove_cluster_locked(
        &self,
        federation: &FederationRecord,
        name: &str,
        options: &RemoveClusterOptions,
    ) -> Result<()> {
        let role = federation.role_of(name).ok_or_else(|| {
            TopologyError::Validation(format!("The cluster '{}' is not part of the clusterset '{}'", name, self.domain))
        })?;

        if role == FederationRole::Primary {
            if federation.members.len() > 1 {
                return Err(TopologyError::Validation(format!(
                    "The PRIMARY cluster '{}' cannot be removed while other clusters are part of the clusterset",
                    name
                )));
            }
            if options.dry_run {
                return Ok(());
            }
            let member = name.to_string();
            let domain = self.domain.clone();
            self.commit(federation.version, move |document| {
                document.federations.remove(&domain);
                if let Some(group) = document.groups.get_mut(&member) {
                    group.federation = None;
                }
                Ok(())
            })
            .await?;
            tracing::info!("Clusterset '{}' dropped with its last cluster '{}'", self.domain, name);
            return Ok(());
        }

        let members = self.observe_members(federation).await?;
        let target = members
            .iter()
            .find(|m| m.name() == name)
            .ok_or_else(|| TopologyError::NotFound(format!("The cluster '{}' does not exist.", name)))?;
        let primary = members.iter().find(|m| m.role == FederationRole::Primary);

        match target.primary() {
            Some(target_primary) => {
                if let Some(source) = primary.and_then(|p| p.executed()) {
                    if let Err(e) = self
                        .engine
                        .wait_for_transactions(target_primary, source, self.engine.config.sync_timeout(), &self.cancel)
                        .await
                    {
                        if !options.force {
                            return Err(e);
                        }
                        self.engine.forced(
                            "removeCluster",
                            name,
                            &format!("cluster did not catch up with the PRIMARY cluster: {}", e),
                        );
                    }
                }
                if options.dry_run {
                    return Ok(());
                }
                self.detach_member(target, options.force).await?;
                if let (Some(primary), Ok(account)) = (primary.and_then(|p| p.primary()), target.account()) {
                    self.engine
                        .execute_best_effort(primary, ReplicationCommand::DropReplicationAccount { user: account })
                        .await;
                }
            }
            None => {
                if !options.force {
                    return Err(TopologyError::Connectivity {
                        address: name.to_string(),
                        message: "the cluster is not reachable. Use the force option to remove it from the metadata only."
                            .to_string(),
                    });
                }
                self.engine
                    .forced("removeCluster", name, "cluster unreachable, only its metadata is removed");
                if options.dry_run {
                    return Ok(());
                }
            }
        }

        let member = name.to_string();
        let domain = self.domain.clone();
        self.commit(federation.version, move |document| {
            if let Some(federation) = document.federations.get_mut(&domain) {
                federation.members.remove(&member);
            }
            if let Some(group) = document.groups.get_mut(&member) {
                group.federation = None;
                promote_record(group);
            }
            Ok(())
        })
        .await?;

        tracing::info!("Cluster '{}' removed from clusterset '{}'", name, self.domain);
        Ok(())
    }

    /// Stop inter-group replication on a member and make its primary writable
    async fn detach_member(&self, member: &MemberGroup, force: bool) -> Result<()> {
        let Some(primary) = member.primary() else {
            return Ok(());
        };
        let steps = async {
            self.engine.detach_channel(primary, CLUSTERSET_CHANNEL).await?;
            self.engine.set_primary_writable(&member.view, true).await
        }
        .await;
        match steps {
            Ok(()) => {}
            Err(e) if force => self.engine.forced(
                "removeCluster",
                member.name(),
                &format!("failed to stop inter-cluster replication: {}", e),
            ),
            Err(e) => return Err(e),
        }
        self.engine
            .apply_transaction_size_limit(&member.view, original_limit(&member.record))
            .await;
        Ok(())
    }

    /// Re-establish inter-group replication of a detached, failed or invalidated cluster
    pub async fn rejoin_cluster(&self, name: &str, options: RejoinClusterOptions) -> Result<()> {
        self.run("rejoinCluster", async {
            let federation = self.record().await?;
            let locks = self
                .engine
                .lock(self.member_locks(&federation), "rejoinCluster", options.dry_run)
                .await?;
            let result = self.rejoin_cluster_locked(&federation, name, &options).await;
            locks.release().await;
            result
        })
        .await
    }

    async fn rejoin_cluster_locked(
        &self,
        federation: &FederationRecord,
        name: &str,
        options: &RejoinClusterOptions,
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
                    "The cluster '{}' is the PRIMARY cluster of the clusterset",
                    name
                )))
            }
            Some(_) => {}
        }

        let members = self.observe_members(federation).await?;
        let primary = primary_of(&members, federation)?;
        let target = members
            .iter()
            .find(|m| m.name() == name)
            .ok_or_else(|| TopologyError::NotFound(format!("The cluster '{}' does not exist.", name)))?;
        let (Some(target_primary), Some(target_executed)) = (target.primary().cloned(), target.executed()) else {
            return Err(TopologyError::Connectivity {
                address: name.to_string(),
                message: "the cluster has no reachable PRIMARY with quorum".to_string(),
            });
        };
        let (Some(source), Some(source_probe)) = (primary.primary().cloned(), primary.primary_probe()) else {
            return Err(TopologyError::Quorum(format!(
                "The PRIMARY cluster '{}' has no reachable PRIMARY",
                primary.name()
            )));
        };

        let errant = target_executed.subtract(&source_probe.gtid_executed);
        if !errant.is_empty() {
            tracing::warn!(
                "Cluster '{}' has errant transactions that do not exist in the PRIMARY cluster '{}': {}",
                name,
                primary.name(),
                errant
            );
            return Err(TopologyError::Consistency(format!(
                "The cluster '{}' has errant transactions '{}' not present in the PRIMARY cluster and cannot rejoin the clusterset",
                name, errant
            )));
        }
        let lost = source_probe
            .gtid_executed
            .subtract(target_executed)
            .intersection(&source_probe.gtid_purged);
        if !lost.is_empty() {
            return Err(TopologyError::Consistency(format!(
                "The PRIMARY cluster purged transactions '{}' that the cluster '{}' still needs; remove and re-create it",
                lost, name
            )));
        }

        if options.dry_run {
            tracing::info!("Dry run: cluster '{}' would rejoin, replicating from {}", name, source);
            return Ok(());
        }

        let account = match target.account() {
            Ok(account) => account,
            Err(_) => clusterset_account(
                target
                    .primary_probe()
                    .map(|p| p.server_id)
                    .unwrap_or_default(),
            ),
        };
        let was_writable = target.primary_probe().map(|p| !p.super_read_only).unwrap_or(false);
        let previous_limit = target
            .primary_probe()
            .and_then(|p| p.variables.get("group_replication_transaction_size_limit"))
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| original_limit(&target.record));
        self.engine.set_primary_writable(&target.view, false).await?;
        self.engine.apply_transaction_size_limit(&target.view, 0).await;
        let attached = async {
            self.engine
                .execute(
                    &source,
                    ReplicationCommand::CreateReplicationAccount {
                        user: account.clone(),
                        host: target.record.options.replication_allowed_host.clone(),
                    },
                )
                .await?;
            self.engine
                .follow_source(&target_primary, &source, &account, &self.cancel)
                .await
        }
        .await;
        if let Err(e) = attached {
            tracing::warn!("Rejoin of cluster '{}' failed, reverting its fence: {}", name, e);
            if let Err(detach) = self.engine.detach_channel(&target_primary, CLUSTERSET_CHANNEL).await {
                tracing::debug!("Channel cleanup on {} failed: {}", target_primary, detach);
            }
            if was_writable {
                if let Err(unfence) = self.engine.set_primary_writable(&target.view, true).await {
                    tracing::error!("Could not lift the write fence on '{}': {}", name, unfence);
                }
            }
            self.engine.apply_transaction_size_limit(&target.view, previous_limit).await;
            return Err(e);
        }

        let member = name.to_string();
        let domain = self.domain.clone();
        self.commit(federation.version, move |document| {
            if let Some(federation) = document.federations.get_mut(&domain) {
                federation.members.insert(member.clone(), FederationRole::Replica);
            }
            if let Some(group) = document.groups.get_mut(&member) {
                demote_record(group, &account);
                group.primary = Some(target_primary.clone());
            }
            Ok(())
        })
        .await?;

        tracing::info!("Cluster '{}' rejoined clusterset '{}'", name, self.domain);
        Ok(())
    }
}
