//! Creating clusters and replica sets

use super::{cluster_account, instance_record, parse_address, replica_set_account, Cluster, TopologyEngine};
use crate::address::InstanceAddress;
use crate::config::SslMode;
use crate::connector::{GroupMode, InstanceProbe, MemberState, ReplicationCommand};
use crate::error::{Result, TopologyError};
use crate::locks::{LockRequest, LockScope};
use crate::metadata::{GroupKind, GroupOptions, GroupRecord, InstanceRole, TopologyScope};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MAX_NAME_LENGTH: usize = 63;

/// Overrides of the configured group defaults for a new cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateClusterOptions {
    pub multi_primary: bool,
    /// Register a group that is already running on the seed instead of bootstrapping one
    pub adopt_from_gr: bool,
    pub ssl_mode: Option<SslMode>,
    pub transaction_size_limit: Option<u64>,
    pub expel_timeout: Option<u32>,
    pub exit_state_action: Option<String>,
    pub consistency: Option<String>,
    pub auto_rejoin_tries: Option<u32>,
    pub replication_allowed_host: Option<String>,
    pub disable_clone: Option<bool>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateReplicaSetOptions {
    pub replication_allowed_host: Option<String>,
    pub label: Option<String>,
    pub dry_run: bool,
}

/// Names are used as metadata keys and in account names
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TopologyError::Validation(format!("The {} name cannot be empty.", kind)));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(TopologyError::Validation(format!(
            "The {} name can not be greater than {} characters.",
            kind, MAX_NAME_LENGTH
        )));
    }
    let mut chars = name.chars();
    let first_ok = chars.next().map(|c| c.is_ascii_alphabetic() || c == '_').unwrap_or(false);
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.') {
        return Err(TopologyError::Validation(format!(
            "The {} name '{}' is invalid. Only alphanumeric characters, '_', '-' and '.' are allowed and it must start with a letter or '_'.",
            kind, name
        )));
    }
    Ok(())
}

/// Resolve AUTO against the seed and refuse TLS requirements it cannot meet
pub(crate) fn resolve_ssl_mode(requested: SslMode, seed: &InstanceProbe) -> Result<SslMode> {
    match requested {
        SslMode::Auto if seed.ssl_capable => Ok(SslMode::Required),
        SslMode::Auto => Ok(SslMode::Disabled),
        SslMode::Required if !seed.ssl_capable => Err(TopologyError::Validation(format!(
            "memberSslMode REQUIRED was specified but instance '{}' does not support TLS",
            seed.address
        ))),
        mode => Ok(mode),
    }
}

impl CreateClusterOptions {
    fn group_options(&self, engine: &TopologyEngine) -> GroupOptions {
        let mut options = GroupOptions::from(&engine.config().defaults);
        if let Some(mode) = self.ssl_mode {
            options.ssl_mode = mode;
        }
        if let Some(limit) = self.transaction_size_limit {
            options.transaction_size_limit = limit;
        }
        if let Some(timeout) = self.expel_timeout {
            options.expel_timeout = timeout;
        }
        if let Some(action) = &self.exit_state_action {
            options.exit_state_action = action.clone();
        }
        if let Some(consistency) = &self.consistency {
            options.consistency = consistency.clone();
        }
        if let Some(tries) = self.auto_rejoin_tries {
            options.auto_rejoin_tries = tries;
        }
        if let Some(host) = &self.replication_allowed_host {
            options.replication_allowed_host = host.clone();
        }
        if let Some(disabled) = self.disable_clone {
            options.disable_clone = disabled;
        }
        options
    }
}

impl TopologyEngine {
    /// Bootstrap a new cluster on `seed`, or adopt the group already running there
    pub async fn create_cluster(&self, name: &str, seed: &str, options: CreateClusterOptions) -> Result<Cluster> {
        validate_name("cluster", name)?;
        let seed = parse_address(seed)?;
        let cluster = Cluster::new(self.inner().clone(), name);
        let group_options = options.group_options(self);
        super::options::validate_group_options(&group_options)?;

        cluster
            .run("createCluster", cluster.bootstrap(&seed, &options, group_options))
            .await?;
        Ok(cluster)
    }

    /// Create an async primary/replica topology with `seed` as the primary
    pub async fn create_replica_set(
        &self,
        name: &str,
        seed: &str,
        options: CreateReplicaSetOptions,
    ) -> Result<Cluster> {
        validate_name("replicaset", name)?;
        let seed = parse_address(seed)?;
        let cluster = Cluster::new(self.inner().clone(), name);
        cluster
            .run("createReplicaSet", cluster.bootstrap_replica_set(&seed, &options))
            .await?;
        Ok(cluster)
    }
}

impl Cluster {
    fn creation_locks(&self, seed: &InstanceAddress) -> Vec<LockRequest> {
        vec![
            LockRequest::exclusive(LockScope::Group(self.name.clone())),
            LockRequest::exclusive(LockScope::Instance(seed.clone())),
        ]
    }

    /// The name must be free and the seed unregistered
    async fn check_unregistered(&self, seed: &InstanceAddress) -> Result<()> {
        let document = self.engine.store.ensure_schema().await?;
        if document.groups.contains_key(&self.name) {
            return Err(TopologyError::Validation(format!(
                "A cluster or replicaset named '{}' already exists.",
                self.name
            )));
        }
        if let Some(owner) = document.group_of_instance(seed) {
            return Err(TopologyError::Validation(format!(
                "The instance '{}' is already part of the cluster '{}'.",
                seed, owner
            )));
        }
        Ok(())
    }

    /// Insert the new group record, failing if someone registered the name meanwhile
    async fn register(&self, record: GroupRecord) -> Result<()> {
        let name = self.name.clone();
        self.engine
            .store
            .write_topology(TopologyScope::Group(name.clone()), None, move |document| {
                if document.groups.contains_key(&name) {
                    return Err(TopologyError::Validation(format!(
                        "A cluster or replicaset named '{}' already exists.",
                        name
                    )));
                }
                if let Some(address) = record.instances.keys().find(|a| document.group_of_instance(a).is_some()) {
                    return Err(TopologyError::Validation(format!(
                        "The instance '{}' is already registered in another cluster.",
                        address
                    )));
                }
                document.groups.insert(name.clone(), record.clone());
                Ok(())
            })
            .await
    }

    async fn bootstrap(&self, seed: &InstanceAddress, options: &CreateClusterOptions, mut group_options: GroupOptions) -> Result<()> {
        let locks = self
            .engine
            .lock(self.creation_locks(seed), "createCluster", false)
            .await?;
        let result = self.bootstrap_locked(seed, options, &mut group_options).await;
        locks.release().await;
        result
    }

    async fn bootstrap_locked(
        &self,
        seed: &InstanceAddress,
        options: &CreateClusterOptions,
        group_options: &mut GroupOptions,
    ) -> Result<()> {
        self.check_unregistered(seed).await?;
        let probe = self.engine.evaluator.probe_reachable(seed).await?;
        group_options.ssl_mode = resolve_ssl_mode(group_options.ssl_mode, &probe)?;
        let priority = self.engine.config.defaults.member_priority;

        if options.adopt_from_gr {
            return self.adopt(&probe, group_options.clone(), priority).await;
        }
        if probe.group.is_some() {
            return Err(TopologyError::Validation(format!(
                "The instance '{}' is already part of a replication group. Use the adoptFromGR option to register it.",
                seed
            )));
        }

        let mode = if options.multi_primary {
            GroupMode::MultiPrimary
        } else {
            GroupMode::SinglePrimary
        };
        let group_id = Uuid::new_v4().to_string();
        let account = cluster_account(probe.server_id);

        self.engine
            .execute(
                seed,
                ReplicationCommand::CreateReplicationAccount {
                    user: account.clone(),
                    host: group_options.replication_allowed_host.clone(),
                },
            )
            .await?;

        let started = async {
            self.engine
                .execute(
                    seed,
                    ReplicationCommand::BootstrapGroup {
                        group_name: group_id.clone(),
                        mode,
                        settings: group_options.settings(),
                    },
                )
                .await?;
            self.engine
                .wait_for_online(seed, self.engine.config.member_online_timeout(), &self.cancel)
                .await
        }
        .await;

        if let Err(e) = started {
            tracing::warn!("Bootstrap of cluster '{}' on {} failed, reverting: {}", self.name, seed, e);
            self.engine.execute_best_effort(seed, ReplicationCommand::LeaveGroup).await;
            self.engine
                .execute_best_effort(seed, ReplicationCommand::DropReplicationAccount { user: account })
                .await;
            return Err(e);
        }

        let mut record = GroupRecord::new(&self.name, &group_id, GroupKind::Replicated { mode }, group_options.clone());
        record.primary = Some(seed.clone());
        record.instances.insert(
            seed.clone(),
            instance_record(&probe, InstanceRole::Ha, account, options.label.clone(), priority),
        );
        self.register(record).await?;

        tracing::info!("Cluster '{}' created on {} ({})", self.name, seed, mode);
        Ok(())
    }

    /// Register every ONLINE member of the group running on the seed
    async fn adopt(&self, seed: &InstanceProbe, group_options: GroupOptions, priority: u32) -> Result<()> {
        let view = seed.group.clone().ok_or_else(|| {
            TopologyError::Validation(format!(
                "The adoptFromGR option was given but instance '{}' is not part of a replication group",
                seed.address
            ))
        })?;
        if !view.has_quorum() {
            return Err(TopologyError::Quorum(format!(
                "The replication group on '{}' has no quorum and cannot be adopted",
                seed.address
            )));
        }

        let document = self.engine.store.read_topology().await?;
        let members: Vec<InstanceAddress> = view.online().map(|m| m.address.clone()).collect();
        if let Some(taken) = members.iter().find(|a| document.group_of_instance(a).is_some()) {
            return Err(TopologyError::Validation(format!(
                "The instance '{}' is already registered in another cluster.",
                taken
            )));
        }

        let probes = self.engine.evaluator.probe_all(&members).await;
        let mut record = GroupRecord::new(&self.name, &view.group_name, GroupKind::Replicated { mode: view.mode }, group_options);
        record.primary = view.primary().map(|m| m.address.clone());

        for (address, probe) in probes {
            let probe = probe.map_err(|message| TopologyError::connectivity(&address, message))?;
            if probe.member_state != MemberState::Online {
                continue;
            }
            let account = cluster_account(probe.server_id);
            self.engine
                .execute(
                    &seed.address,
                    ReplicationCommand::CreateReplicationAccount {
                        user: account.clone(),
                        host: record.options.replication_allowed_host.clone(),
                    },
                )
                .await?;
            record
                .instances
                .insert(address.clone(), instance_record(&probe, InstanceRole::Ha, account, None, priority));
        }

        let adopted = record.instances.len();
        self.register(record).await?;
        tracing::info!("Adopted replication group {} as cluster '{}' with {} member(s)", view.group_name, self.name, adopted);
        Ok(())
    }

    async fn bootstrap_replica_set(&self, seed: &InstanceAddress, options: &CreateReplicaSetOptions) -> Result<()> {
        let locks = self
            .engine
            .lock(self.creation_locks(seed), "createReplicaSet", options.dry_run)
            .await?;
        let result = self.bootstrap_replica_set_locked(seed, options).await;
        locks.release().await;
        result
    }

    async fn bootstrap_replica_set_locked(&self, seed: &InstanceAddress, options: &CreateReplicaSetOptions) -> Result<()> {
        self.check_unregistered(seed).await?;
        let probe = self.engine.evaluator.probe_reachable(seed).await?;
        if probe.group.is_some() {
            return Err(TopologyError::Validation(format!(
                "The instance '{}' is a member of a replication group and cannot seed a replicaset",
                seed
            )));
        }
        if let Some(channel) = probe.channels.first() {
            return Err(TopologyError::Validation(format!(
                "The instance '{}' has a configured replication channel '{}'; reset it before creating a replicaset",
                seed, channel.name
            )));
        }
        if options.dry_run {
            tracing::info!("Dry run: replicaset '{}' would be created on {}", self.name, seed);
            return Ok(());
        }

        let mut group_options = GroupOptions::from(&self.engine.config.defaults);
        if let Some(host) = &options.replication_allowed_host {
            group_options.replication_allowed_host = host.clone();
        }
        let account = replica_set_account(probe.server_id);

        self.engine
            .execute(
                seed,
                ReplicationCommand::CreateReplicationAccount {
                    user: account.clone(),
                    host: group_options.replication_allowed_host.clone(),
                },
            )
            .await?;
        self.engine
            .execute(seed, ReplicationCommand::SetSuperReadOnly(false))
            .await?;

        let mut record = GroupRecord::new(&self.name, &Uuid::new_v4().to_string(), GroupKind::ReplicaSet, group_options);
        record.primary = Some(seed.clone());
        record.instances.insert(
            seed.clone(),
            instance_record(
                &probe,
                InstanceRole::Ha,
                account,
                options.label.clone(),
                self.engine.config.defaults.member_priority,
            ),
        );
        self.register(record).await?;

        tracing::info!("ReplicaSet '{}' created with PRIMARY {}", self.name, seed);
        Ok(())
    }
}
