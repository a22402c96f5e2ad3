//! In-process simulated fleet
//!
//! [`SimulatedFleet`] implements [`InstanceConnector`] over a set of fake
//! instances. It models what the engine can observe about real servers:
//!
//! - group views, primary election and expulsion of failed members while a
//!   majority survives (a minority partition keeps its stale view and loses
//!   quorum);
//! - transaction propagation among the members of a group with quorum and
//!   over running asynchronous channels;
//! - purged binary logs, stalled appliers and injected command failures.
//!
//! Scenario tests drive topology changes (kill, restart, partition, writes)
//! through the helper methods and observe the engine's reaction.

use crate::address::InstanceAddress;
use crate::connector::{
    ChannelStatus, ConnectorError, GroupMemberView, GroupMode, GroupView, InstanceConnector, InstanceProbe,
    MemberRole, MemberState, ReplicationCommand, ACTION_DISABLE_READ_ONLY_IF_PRIMARY,
};
use crate::gtid::{GtidSet, RecoveryMethod};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

const ER_GROUP_NOT_RUNNING: u32 = 3092;
const ER_ALREADY_MEMBER: u32 = 3093;
const ER_TRANSACTIONS_PURGED: u32 = 13114;
const ER_READ_ONLY: u32 = 1290;
const ER_NO_CHANNEL: u32 = 3074;
const ER_INJECTED: u32 = 9999;

#[derive(Debug, Clone)]
struct SimChannel {
    source: InstanceAddress,
    running: bool,
    last_error: Option<String>,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    message: String,
    remaining: Option<u32>,
}

#[derive(Debug, Clone)]
struct SimInstance {
    server_uuid: String,
    server_id: u32,
    version: String,
    executed: GtidSet,
    purged: GtidSet,
    ssl_capable: bool,
    running: bool,
    reachable: bool,
    stalled: bool,
    super_read_only: bool,
    offline_mode: bool,
    group: Option<String>,
    member_state: MemberState,
    channels: BTreeMap<String, SimChannel>,
    variables: BTreeMap<String, String>,
    failures: HashMap<String, InjectedFailure>,
}

#[derive(Debug, Clone)]
struct SimGroup {
    mode: GroupMode,
    view: Vec<InstanceAddress>,
    primary: Option<InstanceAddress>,
    /// Whether election lifts super_read_only on the primary
    primary_writable: bool,
}

#[derive(Debug, Default)]
struct FleetState {
    instances: BTreeMap<InstanceAddress, SimInstance>,
    groups: BTreeMap<String, SimGroup>,
    accounts: BTreeSet<String>,
    next_server_id: u32,
    journal: Vec<(String, String)>,
}

fn rejected(code: u32, message: impl Into<String>) -> ConnectorError {
    ConnectorError::Rejected {
        code,
        message: message.into(),
    }
}

fn lookup(address: &str) -> Result<InstanceAddress, ConnectorError> {
    address
        .parse::<InstanceAddress>()
        .map_err(|e| rejected(ER_INJECTED, e.to_string()))
}

impl FleetState {
    fn instance(&self, address: &InstanceAddress) -> Result<&SimInstance, ConnectorError> {
        self.instances
            .get(address)
            .ok_or_else(|| ConnectorError::Unreachable(format!("unknown host '{}'", address)))
    }

    fn instance_mut(&mut self, address: &InstanceAddress) -> Result<&mut SimInstance, ConnectorError> {
        self.instances
            .get_mut(address)
            .ok_or_else(|| ConnectorError::Unreachable(format!("unknown host '{}'", address)))
    }

    fn active(&self, address: &InstanceAddress) -> bool {
        self.instances
            .get(address)
            .map(|i| i.running && i.reachable)
            .unwrap_or(false)
    }

    fn in_group(&self, group: &str, address: &InstanceAddress) -> bool {
        self.instances
            .get(address)
            .map(|i| i.running && i.reachable && i.group.as_deref() == Some(group))
            .unwrap_or(false)
    }

    fn view_state(&self, group: &str, address: &InstanceAddress) -> MemberState {
        if self.in_group(group, address) {
            self.instances
                .get(address)
                .map(|i| i.member_state)
                .unwrap_or(MemberState::Unreachable)
        } else {
            MemberState::Unreachable
        }
    }

    fn group_has_quorum(&self, group: &str) -> bool {
        match self.groups.get(group) {
            Some(g) => {
                let alive = g.view.iter().filter(|m| self.in_group(group, m)).count();
                alive * 2 > g.view.len()
            }
            None => false,
        }
    }

    /// Pick a primary if the current one is gone and refresh read-only flags
    fn elect(&mut self, group: &str) {
        if !self.group_has_quorum(group) {
            return;
        }
        let Some(g) = self.groups.get(group).cloned() else {
            return;
        };

        let online: Vec<InstanceAddress> = g
            .view
            .iter()
            .filter(|m| self.view_state(group, m) == MemberState::Online)
            .cloned()
            .collect();

        let primary = match g.mode {
            GroupMode::MultiPrimary => None,
            GroupMode::SinglePrimary => match &g.primary {
                Some(p) if online.contains(p) => Some(p.clone()),
                _ => online.iter().min().cloned(),
            },
        };

        for member in &g.view {
            if let Some(instance) = self.instances.get_mut(member) {
                if instance.group.as_deref() != Some(group) {
                    continue;
                }
                instance.super_read_only = match g.mode {
                    GroupMode::MultiPrimary => instance.member_state != MemberState::Online || !g.primary_writable,
                    GroupMode::SinglePrimary => primary.as_ref() != Some(member) || !g.primary_writable,
                };
            }
        }

        if let Some(g) = self.groups.get_mut(group) {
            g.primary = primary;
        }
    }

    /// Expel members that stopped communicating while a majority survives
    fn reconcile(&mut self, group: &str) {
        let Some(g) = self.groups.get(group).cloned() else {
            return;
        };
        let survivors: Vec<InstanceAddress> = g.view.iter().filter(|m| self.in_group(group, m)).cloned().collect();

        if survivors.len() * 2 > g.view.len() {
            for member in g.view.iter().filter(|m| !survivors.contains(m)) {
                if let Some(instance) = self.instances.get_mut(member) {
                    if instance.group.as_deref() == Some(group) {
                        instance.group = None;
                        instance.member_state = if instance.running {
                            MemberState::Error
                        } else {
                            MemberState::Offline
                        };
                    }
                }
            }
            if let Some(g) = self.groups.get_mut(group) {
                g.view = survivors;
            }
            self.elect(group);
        }
    }

    fn propagate(&mut self) {
        for _ in 0..64 {
            let mut changed = false;

            let group_names: Vec<String> = self.groups.keys().cloned().collect();
            for name in group_names {
                if !self.group_has_quorum(&name) {
                    continue;
                }
                let view = self.groups.get(&name).map(|g| g.view.clone()).unwrap_or_default();
                let members: Vec<InstanceAddress> = view
                    .into_iter()
                    .filter(|m| self.in_group(&name, m))
                    .filter(|m| self.instances.get(m).map(|i| !i.stalled).unwrap_or(false))
                    .collect();

                let union = members
                    .iter()
                    .filter_map(|m| self.instances.get(m))
                    .fold(GtidSet::new(), |acc, i| acc.union(&i.executed));

                let mut promoted = false;
                for member in &members {
                    if let Some(instance) = self.instances.get_mut(member) {
                        if instance.executed != union {
                            instance.executed = union.clone();
                            changed = true;
                        }
                        if instance.member_state == MemberState::Recovering {
                            instance.member_state = MemberState::Online;
                            promoted = true;
                            changed = true;
                        }
                    }
                }
                if promoted {
                    self.elect(&name);
                }
            }

            let mut updates: Vec<(InstanceAddress, GtidSet)> = Vec::new();
            for (address, instance) in &self.instances {
                if !instance.running || !instance.reachable || instance.stalled {
                    continue;
                }
                for channel in instance.channels.values() {
                    if !channel.running || channel.last_error.is_some() || !self.active(&channel.source) {
                        continue;
                    }
                    if let Some(source) = self.instances.get(&channel.source) {
                        if !source.executed.is_subset_of(&instance.executed) {
                            updates.push((address.clone(), source.executed.clone()));
                        }
                    }
                }
            }
            for (address, incoming) in updates {
                if let Some(instance) = self.instances.get_mut(&address) {
                    instance.executed = instance.executed.union(&incoming);
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }
    }

    fn check_injected(&mut self, address: &InstanceAddress, kind: &str) -> Result<(), ConnectorError> {
        let instance = self.instance_mut(address)?;
        if let Some(failure) = instance.failures.get_mut(kind) {
            let message = failure.message.clone();
            match failure.remaining.as_mut() {
                Some(0) => {
                    instance.failures.remove(kind);
                    return Ok(());
                }
                Some(n) => {
                    *n -= 1;
                    if *n == 0 {
                        instance.failures.remove(kind);
                    }
                }
                None => {}
            }
            return Err(rejected(ER_INJECTED, message));
        }
        Ok(())
    }

    fn probe(&self, address: &InstanceAddress) -> Result<InstanceProbe, ConnectorError> {
        let instance = self.instance(address)?;
        if !instance.running {
            return Err(ConnectorError::Unreachable(format!("can't connect to '{}' (111)", address)));
        }
        if !instance.reachable {
            return Err(ConnectorError::Timeout);
        }

        let group = instance.group.as_ref().and_then(|name| {
            self.groups.get(name).map(|g| GroupView {
                group_name: name.clone(),
                mode: g.mode,
                members: g
                    .view
                    .iter()
                    .map(|member| GroupMemberView {
                        address: member.clone(),
                        server_uuid: self
                            .instances
                            .get(member)
                            .map(|i| i.server_uuid.clone())
                            .unwrap_or_default(),
                        state: self.view_state(name, member),
                        role: match g.mode {
                            GroupMode::MultiPrimary => MemberRole::Primary,
                            GroupMode::SinglePrimary if g.primary.as_ref() == Some(member) => MemberRole::Primary,
                            GroupMode::SinglePrimary => MemberRole::Secondary,
                        },
                    })
                    .collect(),
            })
        });

        let channels = instance
            .channels
            .iter()
            .map(|(name, channel)| {
                let source_up = self.active(&channel.source);
                let last_error = match (&channel.last_error, channel.running && !source_up) {
                    (Some(error), _) => Some(error.clone()),
                    (None, true) => Some(format!("error reconnecting to source '{}'", channel.source)),
                    (None, false) => None,
                };
                ChannelStatus {
                    name: name.clone(),
                    source: Some(channel.source.clone()),
                    io_running: channel.running && source_up && channel.last_error.is_none(),
                    sql_running: channel.running,
                    last_error,
                }
            })
            .collect();

        Ok(InstanceProbe {
            address: address.clone(),
            server_uuid: instance.server_uuid.clone(),
            server_id: instance.server_id,
            version: instance.version.clone(),
            gtid_executed: instance.executed.clone(),
            gtid_purged: instance.purged.clone(),
            ssl_capable: instance.ssl_capable,
            super_read_only: instance.super_read_only,
            offline_mode: instance.offline_mode,
            member_state: if instance.group.is_some() {
                instance.member_state
            } else if instance.member_state == MemberState::Error {
                MemberState::Error
            } else {
                MemberState::Offline
            },
            group,
            channels,
            variables: instance.variables.clone(),
        })
    }

    fn apply(&mut self, address: &InstanceAddress, command: ReplicationCommand) -> Result<(), ConnectorError> {
        match command {
            ReplicationCommand::BootstrapGroup {
                group_name,
                mode,
                settings,
            } => {
                if self.instance(address)?.group.is_some() {
                    return Err(rejected(ER_ALREADY_MEMBER, "instance is already a member of a group"));
                }
                if let Some(existing) = self.groups.get(&group_name) {
                    if existing.view.iter().any(|m| self.in_group(&group_name, m)) {
                        return Err(rejected(ER_GROUP_NOT_RUNNING, "group is already running"));
                    }
                }
                let primary_writable = settings
                    .get(ACTION_DISABLE_READ_ONLY_IF_PRIMARY)
                    .map(|v| v != "OFF")
                    .unwrap_or(true);
                self.groups.insert(
                    group_name.clone(),
                    SimGroup {
                        mode,
                        view: vec![address.clone()],
                        primary: None,
                        primary_writable,
                    },
                );
                let instance = self.instance_mut(address)?;
                instance.group = Some(group_name.clone());
                instance.member_state = MemberState::Online;
                instance.variables.extend(settings);
                self.elect(&group_name);
            }

            ReplicationCommand::JoinGroup {
                group_name,
                seeds,
                donor,
                recovery,
                settings,
                ..
            } => {
                if self.instance(address)?.group.is_some() {
                    return Err(rejected(ER_ALREADY_MEMBER, "instance is already a member of a group"));
                }
                if !self.group_has_quorum(&group_name) || !seeds.iter().any(|s| self.in_group(&group_name, s)) {
                    return Err(rejected(ER_GROUP_NOT_RUNNING, "no reachable seed with a quorum"));
                }
                if !self.in_group(&group_name, &donor) {
                    return Err(rejected(ER_GROUP_NOT_RUNNING, format!("donor '{}' is not an active member", donor)));
                }

                let donor_state = self.instance(&donor)?;
                let (donor_executed, donor_purged) = (donor_state.executed.clone(), donor_state.purged.clone());
                let instance = self.instance_mut(address)?;
                match recovery {
                    RecoveryMethod::Clone => {
                        instance.executed = donor_executed;
                        instance.purged = donor_purged;
                    }
                    _ => {
                        if !instance.executed.is_subset_of(&donor_executed) {
                            return Err(rejected(
                                ER_GROUP_NOT_RUNNING,
                                "this member has more executed transactions than those present in the group",
                            ));
                        }
                        let needed = donor_executed.subtract(&instance.executed);
                        if !needed.intersection(&donor_purged).is_empty() {
                            return Err(rejected(
                                ER_TRANSACTIONS_PURGED,
                                "transactions required for distributed recovery were purged",
                            ));
                        }
                    }
                }
                instance.group = Some(group_name.clone());
                instance.member_state = if instance.stalled {
                    MemberState::Recovering
                } else {
                    MemberState::Online
                };
                instance.super_read_only = true;
                instance.variables.extend(settings);
                if let Some(g) = self.groups.get_mut(&group_name) {
                    g.view.push(address.clone());
                }
                self.elect(&group_name);
            }

            ReplicationCommand::LeaveGroup => {
                let Some(group_name) = self.instance(address)?.group.clone() else {
                    return Ok(());
                };
                let instance = self.instance_mut(address)?;
                instance.group = None;
                instance.member_state = MemberState::Offline;
                instance.super_read_only = true;

                let empty = match self.groups.get_mut(&group_name) {
                    Some(g) => {
                        g.view.retain(|m| m != address);
                        if g.primary.as_ref() == Some(address) {
                            g.primary = None;
                        }
                        g.view.is_empty()
                    }
                    None => false,
                };
                if empty {
                    self.groups.remove(&group_name);
                } else {
                    self.elect(&group_name);
                }
            }

            ReplicationCommand::SetPrimary { primary } => {
                let group_name = self.member_group(address)?;
                if !self.group_has_quorum(&group_name) {
                    return Err(rejected(ER_GROUP_NOT_RUNNING, "group has no quorum"));
                }
                if self.view_state(&group_name, &primary) != MemberState::Online {
                    return Err(rejected(ER_GROUP_NOT_RUNNING, format!("'{}' is not an ONLINE member", primary)));
                }
                if let Some(g) = self.groups.get_mut(&group_name) {
                    if g.mode != GroupMode::SinglePrimary {
                        return Err(rejected(ER_GROUP_NOT_RUNNING, "group is in multi-primary mode"));
                    }
                    g.primary = Some(primary);
                }
                self.elect(&group_name);
            }

            ReplicationCommand::SwitchMode { mode, primary } => {
                let group_name = self.member_group(address)?;
                if !self.group_has_quorum(&group_name) {
                    return Err(rejected(ER_GROUP_NOT_RUNNING, "group has no quorum"));
                }
                if let Some(g) = self.groups.get_mut(&group_name) {
                    g.mode = mode;
                    g.primary = match mode {
                        GroupMode::MultiPrimary => None,
                        GroupMode::SinglePrimary => primary,
                    };
                }
                self.elect(&group_name);
            }

            ReplicationCommand::ForceMembers { members } => {
                let group_name = self.member_group(address)?;
                if !members.contains(address) {
                    return Err(rejected(ER_GROUP_NOT_RUNNING, "the executing member must be part of the new membership"));
                }
                if let Some(missing) = members.iter().find(|m| !self.in_group(&group_name, m)) {
                    return Err(rejected(ER_GROUP_NOT_RUNNING, format!("'{}' is not reachable in the group", missing)));
                }
                let old_view = self.groups.get(&group_name).map(|g| g.view.clone()).unwrap_or_default();
                for dropped in old_view.iter().filter(|m| !members.contains(m)) {
                    if let Some(instance) = self.instances.get_mut(dropped) {
                        if instance.group.as_deref() == Some(group_name.as_str()) {
                            instance.group = None;
                            instance.member_state = MemberState::Offline;
                        }
                    }
                }
                if let Some(g) = self.groups.get_mut(&group_name) {
                    g.view = members;
                }
                self.elect(&group_name);
            }

            ReplicationCommand::SetVariable { name, value } => {
                if name == ACTION_DISABLE_READ_ONLY_IF_PRIMARY {
                    if let Some(group_name) = self.instance(address)?.group.clone() {
                        if let Some(g) = self.groups.get_mut(&group_name) {
                            g.primary_writable = value != "OFF";
                        }
                        self.elect(&group_name);
                    }
                }
                self.instance_mut(address)?.variables.insert(name, value);
            }

            ReplicationCommand::SetSuperReadOnly(enabled) => {
                self.instance_mut(address)?.super_read_only = enabled;
            }

            ReplicationCommand::SetOfflineMode(enabled) => {
                self.instance_mut(address)?.offline_mode = enabled;
            }

            ReplicationCommand::ConfigureChannel { channel, source, .. } => {
                self.instance_mut(address)?.channels.insert(
                    channel,
                    SimChannel {
                        source,
                        running: false,
                        last_error: None,
                    },
                );
            }

            ReplicationCommand::StartChannel { channel } => {
                let source = match self.instance(address)?.channels.get(&channel) {
                    Some(c) => c.source.clone(),
                    None => return Err(rejected(ER_NO_CHANNEL, format!("replication channel '{}' does not exist", channel))),
                };
                let error = match self.instances.get(&source) {
                    Some(s) if s.running && s.reachable => {
                        let needed = s.executed.subtract(&self.instance(address)?.executed);
                        if needed.intersection(&s.purged).is_empty() {
                            None
                        } else {
                            Some(format!(
                                "Got fatal error 1236 from source: the source purged binary logs containing GTIDs '{}'",
                                needed.intersection(&s.purged)
                            ))
                        }
                    }
                    _ => Some(format!("error connecting to source '{}'", source)),
                };
                if let Some(c) = self.instance_mut(address)?.channels.get_mut(&channel) {
                    c.running = error.is_none();
                    c.last_error = error;
                }
            }

            ReplicationCommand::StopChannel { channel } => {
                if let Some(c) = self.instance_mut(address)?.channels.get_mut(&channel) {
                    c.running = false;
                }
            }

            ReplicationCommand::ResetChannel { channel } => {
                self.instance_mut(address)?.channels.remove(&channel);
            }

            ReplicationCommand::CloneFrom { donor } => {
                if !self.active(&donor) {
                    return Err(rejected(ER_GROUP_NOT_RUNNING, format!("clone donor '{}' is not reachable", donor)));
                }
                let donor_state = self.instance(&donor)?;
                let (executed, purged) = (donor_state.executed.clone(), donor_state.purged.clone());
                let instance = self.instance_mut(address)?;
                instance.executed = executed;
                instance.purged = purged;
            }

            ReplicationCommand::CreateReplicationAccount { user, .. } => {
                self.accounts.insert(user);
            }

            ReplicationCommand::DropReplicationAccount { user } => {
                self.accounts.remove(&user);
            }
        }
        Ok(())
    }

    fn member_group(&self, address: &InstanceAddress) -> Result<String, ConnectorError> {
        self.instance(address)?
            .group
            .clone()
            .ok_or_else(|| rejected(ER_GROUP_NOT_RUNNING, "group replication is not running"))
    }

    fn reconcile_all(&mut self) {
        let names: Vec<String> = self.groups.keys().cloned().collect();
        for name in names {
            self.reconcile(&name);
        }
        self.propagate();
    }
}

/// Simulated set of database instances
#[derive(Debug, Default)]
pub struct SimulatedFleet {
    state: Mutex<FleetState>,
}

impl SimulatedFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deploy a fresh, empty instance
    pub async fn deploy(&self, address: &str) -> Result<(), ConnectorError> {
        let address = lookup(address)?;
        let mut state = self.state.lock().await;
        if state.instances.contains_key(&address) {
            return Err(rejected(ER_ALREADY_MEMBER, format!("instance '{}' already deployed", address)));
        }
        state.next_server_id += 1;
        let server_id = state.next_server_id;
        state.instances.insert(
            address,
            SimInstance {
                server_uuid: Uuid::new_v4().to_string(),
                server_id,
                version: "8.0.36".to_string(),
                executed: GtidSet::new(),
                purged: GtidSet::new(),
                ssl_capable: true,
                running: true,
                reachable: true,
                stalled: false,
                super_read_only: false,
                offline_mode: false,
                group: None,
                member_state: MemberState::Offline,
                channels: BTreeMap::new(),
                variables: BTreeMap::new(),
                failures: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Stop the process of an instance
    pub async fn kill(&self, address: &str) -> Result<(), ConnectorError> {
        self.kill_many(&[address]).await
    }

    /// Stop several instances at the same instant
    pub async fn kill_many(&self, addresses: &[&str]) -> Result<(), ConnectorError> {
        let mut state = self.state.lock().await;
        for address in addresses {
            let address = lookup(address)?;
            state.instance_mut(&address)?.running = false;
        }
        state.reconcile_all();
        Ok(())
    }

    /// Start a stopped instance; group replication does not start automatically
    pub async fn restart(&self, address: &str) -> Result<(), ConnectorError> {
        let address = lookup(address)?;
        let mut state = self.state.lock().await;
        let instance = state.instance_mut(&address)?;
        instance.running = true;
        if instance.group.take().is_some() {
            instance.super_read_only = true;
        }
        instance.member_state = MemberState::Offline;
        state.reconcile_all();
        Ok(())
    }

    /// Cut or restore network access to an instance
    pub async fn set_reachable(&self, address: &str, reachable: bool) -> Result<(), ConnectorError> {
        let address = lookup(address)?;
        let mut state = self.state.lock().await;
        state.instance_mut(&address)?.reachable = reachable;
        state.reconcile_all();
        Ok(())
    }

    /// Stop (or resume) applying replicated transactions on an instance
    pub async fn stall(&self, address: &str, stalled: bool) -> Result<(), ConnectorError> {
        let address = lookup(address)?;
        let mut state = self.state.lock().await;
        state.instance_mut(&address)?.stalled = stalled;
        state.propagate();
        Ok(())
    }

    pub async fn set_ssl_capable(&self, address: &str, capable: bool) -> Result<(), ConnectorError> {
        let address = lookup(address)?;
        self.state.lock().await.instance_mut(&address)?.ssl_capable = capable;
        Ok(())
    }

    pub async fn set_offline_mode(&self, address: &str, enabled: bool) -> Result<(), ConnectorError> {
        let address = lookup(address)?;
        self.state.lock().await.instance_mut(&address)?.offline_mode = enabled;
        Ok(())
    }

    /// Commit `count` client transactions on a writable instance
    pub async fn execute_transactions(&self, address: &str, count: u64) -> Result<(), ConnectorError> {
        let address = lookup(address)?;
        let mut state = self.state.lock().await;
        if !state.active(&address) {
            return Err(ConnectorError::Unreachable(format!("can't connect to '{}'", address)));
        }
        let instance = state.instance(&address)?;
        if instance.super_read_only {
            return Err(rejected(ER_READ_ONLY, "the server is running with --super-read-only"));
        }
        let source = match &instance.group {
            Some(group) => {
                if !state.group_has_quorum(group) {
                    return Err(rejected(ER_GROUP_NOT_RUNNING, "group has no quorum, writes are blocked"));
                }
                group.clone()
            }
            None => instance.server_uuid.clone(),
        };
        state.instance_mut(&address)?.executed.extend(&source, count);
        state.propagate();
        Ok(())
    }

    /// Commit transactions locally that did not originate from the group
    pub async fn inject_errant_transactions(&self, address: &str, count: u64) -> Result<GtidSet, ConnectorError> {
        let address = lookup(address)?;
        let mut state = self.state.lock().await;
        let source = Uuid::new_v4().to_string();
        let mut errant = GtidSet::new();
        errant.extend(&source, count);
        let instance = state.instance_mut(&address)?;
        instance.executed = instance.executed.union(&errant);
        state.propagate();
        Ok(errant)
    }

    /// Purge every binary log of an instance
    pub async fn purge_binary_logs(&self, address: &str) -> Result<(), ConnectorError> {
        let address = lookup(address)?;
        let mut state = self.state.lock().await;
        let instance = state.instance_mut(&address)?;
        instance.purged = instance.executed.clone();
        Ok(())
    }

    /// Make every command of `kind` on an instance fail until cleared
    pub async fn fail_command(&self, address: &str, kind: &str, message: &str) -> Result<(), ConnectorError> {
        self.inject_failure(address, kind, message, None).await
    }

    /// Make the next `times` commands of `kind` on an instance fail
    pub async fn fail_command_times(&self, address: &str, kind: &str, times: u32) -> Result<(), ConnectorError> {
        self.inject_failure(address, kind, "injected failure", Some(times)).await
    }

    async fn inject_failure(
        &self,
        address: &str,
        kind: &str,
        message: &str,
        remaining: Option<u32>,
    ) -> Result<(), ConnectorError> {
        let address = lookup(address)?;
        self.state.lock().await.instance_mut(&address)?.failures.insert(
            kind.to_string(),
            InjectedFailure {
                message: message.to_string(),
                remaining,
            },
        );
        Ok(())
    }

    pub async fn clear_failures(&self, address: &str) -> Result<(), ConnectorError> {
        let address = lookup(address)?;
        self.state.lock().await.instance_mut(&address)?.failures.clear();
        Ok(())
    }

    pub async fn gtid_executed(&self, address: &str) -> Option<GtidSet> {
        let address = lookup(address).ok()?;
        let mut state = self.state.lock().await;
        state.propagate();
        state.instances.get(&address).map(|i| i.executed.clone())
    }

    /// State as seen by the instance itself
    pub async fn member_state(&self, address: &str) -> Option<MemberState> {
        let address = lookup(address).ok()?;
        let state = self.state.lock().await;
        state.probe(&address).ok().map(|p| p.member_state)
    }

    pub async fn super_read_only(&self, address: &str) -> Option<bool> {
        let address = lookup(address).ok()?;
        self.state.lock().await.instances.get(&address).map(|i| i.super_read_only)
    }

    pub async fn offline_mode(&self, address: &str) -> Option<bool> {
        let address = lookup(address).ok()?;
        self.state.lock().await.instances.get(&address).map(|i| i.offline_mode)
    }

    pub async fn variable(&self, address: &str, name: &str) -> Option<String> {
        let address = lookup(address).ok()?;
        self.state
            .lock()
            .await
            .instances
            .get(&address)
            .and_then(|i| i.variables.get(name).cloned())
    }

    pub async fn channel(&self, address: &str, channel: &str) -> Option<ChannelStatus> {
        let address = lookup(address).ok()?;
        let state = self.state.lock().await;
        state.probe(&address).ok().and_then(|p| p.channel(channel).cloned())
    }

    /// Members of the group view the instance belongs to
    pub async fn group_members(&self, address: &str) -> Vec<String> {
        let Ok(address) = lookup(address) else {
            return Vec::new();
        };
        let state = self.state.lock().await;
        state
            .instances
            .get(&address)
            .and_then(|i| i.group.as_ref())
            .and_then(|g| state.groups.get(g))
            .map(|g| g.view.iter().map(|m| m.to_string()).collect())
            .unwrap_or_default()
    }

    /// Current primary of the group the instance belongs to
    pub async fn group_primary(&self, address: &str) -> Option<String> {
        let address = lookup(address).ok()?;
        let state = self.state.lock().await;
        let group = state.instances.get(&address)?.group.as_ref()?;
        state.groups.get(group)?.primary.as_ref().map(|p| p.to_string())
    }

    pub async fn has_account(&self, user: &str) -> bool {
        self.state.lock().await.accounts.contains(user)
    }

    /// Number of commands executed so far; pair with [`Self::commands_since`]
    pub async fn journal_len(&self) -> usize {
        self.state.lock().await.journal.len()
    }

    /// Commands executed after the given journal position, as (address, kind)
    pub async fn commands_since(&self, position: usize) -> Vec<(String, String)> {
        let state = self.state.lock().await;
        state.journal.iter().skip(position).cloned().collect()
    }
}

#[async_trait::async_trait]
impl InstanceConnector for SimulatedFleet {
    async fn probe(&self, address: &InstanceAddress) -> Result<InstanceProbe, ConnectorError> {
        let mut state = self.state.lock().await;
        state.propagate();
        state.probe(address)
    }

    async fn execute(&self, address: &InstanceAddress, command: ReplicationCommand) -> Result<(), ConnectorError> {
        let mut state = self.state.lock().await;
        let instance = state.instance(address)?;
        if !instance.running {
            return Err(ConnectorError::Unreachable(format!("can't connect to '{}' (111)", address)));
        }
        if !instance.reachable {
            return Err(ConnectorError::Timeout);
        }
        state.check_injected(address, command.kind())?;

        let kind = command.kind();
        state.apply(address, command)?;
        state.journal.push((address.to_string(), kind.to_string()));
        state.propagate();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn group_of_three(fleet: &SimulatedFleet) -> Vec<InstanceAddress> {
        let addrs: Vec<InstanceAddress> = ["s1:3306", "s2:3306", "s3:3306"]
            .iter()
            .map(|a| a.parse().unwrap())
            .collect();
        for a in &addrs {
            fleet.deploy(&a.to_string()).await.unwrap();
        }
        fleet
            .execute(
                &addrs[0],
                ReplicationCommand::BootstrapGroup {
                    group_name: "grp".into(),
                    mode: GroupMode::SinglePrimary,
                    settings: BTreeMap::new(),
                },
            )
            .await
            .unwrap();
        for a in &addrs[1..] {
            fleet
                .execute(
                    a,
                    ReplicationCommand::JoinGroup {
                        group_name: "grp".into(),
                        seeds: vec![addrs[0].clone()],
                        donor: addrs[0].clone(),
                        recovery: RecoveryMethod::Incremental,
                        recovery_account: "rpl".into(),
                        settings: BTreeMap::new(),
                    },
                )
                .await
                .unwrap();
        }
        addrs
    }

    #[tokio::test]
    async fn test_writes_replicate_within_group() {
        let fleet = SimulatedFleet::new();
        let addrs = group_of_three(&fleet).await;

        fleet.execute_transactions("s1:3306", 5).await.unwrap();
        assert_eq!(fleet.gtid_executed("s3:3306").await.unwrap().count(), 5);
        assert!(fleet.execute_transactions("s2:3306", 1).await.is_err());

        let probe = fleet.probe(&addrs[1]).await.unwrap();
        let view = probe.group.unwrap();
        assert_eq!(view.primary().unwrap().address, addrs[0]);
        assert!(view.has_quorum());
    }

    #[tokio::test]
    async fn test_majority_expels_failed_member() {
        let fleet = SimulatedFleet::new();
        let addrs = group_of_three(&fleet).await;

        fleet.kill("s1:3306").await.unwrap();
        let view = fleet.probe(&addrs[1]).await.unwrap().group.unwrap();
        assert_eq!(view.members.len(), 2);
        assert!(view.has_quorum());
        assert_eq!(view.primary().unwrap().address, addrs[1]);
    }

    #[tokio::test]
    async fn test_minority_loses_quorum() {
        let fleet = SimulatedFleet::new();
        let addrs = group_of_three(&fleet).await;

        fleet.kill_many(&["s1:3306", "s2:3306"]).await.unwrap();
        let view = fleet.probe(&addrs[2]).await.unwrap().group.unwrap();
        assert_eq!(view.members.len(), 3);
        assert!(!view.has_quorum());
        assert!(fleet.execute_transactions("s3:3306", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_channel_replication_and_purged_source() {
        let fleet = SimulatedFleet::new();
        fleet.deploy("p:3306").await.unwrap();
        fleet.deploy("r:3306").await.unwrap();
        let (p, r): (InstanceAddress, InstanceAddress) = ("p:3306".parse().unwrap(), "r:3306".parse().unwrap());

        fleet.execute_transactions("p:3306", 3).await.unwrap();
        fleet.purge_binary_logs("p:3306").await.unwrap();
        fleet
            .execute(
                &r,
                ReplicationCommand::ConfigureChannel {
                    channel: "".into(),
                    source: p.clone(),
                    account: "rpl".into(),
                },
            )
            .await
            .unwrap();
        fleet.execute(&r, ReplicationCommand::StartChannel { channel: "".into() }).await.unwrap();
        let channel = fleet.channel("r:3306", "").await.unwrap();
        assert!(!channel.is_healthy());
        assert!(channel.last_error.unwrap().contains("1236"));

        fleet.execute(&r, ReplicationCommand::CloneFrom { donor: p.clone() }).await.unwrap();
        fleet.execute(&r, ReplicationCommand::StartChannel { channel: "".into() }).await.unwrap();
        fleet.execute_transactions("p:3306", 2).await.unwrap();
        assert_eq!(fleet.gtid_executed("r:3306").await.unwrap().count(), 5);
    }

    #[tokio::test]
    async fn test_injected_failures_expire() {
        let fleet = SimulatedFleet::new();
        fleet.deploy("x:3306").await.unwrap();
        let x: InstanceAddress = "x:3306".parse().unwrap();
        fleet.fail_command_times("x:3306", "set_super_read_only", 1).await.unwrap();

        assert!(fleet.execute(&x, ReplicationCommand::SetSuperReadOnly(true)).await.is_err());
        assert!(fleet.execute(&x, ReplicationCommand::SetSuperReadOnly(true)).await.is_ok());
    }
}
