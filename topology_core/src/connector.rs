//! Collaborator boundary towards database instances
//!
//! The engine never talks SQL itself. It observes instances through
//! [`InstanceConnector::probe`] and changes their replication configuration
//! with typed [`ReplicationCommand`]s. Connection management, retries and
//! statement rendering belong to the connector implementation.

use crate::address::InstanceAddress;
use crate::gtid::{GtidSet, RecoveryMethod};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Inter-group channel of a replica cluster in a federation
pub const CLUSTERSET_CHANNEL: &str = "clusterset_replication";
/// Channel of a read replica attached to a group
pub const READ_REPLICA_CHANNEL: &str = "read_replica_replication";
/// Default channel used by async replica sets
pub const REPLICASET_CHANNEL: &str = "";
/// Member action that lifts super_read_only on a newly elected primary.
/// Replica groups of a federation switch it OFF so their primary stays read-only.
pub const ACTION_DISABLE_READ_ONLY_IF_PRIMARY: &str = "mysql_disable_super_read_only_if_primary";

/// Group communication state of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    Online,
    Recovering,
    Offline,
    Error,
    Unreachable,
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemberState::Online => "ONLINE",
            MemberState::Recovering => "RECOVERING",
            MemberState::Offline => "OFFLINE",
            MemberState::Error => "ERROR",
            MemberState::Unreachable => "UNREACHABLE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberRole {
    Primary,
    Secondary,
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberRole::Primary => f.write_str("PRIMARY"),
            MemberRole::Secondary => f.write_str("SECONDARY"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMode {
    SinglePrimary,
    MultiPrimary,
}

impl fmt::Display for GroupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupMode::SinglePrimary => f.write_str("Single-Primary"),
            GroupMode::MultiPrimary => f.write_str("Multi-Primary"),
        }
    }
}

/// One entry of a member's group view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMemberView {
    pub address: InstanceAddress,
    pub server_uuid: String,
    pub state: MemberState,
    pub role: MemberRole,
}

/// Membership view as reported by one member of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupView {
    pub group_name: String,
    pub mode: GroupMode,
    pub members: Vec<GroupMemberView>,
}

impl GroupView {
    pub fn member(&self, address: &InstanceAddress) -> Option<&GroupMemberView> {
        self.members.iter().find(|m| &m.address == address)
    }

    pub fn online(&self) -> impl Iterator<Item = &GroupMemberView> {
        self.members.iter().filter(|m| m.state == MemberState::Online)
    }

    pub fn online_count(&self) -> usize {
        self.online().count()
    }

    /// Members that still communicate with the group
    pub fn reachable_count(&self) -> usize {
        self.members.iter().filter(|m| m.state != MemberState::Unreachable).count()
    }

    pub fn has_quorum(&self) -> bool {
        self.reachable_count() * 2 > self.members.len()
    }

    /// The single writable member in single-primary mode
    pub fn primary(&self) -> Option<&GroupMemberView> {
        if self.mode != GroupMode::SinglePrimary {
            return None;
        }
        self.members
            .iter()
            .find(|m| m.role == MemberRole::Primary && m.state == MemberState::Online)
    }
}

/// State of an asynchronous replication channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub name: String,
    pub source: Option<InstanceAddress>,
    pub io_running: bool,
    pub sql_running: bool,
    pub last_error: Option<String>,
}

impl ChannelStatus {
    pub fn is_healthy(&self) -> bool {
        self.io_running && self.sql_running && self.last_error.is_none()
    }
}

/// Everything the engine learns about an instance in one round trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceProbe {
    pub address: InstanceAddress,
    pub server_uuid: String,
    pub server_id: u32,
    pub version: String,
    pub gtid_executed: GtidSet,
    pub gtid_purged: GtidSet,
    pub ssl_capable: bool,
    pub super_read_only: bool,
    pub offline_mode: bool,
    /// Local group communication state; `Offline` when not in a group
    pub member_state: MemberState,
    /// The member's own view of its group, if it belongs to one
    pub group: Option<GroupView>,
    pub channels: Vec<ChannelStatus>,
    pub variables: BTreeMap<String, String>,
}

impl InstanceProbe {
    pub fn channel(&self, name: &str) -> Option<&ChannelStatus> {
        self.channels.iter().find(|c| c.name == name)
    }

    /// The group view, only if this instance is an active member of `group_name`
    pub fn view_of(&self, group_name: &str) -> Option<&GroupView> {
        self.group.as_ref().filter(|view| view.group_name == group_name)
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(|v| v.as_str())
    }
}

/// Replication-side mutations the engine can request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationCommand {
    /// Start a new group with this instance as its only member
    BootstrapGroup {
        group_name: String,
        mode: GroupMode,
        settings: BTreeMap<String, String>,
    },
    /// Join an existing group, transferring state from `donor`
    JoinGroup {
        group_name: String,
        seeds: Vec<InstanceAddress>,
        donor: InstanceAddress,
        recovery: RecoveryMethod,
        recovery_account: String,
        settings: BTreeMap<String, String>,
    },
    LeaveGroup,
    SetPrimary { primary: InstanceAddress },
    SwitchMode {
        mode: GroupMode,
        primary: Option<InstanceAddress>,
    },
    /// Override the group membership with the given partition
    ForceMembers { members: Vec<InstanceAddress> },
    SetVariable { name: String, value: String },
    SetSuperReadOnly(bool),
    SetOfflineMode(bool),
    ConfigureChannel {
        channel: String,
        source: InstanceAddress,
        account: String,
    },
    StartChannel { channel: String },
    StopChannel { channel: String },
    ResetChannel { channel: String },
    /// Replace the instance's data with a copy of `donor`
    CloneFrom { donor: InstanceAddress },
    CreateReplicationAccount { user: String, host: String },
    DropReplicationAccount { user: String },
}

impl ReplicationCommand {
    /// Stable name used in logs and fault injection
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicationCommand::BootstrapGroup { .. } => "bootstrap_group",
            ReplicationCommand::JoinGroup { .. } => "join_group",
            ReplicationCommand::LeaveGroup => "leave_group",
            ReplicationCommand::SetPrimary { .. } => "set_primary",
            ReplicationCommand::SwitchMode { .. } => "switch_mode",
            ReplicationCommand::ForceMembers { .. } => "force_members",
            ReplicationCommand::SetVariable { .. } => "set_variable",
            ReplicationCommand::SetSuperReadOnly(_) => "set_super_read_only",
            ReplicationCommand::SetOfflineMode(_) => "set_offline_mode",
            ReplicationCommand::ConfigureChannel { .. } => "configure_channel",
            ReplicationCommand::StartChannel { .. } => "start_channel",
            ReplicationCommand::StopChannel { .. } => "stop_channel",
            ReplicationCommand::ResetChannel { .. } => "reset_channel",
            ReplicationCommand::CloneFrom { .. } => "clone_from",
            ReplicationCommand::CreateReplicationAccount { .. } => "create_replication_account",
            ReplicationCommand::DropReplicationAccount { .. } => "drop_replication_account",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("instance unreachable: {0}")]
    Unreachable(String),
    #[error("error {code}: {message}")]
    Rejected { code: u32, message: String },
    #[error("request timed out")]
    Timeout,
}

/// Connector trait for talking to database instances
#[async_trait::async_trait]
pub trait InstanceConnector: Send + Sync {
    /// Read the health, membership and replication state of an instance
    async fn probe(&self, address: &InstanceAddress) -> Result<InstanceProbe, ConnectorError>;

    /// Apply a replication-side change to an instance
    async fn execute(&self, address: &InstanceAddress, command: ReplicationCommand) -> Result<(), ConnectorError>;
}
