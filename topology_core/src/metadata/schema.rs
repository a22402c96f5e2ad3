//! Metadata document model
//!
//! The whole topology is one versioned JSON document. Group and federation
//! records carry their own `version` so writers can detect concurrent changes
//! to the part of the document they depend on.

use crate::address::InstanceAddress;
use crate::config::{GroupDefaults, SslMode};
use crate::connector::GroupMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SchemaVersion {
    pub const CURRENT: SchemaVersion = SchemaVersion {
        major: 2,
        minor: 1,
        patch: 0,
    };

    /// Whether a stored document with this version can be used by this build
    pub fn is_compatible_with(&self, supported: &SchemaVersion) -> bool {
        self.major == supported.major && self.minor <= supported.minor
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Write ids kept on the document for acknowledgement recovery
pub const RECENT_WRITES_KEPT: usize = 32;

/// The complete persisted topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataDocument {
    pub schema_version: SchemaVersion,
    /// Bumped by the backend on every successful store
    pub version: u64,
    /// Identifiers of the most recent writes, newest last
    #[serde(default)]
    pub recent_writes: VecDeque<String>,
    #[serde(default)]
    pub groups: BTreeMap<String, GroupRecord>,
    #[serde(default)]
    pub federations: BTreeMap<String, FederationRecord>,
    #[serde(default)]
    pub routers: BTreeMap<String, RouterRecord>,
    #[serde(default)]
    pub locks: BTreeMap<String, LockRow>,
}

impl MetadataDocument {
    pub fn new() -> Self {
        Self {
            schema_version: SchemaVersion::CURRENT,
            version: 0,
            recent_writes: VecDeque::new(),
            groups: BTreeMap::new(),
            federations: BTreeMap::new(),
            routers: BTreeMap::new(),
            locks: BTreeMap::new(),
        }
    }

    /// Remember `write_id` as one of the latest writes
    pub fn record_write(&mut self, write_id: &str) {
        self.recent_writes.push_back(write_id.to_string());
        while self.recent_writes.len() > RECENT_WRITES_KEPT {
            self.recent_writes.pop_front();
        }
    }

    pub fn contains_write(&self, write_id: &str) -> bool {
        self.recent_writes.iter().any(|id| id == write_id)
    }

    /// Name of the group an instance is registered in, if any
    pub fn group_of_instance(&self, address: &InstanceAddress) -> Option<&str> {
        self.groups
            .values()
            .find(|g| g.instances.contains_key(address))
            .map(|g| g.name.as_str())
    }
}

impl Default for MetadataDocument {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupKind {
    /// Replicated group with consensus-based membership
    Replicated { mode: GroupMode },
    /// Asynchronous primary/replica topology
    ReplicaSet,
}

/// Group-wide options persisted with the group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupOptions {
    pub ssl_mode: SslMode,
    pub transaction_size_limit: u64,
    pub expel_timeout: u32,
    pub exit_state_action: String,
    pub consistency: String,
    pub auto_rejoin_tries: u32,
    pub replication_allowed_host: String,
    pub disable_clone: bool,
}

impl From<&GroupDefaults> for GroupOptions {
    fn from(defaults: &GroupDefaults) -> Self {
        Self {
            ssl_mode: defaults.ssl_mode,
            transaction_size_limit: defaults.transaction_size_limit,
            expel_timeout: defaults.expel_timeout,
            exit_state_action: defaults.exit_state_action.clone(),
            consistency: defaults.consistency.clone(),
            auto_rejoin_tries: defaults.auto_rejoin_tries,
            replication_allowed_host: defaults.replication_allowed_host.clone(),
            disable_clone: defaults.disable_clone,
        }
    }
}

impl GroupOptions {
    /// Group replication variables derived from these options
    pub fn settings(&self) -> BTreeMap<String, String> {
        let mut settings = BTreeMap::new();
        settings.insert(
            "group_replication_transaction_size_limit".to_string(),
            self.transaction_size_limit.to_string(),
        );
        settings.insert(
            "group_replication_member_expel_timeout".to_string(),
            self.expel_timeout.to_string(),
        );
        settings.insert(
            "group_replication_exit_state_action".to_string(),
            self.exit_state_action.clone(),
        );
        settings.insert("group_replication_consistency".to_string(), self.consistency.clone());
        settings.insert(
            "group_replication_autorejoin_tries".to_string(),
            self.auto_rejoin_tries.to_string(),
        );
        settings.insert(
            "group_replication_ssl_mode".to_string(),
            match self.ssl_mode {
                SslMode::Disabled => "DISABLED".to_string(),
                _ => "REQUIRED".to_string(),
            },
        );
        settings
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceRole {
    /// Voting member of the group
    Ha,
    /// Consumes data through an async channel, never votes
    ReadReplica,
}

/// Where a read replica pulls its data from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationSources {
    Primary,
    Secondary,
    Custom(Vec<InstanceAddress>),
}

impl fmt::Display for ReplicationSources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationSources::Primary => f.write_str("PRIMARY"),
            ReplicationSources::Secondary => f.write_str("SECONDARY"),
            ReplicationSources::Custom(list) => {
                let names: Vec<String> = list.iter().map(|a| a.to_string()).collect();
                write!(f, "[{}]", names.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub address: InstanceAddress,
    pub server_uuid: String,
    pub server_id: u32,
    pub label: String,
    pub role: InstanceRole,
    #[serde(default)]
    pub replication_sources: Option<ReplicationSources>,
    /// Account used by this member for recovery or channel replication
    pub recovery_account: String,
    #[serde(default)]
    pub tags: BTreeMap<String, Value>,
    /// Failover preference; lower values win
    pub priority: u32,
    /// Written off after a forced failover
    #[serde(default)]
    pub invalidated: bool,
}

impl InstanceRecord {
    pub fn is_voter(&self) -> bool {
        self.role == InstanceRole::Ha
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub name: String,
    pub group_id: String,
    pub kind: GroupKind,
    pub options: GroupOptions,
    #[serde(default)]
    pub routing_options: BTreeMap<String, Value>,
    #[serde(default)]
    pub tags: BTreeMap<String, Value>,
    pub instances: BTreeMap<InstanceAddress, InstanceRecord>,
    /// Federation this group belongs to
    #[serde(default)]
    pub federation: Option<String>,
    /// Authoritative primary for replica sets, last known primary otherwise
    #[serde(default)]
    pub primary: Option<InstanceAddress>,
    /// Free-form values stored by orchestration steps
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl GroupRecord {
    pub fn new(name: &str, group_id: &str, kind: GroupKind, options: GroupOptions) -> Self {
        Self {
            name: name.to_string(),
            group_id: group_id.to_string(),
            kind,
            options,
            routing_options: BTreeMap::new(),
            tags: BTreeMap::new(),
            instances: BTreeMap::new(),
            federation: None,
            primary: None,
            attributes: BTreeMap::new(),
            version: 0,
            created_at: Utc::now(),
        }
    }

    pub fn is_replica_set(&self) -> bool {
        self.kind == GroupKind::ReplicaSet
    }

    pub fn mode(&self) -> Option<GroupMode> {
        match self.kind {
            GroupKind::Replicated { mode } => Some(mode),
            GroupKind::ReplicaSet => None,
        }
    }

    pub fn voters(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.instances.values().filter(|i| i.is_voter())
    }

    pub fn read_replicas(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.instances.values().filter(|i| !i.is_voter())
    }

    pub fn addresses(&self) -> Vec<InstanceAddress> {
        self.instances.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FederationRole {
    Primary,
    Replica,
    Invalidated,
}

impl fmt::Display for FederationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FederationRole::Primary => f.write_str("PRIMARY"),
            FederationRole::Replica => f.write_str("REPLICA"),
            FederationRole::Invalidated => f.write_str("INVALIDATED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederationRecord {
    pub domain: String,
    pub primary_group: String,
    pub members: BTreeMap<String, FederationRole>,
    #[serde(default)]
    pub routing_options: BTreeMap<String, Value>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl FederationRecord {
    pub fn new(domain: &str, primary_group: &str) -> Self {
        let mut members = BTreeMap::new();
        members.insert(primary_group.to_string(), FederationRole::Primary);
        Self {
            domain: domain.to_string(),
            primary_group: primary_group.to_string(),
            members,
            routing_options: BTreeMap::new(),
            version: 0,
            created_at: Utc::now(),
        }
    }

    pub fn replicas(&self) -> impl Iterator<Item = &str> {
        self.members
            .iter()
            .filter(|(_, role)| **role == FederationRole::Replica)
            .map(|(name, _)| name.as_str())
    }

    pub fn role_of(&self, group: &str) -> Option<FederationRole> {
        self.members.get(group).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterScope {
    Group,
    Federation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterRecord {
    /// `hostname::name`
    pub id: String,
    pub hostname: String,
    pub name: String,
    pub scope: RouterScope,
    /// Name of the group or federation the router serves
    pub target: String,
    pub version: String,
    #[serde(default)]
    pub endpoints: BTreeMap<String, u16>,
    pub last_check_in: Option<DateTime<Utc>>,
    #[serde(default)]
    pub routing_options: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockHolder {
    pub owner: String,
    pub operation: String,
    pub mode: crate::locks::LockMode,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockRow {
    pub holders: Vec<LockHolder>,
}
