//! Membership and quorum evaluation
//!
//! Status is always derived from live probes against the registered
//! topology, never cached between operations. The evaluator probes every
//! registered instance concurrently, picks the authoritative group view and
//! classifies each member and the group as a whole.

pub mod quorum;

pub use quorum::{fault_tolerance, has_quorum, rank_candidates, Candidate};

use crate::address::InstanceAddress;
use crate::connector::{
    ChannelStatus, GroupMode, GroupView, InstanceConnector, InstanceProbe, MemberRole, MemberState,
    READ_REPLICA_CHANNEL, REPLICASET_CHANNEL,
};
use crate::error::TopologyError;
use crate::gtid::GtidSet;
use crate::metadata::{GroupRecord, InstanceRecord, InstanceRole};
use crate::metrics::MetricsCollector;
use crate::trace::probe_span;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// Per-instance status reported to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstanceStatus {
    Online,
    Recovering,
    Offline,
    Error,
    Unreachable,
    /// Registered but absent from the live group view
    Missing,
    /// Written off after a forced failover
    Invalidated,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceStatus::Online => "ONLINE",
            InstanceStatus::Recovering => "RECOVERING",
            InstanceStatus::Offline => "OFFLINE",
            InstanceStatus::Error => "ERROR",
            InstanceStatus::Unreachable => "UNREACHABLE",
            InstanceStatus::Missing => "(MISSING)",
            InstanceStatus::Invalidated => "INVALIDATED",
        };
        f.write_str(name)
    }
}

impl From<MemberState> for InstanceStatus {
    fn from(state: MemberState) -> Self {
        match state {
            MemberState::Online => InstanceStatus::Online,
            MemberState::Recovering => InstanceStatus::Recovering,
            MemberState::Offline => InstanceStatus::Offline,
            MemberState::Error => InstanceStatus::Error,
            MemberState::Unreachable => InstanceStatus::Unreachable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GroupStatus {
    /// Quorum and every registered member online
    Ok,
    /// Quorum, some members missing, still tolerates a failure
    OkPartial,
    /// Quorum but a single further failure loses it
    OkNoTolerance,
    NoQuorum,
    Unavailable,
    Unknown,
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroupStatus::Ok => "OK",
            GroupStatus::OkPartial => "OK_PARTIAL",
            GroupStatus::OkNoTolerance => "OK_NO_TOLERANCE",
            GroupStatus::NoQuorum => "NO_QUORUM",
            GroupStatus::Unavailable => "UNAVAILABLE",
            GroupStatus::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Outcome of probing one instance; `Err` carries the connection error
pub type ProbeMap = BTreeMap<InstanceAddress, Result<InstanceProbe, String>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberReport {
    pub address: InstanceAddress,
    pub role: InstanceRole,
    /// PRIMARY/SECONDARY for voting members that are in the view
    pub member_role: Option<MemberRole>,
    pub status: InstanceStatus,
    pub gtid_executed: Option<GtidSet>,
    /// Inbound async channel, for read replicas and replica-set replicas
    pub channel: Option<ChannelStatus>,
    pub super_read_only: Option<bool>,
    pub shell_connect_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuorumState {
    pub has_quorum: bool,
    pub online_voters: usize,
    pub view_size: usize,
    pub fault_tolerance: usize,
}

/// Live state of one group
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologyView {
    pub group: String,
    pub mode: Option<GroupMode>,
    pub status: GroupStatus,
    pub status_text: String,
    pub primary: Option<InstanceAddress>,
    pub quorum: QuorumState,
    pub members: BTreeMap<InstanceAddress, MemberReport>,
    /// Members of the live view that are not registered
    pub unmanaged: Vec<InstanceAddress>,
    #[serde(skip)]
    pub probes: ProbeMap,
    #[serde(skip)]
    pub live_view: Option<GroupView>,
}

impl TopologyView {
    pub fn member(&self, address: &InstanceAddress) -> Option<&MemberReport> {
        self.members.get(address)
    }

    pub fn status_of(&self, address: &InstanceAddress) -> Option<InstanceStatus> {
        self.members.get(address).map(|m| m.status)
    }

    pub fn probe(&self, address: &InstanceAddress) -> Option<&InstanceProbe> {
        self.probes.get(address).and_then(|p| p.as_ref().ok())
    }

    pub fn is_reachable(&self, address: &InstanceAddress) -> bool {
        self.probe(address).is_some()
    }

    pub fn has_quorum(&self) -> bool {
        self.quorum.has_quorum
    }

    /// Voting members currently ONLINE
    pub fn online_voters(&self) -> Vec<InstanceAddress> {
        self.members
            .values()
            .filter(|m| m.role == InstanceRole::Ha && m.status == InstanceStatus::Online)
            .map(|m| m.address.clone())
            .collect()
    }

    /// Union of the executed sets of every reachable online voter
    pub fn group_executed(&self) -> GtidSet {
        self.online_voters()
            .iter()
            .filter_map(|a| self.probe(a))
            .fold(GtidSet::new(), |acc, p| acc.union(&p.gtid_executed))
    }

    /// The probe of the current primary, if reachable
    pub fn primary_probe(&self) -> Option<&InstanceProbe> {
        self.primary.as_ref().and_then(|p| self.probe(p))
    }
}

fn channel_status(record: &InstanceRecord, probe: &InstanceProbe, channel: &str, sources: &BTreeSet<InstanceAddress>) -> InstanceStatus {
    match probe.channel(channel) {
        Some(c) if c.is_healthy() && c.source.as_ref().map(|s| sources.contains(s)).unwrap_or(false) => {
            InstanceStatus::Online
        }
        Some(c) if c.last_error.is_some() => InstanceStatus::Error,
        Some(c) if c.sql_running => InstanceStatus::Recovering,
        _ => {
            tracing::debug!("No running channel '{}' on {}", channel, record.address);
            InstanceStatus::Offline
        }
    }
}

fn authoritative_view<'a>(group: &GroupRecord, probes: &'a ProbeMap) -> Option<&'a GroupView> {
    let views: Vec<&GroupView> = group
        .voters()
        .filter_map(|i| probes.get(&i.address).and_then(|p| p.as_ref().ok()))
        .filter_map(|p| p.view_of(&group.group_id))
        .collect();

    views
        .iter()
        .filter(|v| v.has_quorum())
        .max_by_key(|v| v.online_count())
        .or_else(|| views.iter().max_by_key(|v| (v.members.len(), v.online_count())))
        .copied()
}

fn report(record: &InstanceRecord, probe: Option<&InstanceProbe>, error: Option<String>, status: InstanceStatus) -> MemberReport {
    MemberReport {
        address: record.address.clone(),
        role: record.role,
        member_role: None,
        status,
        gtid_executed: probe.map(|p| p.gtid_executed.clone()),
        channel: None,
        super_read_only: probe.map(|p| p.super_read_only),
        shell_connect_error: error,
    }
}

/// Derive the live status of a group from probes of its instances
pub fn evaluate(group: &GroupRecord, probes: ProbeMap) -> TopologyView {
    if group.is_replica_set() {
        return evaluate_replica_set(group, probes);
    }

    let view = authoritative_view(group, &probes).cloned();
    let mut members = BTreeMap::new();

    for record in group.voters() {
        let (probe, error) = match probes.get(&record.address) {
            Some(Ok(p)) => (Some(p), None),
            Some(Err(e)) => (None, Some(e.clone())),
            None => (None, Some("not probed".to_string())),
        };
        let in_view = view.as_ref().and_then(|v| v.member(&record.address));

        let status = if record.invalidated {
            InstanceStatus::Invalidated
        } else if let Some(entry) = in_view {
            InstanceStatus::from(entry.state)
        } else if let Some(p) = probe {
            match p.member_state {
                MemberState::Error => InstanceStatus::Error,
                _ if view.is_none() => InstanceStatus::from(p.member_state),
                _ => InstanceStatus::Offline,
            }
        } else if view.is_some() {
            InstanceStatus::Missing
        } else {
            InstanceStatus::Unreachable
        };

        let mut member = report(record, probe, error, status);
        member.member_role = in_view.filter(|e| e.state == MemberState::Online).map(|e| e.role);
        members.insert(record.address.clone(), member);
    }

    let primary = view.as_ref().and_then(|v| v.primary()).map(|m| m.address.clone());
    let online_sources: BTreeSet<InstanceAddress> = view
        .as_ref()
        .map(|v| v.online().map(|m| m.address.clone()).collect())
        .unwrap_or_default();

    for record in group.read_replicas() {
        let member = match probes.get(&record.address) {
            Some(Ok(p)) => {
                let status = if record.invalidated {
                    InstanceStatus::Invalidated
                } else {
                    channel_status(record, p, READ_REPLICA_CHANNEL, &online_sources)
                };
                let mut member = report(record, Some(p), None, status);
                member.channel = p.channel(READ_REPLICA_CHANNEL).cloned();
                member
            }
            Some(Err(e)) => report(record, None, Some(e.clone()), InstanceStatus::Unreachable),
            None => report(record, None, None, InstanceStatus::Unreachable),
        };
        members.insert(record.address.clone(), member);
    }

    let unmanaged = view
        .as_ref()
        .map(|v| {
            v.members
                .iter()
                .filter(|m| !group.instances.contains_key(&m.address))
                .map(|m| m.address.clone())
                .collect()
        })
        .unwrap_or_default();

    let quorum = match &view {
        Some(v) => QuorumState {
            has_quorum: v.has_quorum(),
            online_voters: v.online_count(),
            view_size: v.members.len(),
            fault_tolerance: if v.has_quorum() {
                fault_tolerance(v.online_count())
            } else {
                0
            },
        },
        None => QuorumState {
            has_quorum: false,
            online_voters: 0,
            view_size: 0,
            fault_tolerance: 0,
        },
    };

    let registered = group.voters().filter(|i| !i.invalidated).count();
    let (status, status_text) = match &view {
        None => (
            GroupStatus::Unavailable,
            "Cluster is not available: no reachable member is part of the group.".to_string(),
        ),
        Some(_) if !quorum.has_quorum => (
            GroupStatus::NoQuorum,
            "Cluster has no quorum as visible from the reachable members and cannot process write transactions."
                .to_string(),
        ),
        Some(_) if quorum.fault_tolerance == 0 => {
            let text = if quorum.online_voters < registered {
                format!(
                    "Cluster is NOT tolerant to any failures. {} members are not active.",
                    registered - quorum.online_voters
                )
            } else {
                "Cluster is NOT tolerant to any failures.".to_string()
            };
            (GroupStatus::OkNoTolerance, text)
        }
        Some(_) if quorum.online_voters < registered => (
            GroupStatus::OkPartial,
            format!(
                "Cluster is ONLINE and can tolerate up to {} failure{}. {} member{} not active.",
                quorum.fault_tolerance,
                if quorum.fault_tolerance == 1 { "" } else { "s" },
                registered - quorum.online_voters,
                if registered - quorum.online_voters == 1 { " is" } else { "s are" }
            ),
        ),
        Some(_) => (
            GroupStatus::Ok,
            format!(
                "Cluster is ONLINE and can tolerate up to {} failure{}.",
                quorum.fault_tolerance,
                if quorum.fault_tolerance == 1 { "" } else { "s" }
            ),
        ),
    };

    TopologyView {
        group: group.name.clone(),
        mode: view.as_ref().map(|v| v.mode).or_else(|| group.mode()),
        status,
        status_text,
        primary,
        quorum,
        members,
        unmanaged,
        probes,
        live_view: view,
    }
}

fn evaluate_replica_set(group: &GroupRecord, probes: ProbeMap) -> TopologyView {
    let primary = group.primary.clone();
    let primary_up = primary
        .as_ref()
        .map(|p| matches!(probes.get(p), Some(Ok(_))))
        .unwrap_or(false);
    let sources: BTreeSet<InstanceAddress> = primary.iter().cloned().collect();

    let mut members = BTreeMap::new();
    for record in group.instances.values() {
        let is_primary = primary.as_ref() == Some(&record.address);
        let member = match probes.get(&record.address) {
            Some(Ok(p)) => {
                let status = if record.invalidated {
                    InstanceStatus::Invalidated
                } else if is_primary {
                    InstanceStatus::Online
                } else {
                    channel_status(record, p, REPLICASET_CHANNEL, &sources)
                };
                let mut member = report(record, Some(p), None, status);
                member.member_role = Some(if is_primary {
                    MemberRole::Primary
                } else {
                    MemberRole::Secondary
                });
                if !is_primary {
                    member.channel = p.channel(REPLICASET_CHANNEL).cloned();
                }
                member
            }
            Some(Err(e)) => {
                let status = if record.invalidated {
                    InstanceStatus::Invalidated
                } else {
                    InstanceStatus::Unreachable
                };
                report(record, None, Some(e.clone()), status)
            }
            None => report(record, None, None, InstanceStatus::Unreachable),
        };
        members.insert(record.address.clone(), member);
    }

    let online = members.values().filter(|m| m.status == InstanceStatus::Online).count();
    let registered = group.instances.values().filter(|i| !i.invalidated).count();
    let (status, status_text) = if !primary_up {
        (
            GroupStatus::Unavailable,
            "PRIMARY instance is not available, but there is at least one SECONDARY that could be force-promoted."
                .to_string(),
        )
    } else if online < registered {
        (
            GroupStatus::OkPartial,
            "Available for writes, but some replicas are not replicating.".to_string(),
        )
    } else {
        (GroupStatus::Ok, "All instances available.".to_string())
    };

    TopologyView {
        group: group.name.clone(),
        mode: None,
        status,
        status_text,
        primary,
        quorum: QuorumState {
            has_quorum: primary_up,
            online_voters: online,
            view_size: group.instances.len(),
            fault_tolerance: 0,
        },
        members,
        unmanaged: Vec::new(),
        probes,
        live_view: None,
    }
}

pub struct MembershipEvaluator {
    connector: Arc<dyn InstanceConnector>,
    probe_timeout: Duration,
    metrics: Arc<MetricsCollector>,
}

impl MembershipEvaluator {
    pub fn new(connector: Arc<dyn InstanceConnector>, probe_timeout: Duration, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            connector,
            probe_timeout,
            metrics,
        }
    }

    /// Probe one instance, bounded by the probe timeout
    pub async fn probe(&self, address: &InstanceAddress) -> Result<InstanceProbe, String> {
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.probe_timeout, self.connector.probe(address))
            .instrument(probe_span(&address.to_string()))
            .await;

        let result = match outcome {
            Ok(Ok(probe)) => Ok(probe),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("probe timed out after {}ms", self.probe_timeout.as_millis())),
        };
        self.metrics.record_probe(result.is_ok(), start.elapsed());
        if let Err(e) = &result {
            tracing::debug!("Instance {} unreachable: {}", address, e);
        }
        result
    }

    /// Probe one instance, mapping failure to a connectivity error
    pub async fn probe_reachable(&self, address: &InstanceAddress) -> crate::error::Result<InstanceProbe> {
        self.probe(address)
            .await
            .map_err(|message| TopologyError::connectivity(address, message))
    }

    /// Probe all instances concurrently
    pub async fn probe_all(&self, addresses: &[InstanceAddress]) -> ProbeMap {
        let results = join_all(addresses.iter().map(|a| self.probe(a))).await;
        addresses.iter().cloned().zip(results).collect()
    }

    /// Probe and evaluate a registered group
    pub async fn observe(&self, group: &GroupRecord) -> TopologyView {
        let probes = self.probe_all(&group.addresses()).await;
        let view = evaluate(group, probes);
        self.metrics
            .update_group_membership(&group.name, view.quorum.online_voters, group.instances.len());
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupDefaults;
    use crate::connector::GroupMemberView;
    use crate::metadata::{GroupKind, GroupOptions};

    fn addr(s: &str) -> InstanceAddress {
        s.parse().unwrap()
    }

    fn record(address: &str, role: InstanceRole) -> InstanceRecord {
        InstanceRecord {
            address: addr(address),
            server_uuid: address.to_string(),
            server_id: 1,
            label: address.to_string(),
            role,
            replication_sources: None,
            recovery_account: String::new(),
            tags: BTreeMap::new(),
            priority: 50,
            invalidated: false,
        }
    }

    fn group(members: &[&str]) -> GroupRecord {
        let mut group = GroupRecord::new(
            "main",
            "gid",
            GroupKind::Replicated {
                mode: GroupMode::SinglePrimary,
            },
            GroupOptions::from(&GroupDefaults::default()),
        );
        for m in members {
            group.instances.insert(addr(m), record(m, InstanceRole::Ha));
        }
        group
    }

    fn probe(address: &str, view: Option<GroupView>) -> InstanceProbe {
        InstanceProbe {
            address: addr(address),
            server_uuid: address.to_string(),
            server_id: 1,
            version: "8.0.36".into(),
            gtid_executed: GtidSet::new(),
            gtid_purged: GtidSet::new(),
            ssl_capable: true,
            super_read_only: false,
            offline_mode: false,
            member_state: if view.is_some() {
                MemberState::Online
            } else {
                MemberState::Offline
            },
            group: view,
            channels: Vec::new(),
            variables: BTreeMap::new(),
        }
    }

    fn view(entries: &[(&str, MemberState, MemberRole)]) -> GroupView {
        GroupView {
            group_name: "gid".into(),
            mode: GroupMode::SinglePrimary,
            members: entries
                .iter()
                .map(|(a, state, role)| GroupMemberView {
                    address: addr(a),
                    server_uuid: a.to_string(),
                    state: *state,
                    role: *role,
                })
                .collect(),
        }
    }

    #[test]
    fn test_healthy_group_is_ok() {
        let g = group(&["a:1", "b:1", "c:1"]);
        let v = view(&[
            ("a:1", MemberState::Online, MemberRole::Primary),
            ("b:1", MemberState::Online, MemberRole::Secondary),
            ("c:1", MemberState::Online, MemberRole::Secondary),
        ]);
        let probes: ProbeMap = ["a:1", "b:1", "c:1"]
            .iter()
            .map(|a| (addr(a), Ok(probe(a, Some(v.clone())))))
            .collect();

        let result = evaluate(&g, probes);
        assert_eq!(result.status, GroupStatus::Ok);
        assert_eq!(result.primary, Some(addr("a:1")));
        assert_eq!(result.quorum.fault_tolerance, 1);
    }

    #[test]
    fn test_two_of_three_unreachable_is_no_quorum() {
        let g = group(&["a:1", "b:1", "c:1"]);
        let v = view(&[
            ("a:1", MemberState::Unreachable, MemberRole::Primary),
            ("b:1", MemberState::Unreachable, MemberRole::Secondary),
            ("c:1", MemberState::Online, MemberRole::Secondary),
        ]);
        let mut probes = ProbeMap::new();
        probes.insert(addr("a:1"), Err("down".into()));
        probes.insert(addr("b:1"), Err("down".into()));
        probes.insert(addr("c:1"), Ok(probe("c:1", Some(v))));

        let result = evaluate(&g, probes);
        assert_eq!(result.status, GroupStatus::NoQuorum);
        assert_eq!(result.status_of(&addr("a:1")), Some(InstanceStatus::Unreachable));
        assert_eq!(result.primary, None);
    }

    #[test]
    fn test_expelled_members_are_missing() {
        let g = group(&["a:1", "b:1", "c:1"]);
        let v = view(&[("c:1", MemberState::Online, MemberRole::Primary)]);
        let mut probes = ProbeMap::new();
        probes.insert(addr("a:1"), Err("down".into()));
        probes.insert(addr("b:1"), Err("down".into()));
        probes.insert(addr("c:1"), Ok(probe("c:1", Some(v))));

        let result = evaluate(&g, probes);
        assert_eq!(result.status, GroupStatus::OkNoTolerance);
        assert_eq!(result.status_of(&addr("a:1")), Some(InstanceStatus::Missing));
        assert_eq!(result.online_voters(), vec![addr("c:1")]);
    }

    #[test]
    fn test_partial_group_with_tolerance() {
        let g = group(&["a:1", "b:1", "c:1", "d:1", "e:1"]);
        let v = view(&[
            ("a:1", MemberState::Online, MemberRole::Primary),
            ("b:1", MemberState::Online, MemberRole::Secondary),
            ("c:1", MemberState::Online, MemberRole::Secondary),
            ("d:1", MemberState::Online, MemberRole::Secondary),
        ]);
        let mut probes: ProbeMap = ["a:1", "b:1", "c:1", "d:1"]
            .iter()
            .map(|a| (addr(a), Ok(probe(a, Some(v.clone())))))
            .collect();
        probes.insert(addr("e:1"), Ok(probe("e:1", None)));

        let result = evaluate(&g, probes);
        assert_eq!(result.status, GroupStatus::OkPartial);
        assert_eq!(result.status_of(&addr("e:1")), Some(InstanceStatus::Offline));
    }

    #[test]
    fn test_no_reachable_view_is_unavailable() {
        let g = group(&["a:1", "b:1"]);
        let mut probes = ProbeMap::new();
        probes.insert(addr("a:1"), Ok(probe("a:1", None)));
        probes.insert(addr("b:1"), Err("down".into()));

        let result = evaluate(&g, probes);
        assert_eq!(result.status, GroupStatus::Unavailable);
        assert_eq!(result.status_of(&addr("a:1")), Some(InstanceStatus::Offline));
        assert_eq!(result.status_of(&addr("b:1")), Some(InstanceStatus::Unreachable));
    }

    #[test]
    fn test_read_replica_does_not_count_for_quorum() {
        let mut g = group(&["a:1"]);
        g.instances.insert(addr("r:1"), record("r:1", InstanceRole::ReadReplica));
        let v = view(&[("a:1", MemberState::Online, MemberRole::Primary)]);
        let mut probes = ProbeMap::new();
        probes.insert(addr("a:1"), Ok(probe("a:1", Some(v))));
        probes.insert(addr("r:1"), Err("down".into()));

        let result = evaluate(&g, probes);
        assert!(result.has_quorum());
        assert_eq!(result.quorum.view_size, 1);
        assert_eq!(result.status_of(&addr("r:1")), Some(InstanceStatus::Unreachable));
    }
}
