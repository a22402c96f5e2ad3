//! Read-only views of a cluster

use super::{parse_address, Cluster};
use crate::address::InstanceAddress;
use crate::connector::{GroupMode, MemberRole};
use crate::error::{Result, TopologyError};
use crate::gtid::{assess, GtidAssessment};
use crate::membership::{GroupStatus, InstanceStatus, MemberReport};
use crate::metadata::{FederationRole, GroupRecord, InstanceRole, ReplicationSources};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberStatus {
    pub address: InstanceAddress,
    pub label: String,
    pub role: InstanceRole,
    pub member_role: Option<MemberRole>,
    pub status: InstanceStatus,
    /// `R/W`, `R/O` or `n/a`
    pub mode: String,
    pub replication_source: Option<InstanceAddress>,
    pub replication_error: Option<String>,
    pub gtid_executed: Option<String>,
    pub shell_connect_error: Option<String>,
    pub tags: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FederationMembership {
    pub domain: String,
    pub role: Option<FederationRole>,
}

/// Structured status tree of one cluster
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterStatus {
    pub name: String,
    /// `InnoDBCluster` or `ReplicaSet`
    pub kind: String,
    pub mode: Option<GroupMode>,
    pub status: GroupStatus,
    pub status_text: String,
    pub primary: Option<InstanceAddress>,
    pub fault_tolerance: usize,
    pub members: Vec<MemberStatus>,
    pub unmanaged: Vec<InstanceAddress>,
    pub federation: Option<FederationMembership>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DescribedInstance {
    pub address: InstanceAddress,
    pub label: String,
    pub role: InstanceRole,
    pub replication_sources: Option<ReplicationSources>,
}

/// Registered topology, without probing anything
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterDescription {
    pub name: String,
    pub kind: String,
    pub mode: Option<GroupMode>,
    pub group_id: String,
    pub federation: Option<String>,
    pub instances: Vec<DescribedInstance>,
}

/// Compatibility of an outside instance with the cluster
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceStateReport {
    pub address: InstanceAddress,
    /// `ok`, `warning` or `error`
    pub state: String,
    pub reason: String,
    pub assessment: GtidAssessment,
}

fn kind_name(group: &GroupRecord) -> String {
    if group.is_replica_set() {
        "ReplicaSet".to_string()
    } else {
        "InnoDBCluster".to_string()
    }
}

fn member_mode(report: &MemberReport) -> String {
    match (report.status, report.super_read_only) {
        (InstanceStatus::Online, Some(false)) => "R/W".to_string(),
        (InstanceStatus::Online, Some(true)) => "R/O".to_string(),
        _ => "n/a".to_string(),
    }
}

impl Cluster {
    /// Probe every member and report the live status
    pub async fn status(&self) -> Result<ClusterStatus> {
        self.run("status", async {
            let group = self.record().await?;
            let view = self.engine.observe(&group).await;

            let federation = match &group.federation {
                Some(domain) => {
                    let role = match self.engine.store.read_federation(domain).await {
                        Ok(record) => record.role_of(&self.name),
                        Err(e) => {
                            tracing::warn!("Could not read clusterset '{}': {}", domain, e);
                            None
                        }
                    };
                    Some(FederationMembership {
                        domain: domain.clone(),
                        role,
                    })
                }
                None => None,
            };

            let members = view
                .members
                .values()
                .map(|report| {
                    let record = group.instances.get(&report.address);
                    MemberStatus {
                        address: report.address.clone(),
                        label: record.map(|r| r.label.clone()).unwrap_or_else(|| report.address.to_string()),
                        role: report.role,
                        member_role: report.member_role,
                        status: report.status,
                        mode: member_mode(report),
                        replication_source: report.channel.as_ref().and_then(|c| c.source.clone()),
                        replication_error: report.channel.as_ref().and_then(|c| c.last_error.clone()),
                        gtid_executed: report.gtid_executed.as_ref().map(|g| g.to_string()),
                        shell_connect_error: report.shell_connect_error.clone(),
                        tags: record.map(|r| r.tags.clone()).unwrap_or_default(),
                    }
                })
                .collect();

            Ok(ClusterStatus {
                name: self.name.clone(),
                kind: kind_name(&group),
                mode: view.mode,
                status: view.status,
                status_text: view.status_text.clone(),
                primary: view.primary.clone(),
                fault_tolerance: view.quorum.fault_tolerance,
                members,
                unmanaged: view.unmanaged.clone(),
                federation,
            })
        })
        .await
    }

    pub async fn describe(&self) -> Result<ClusterDescription> {
        self.run("describe", async {
            let group = self.record().await?;
            Ok(ClusterDescription {
                name: group.name.clone(),
                kind: kind_name(&group),
                mode: group.mode(),
                group_id: group.group_id.clone(),
                federation: group.federation.clone(),
                instances: group
                    .instances
                    .values()
                    .map(|i| DescribedInstance {
                        address: i.address.clone(),
                        label: i.label.clone(),
                        role: i.role,
                        replication_sources: i.replication_sources.clone(),
                    })
                    .collect(),
            })
        })
        .await
    }

    /// Assess whether an instance could join or rejoin without losing data
    pub async fn check_instance_state(&self, address: &str) -> Result<InstanceStateReport> {
        let address = parse_address(address)?;
        self.run("checkInstanceState", async {
            let group = self.record().await?;
            let view = self.engine.observe(&group).await;
            let donor = self
                .engine
                .donor(&view)
                .ok_or_else(|| TopologyError::Quorum(format!("No ONLINE member of '{}' is reachable", self.name)))?;
            let donor_probe = view
                .probe(&donor)
                .ok_or_else(|| TopologyError::connectivity(&donor, "donor is not reachable"))?;
            let probe = self.engine.evaluator.probe_reachable(&address).await?;

            let executed = if group.is_replica_set() {
                donor_probe.gtid_executed.clone()
            } else {
                view.group_executed()
            };
            let assessment = assess(&probe.gtid_executed, &executed, &donor_probe.gtid_purged);
            let (state, reason) = match &assessment {
                GtidAssessment::Identical => ("ok", "identical"),
                GtidAssessment::Recoverable { .. } => ("ok", "recoverable"),
                GtidAssessment::NotProvisioned { .. } => ("warning", "new"),
                GtidAssessment::Irrecoverable { .. } => ("error", "lost_transactions"),
                GtidAssessment::Diverged { .. } => ("error", "diverged"),
            };
            Ok(InstanceStateReport {
                address: address.clone(),
                state: state.to_string(),
                reason: reason.to_string(),
                assessment,
            })
        })
        .await
    }
}
