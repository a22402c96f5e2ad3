//! Async primary/replica topologies

mod common;

use common::{harness, Harness};
use topology_core::connector::REPLICASET_CHANNEL;
use topology_core::topology::{
    AddInstanceOptions, AddReplicaOptions, CreateReplicaSetOptions, ForcePrimaryOptions, RejoinOptions,
    RemoveInstanceOptions, SetPrimaryOptions,
};
use topology_core::{Cluster, ErrorKind, GroupStatus, InstanceAddress, InstanceStatus, RecoveryMethod};

fn addr(text: &str) -> InstanceAddress {
    text.parse().unwrap()
}

/// Replicaset "rs" with p1 as primary and r1, r2 as replicas
async fn replica_set(h: &Harness) -> Cluster {
    let rs = h
        .engine
        .create_replica_set("rs", "p1:3306", CreateReplicaSetOptions::default())
        .await
        .unwrap();
    for replica in ["r1:3306", "r2:3306"] {
        rs.add_instance(replica, AddInstanceOptions::default()).await.unwrap();
    }
    rs
}

async fn source_of(h: &Harness, address: &str) -> Option<InstanceAddress> {
    h.fleet.channel(address, REPLICASET_CHANNEL).await.and_then(|c| c.source)
}

mod topology_tests {
    use super::*;

    #[tokio::test]
    async fn test_replicas_follow_primary() {
        let h = harness(&["p1:3306", "r1:3306", "r2:3306"]).await;
        let rs = replica_set(&h).await;
        h.fleet.execute_transactions("p1:3306", 6).await.unwrap();

        assert_eq!(h.fleet.gtid_executed("r2:3306").await.unwrap().count(), 6);
        assert_eq!(h.fleet.super_read_only("r1:3306").await, Some(true));
        assert!(h.fleet.execute_transactions("r1:3306", 1).await.is_err());

        let status = rs.status().await.unwrap();
        assert_eq!(status.kind, "ReplicaSet");
        assert_eq!(status.status, GroupStatus::Ok);
        assert_eq!(status.primary, Some(addr("p1:3306")));
        assert!(status.members.iter().all(|m| m.status == InstanceStatus::Online));
    }

    #[tokio::test]
    async fn test_read_replicas_are_cluster_only() {
        let h = harness(&["p1:3306", "r1:3306", "r2:3306", "x:3306"]).await;
        let rs = replica_set(&h).await;

        let err = rs
            .add_replica_instance("x:3306", AddReplicaOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_purged_source_requires_clone() {
        let h = harness(&["p1:3306", "r1:3306", "r2:3306", "r3:3306"]).await;
        let rs = replica_set(&h).await;
        h.fleet.execute_transactions("p1:3306", 3).await.unwrap();
        h.fleet.purge_binary_logs("p1:3306").await.unwrap();

        let err = rs
            .add_instance(
                "r3:3306",
                AddInstanceOptions {
                    recovery_method: Some(RecoveryMethod::Incremental),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);

        rs.add_instance("r3:3306", AddInstanceOptions::default()).await.unwrap();
        assert_eq!(h.fleet.gtid_executed("r3:3306").await.unwrap().count(), 3);
    }

    #[tokio::test]
    async fn test_remove_replica() {
        let h = harness(&["p1:3306", "r1:3306", "r2:3306"]).await;
        let rs = replica_set(&h).await;

        rs.remove_instance("r2:3306", RemoveInstanceOptions::default())
            .await
            .unwrap();
        assert!(h.fleet.channel("r2:3306", REPLICASET_CHANNEL).await.is_none());
        assert!(!h.fleet.has_account("mysql_innodb_rs_3").await);
        let status = rs.status().await.unwrap();
        assert_eq!(status.members.len(), 2);
    }
}

mod primary_tests {
    use super::*;

    #[tokio::test]
    async fn test_switchover() {
        let h = harness(&["p1:3306", "r1:3306", "r2:3306"]).await;
        let rs = replica_set(&h).await;
        h.fleet.execute_transactions("p1:3306", 2).await.unwrap();

        rs.set_primary_instance("r1:3306", SetPrimaryOptions::default())
            .await
            .unwrap();

        assert_eq!(h.fleet.super_read_only("r1:3306").await, Some(false));
        assert_eq!(h.fleet.super_read_only("p1:3306").await, Some(true));
        assert_eq!(source_of(&h, "p1:3306").await, Some(addr("r1:3306")));
        assert_eq!(source_of(&h, "r2:3306").await, Some(addr("r1:3306")));
        assert!(h.fleet.channel("r1:3306", REPLICASET_CHANNEL).await.is_none());

        h.fleet.execute_transactions("r1:3306", 1).await.unwrap();
        assert_eq!(h.fleet.gtid_executed("p1:3306").await.unwrap().count(), 3);
        assert_eq!(rs.status().await.unwrap().status, GroupStatus::Ok);
    }

    #[tokio::test]
    async fn test_failover_and_rejoin_of_old_primary() {
        let h = harness(&["p1:3306", "r1:3306", "r2:3306"]).await;
        let rs = replica_set(&h).await;
        h.fleet.execute_transactions("p1:3306", 2).await.unwrap();
        h.fleet.kill("p1:3306").await.unwrap();

        assert_eq!(rs.status().await.unwrap().status, GroupStatus::Unavailable);
        let err = rs
            .set_primary_instance("r1:3306", SetPrimaryOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Quorum);

        let outcome = rs
            .force_primary_instance(Some("r2:3306"), ForcePrimaryOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.primary, addr("r2:3306"));
        assert_eq!(outcome.invalidated, vec![addr("p1:3306")]);
        assert_eq!(source_of(&h, "r1:3306").await, Some(addr("r2:3306")));
        assert_eq!(h.engine.metrics().failovers, 1);

        let status = rs.status().await.unwrap();
        assert_eq!(status.status, GroupStatus::Ok);
        let old = status.members.iter().find(|m| m.address == addr("p1:3306")).unwrap();
        assert_eq!(old.status, InstanceStatus::Invalidated);

        h.fleet.restart("p1:3306").await.unwrap();
        rs.rejoin_instance("p1:3306", RejoinOptions::default()).await.unwrap();
        assert_eq!(source_of(&h, "p1:3306").await, Some(addr("r2:3306")));
        assert_eq!(h.fleet.super_read_only("p1:3306").await, Some(true));
        let status = rs.status().await.unwrap();
        assert!(status.members.iter().all(|m| m.status == InstanceStatus::Online));
    }

    #[tokio::test]
    async fn test_force_primary_dry_run() {
        let h = harness(&["p1:3306", "r1:3306", "r2:3306"]).await;
        let rs = replica_set(&h).await;
        h.fleet.kill("p1:3306").await.unwrap();
        let position = h.fleet.journal_len().await;

        let outcome = rs
            .force_primary_instance(
                None,
                ForcePrimaryOptions {
                    dry_run: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_ne!(outcome.primary, addr("p1:3306"));
        assert!(h.fleet.commands_since(position).await.is_empty());
        let group = h.engine.metadata().read_group("rs").await.unwrap();
        assert_eq!(group.primary, Some(addr("p1:3306")));
    }

    #[tokio::test]
    async fn test_errant_replica_cannot_be_promoted_automatically() {
        let h = harness(&["p1:3306", "r1:3306", "r2:3306"]).await;
        let rs = replica_set(&h).await;
        h.fleet.inject_errant_transactions("r1:3306", 1).await.unwrap();
        h.fleet.inject_errant_transactions("r2:3306", 1).await.unwrap();
        h.fleet.kill("p1:3306").await.unwrap();

        let err = rs
            .force_primary_instance(None, ForcePrimaryOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
    }
}
