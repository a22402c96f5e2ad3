//! Cluster lifecycle against a simulated fleet: create, add, remove,
//! rejoin, rescan and dissolve.

mod common;

use common::harness;
use topology_core::topology::{
    AddInstanceOptions, AddReplicaOptions, CreateClusterOptions, DissolveOptions, RejoinOptions,
    RemoveInstanceOptions, RescanOptions,
};
use topology_core::{ErrorKind, GroupStatus, InstanceAddress, InstanceRole, InstanceStatus, RecoveryMethod};

fn addr(text: &str) -> InstanceAddress {
    text.parse().unwrap()
}

mod create_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_grow_cluster() {
        let h = harness(&["s1:3306", "s2:3306", "s3:3306"]).await;
        let cluster = h.cluster("main", &["s1:3306", "s2:3306", "s3:3306"]).await;

        let status = cluster.status().await.unwrap();
        assert_eq!(status.status, GroupStatus::Ok);
        assert_eq!(status.fault_tolerance, 1);
        assert_eq!(status.primary, Some(addr("s1:3306")));
        assert_eq!(status.members.len(), 3);
        assert!(status.members.iter().all(|m| m.status == InstanceStatus::Online));

        let primary = status.members.iter().find(|m| m.address == addr("s1:3306")).unwrap();
        assert_eq!(primary.mode, "R/W");

        h.fleet.execute_transactions("s1:3306", 10).await.unwrap();
        assert_eq!(h.fleet.gtid_executed("s3:3306").await.unwrap().count(), 10);
        assert_eq!(h.fleet.group_members("s2:3306").await.len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_cluster_name_rejected() {
        let h = harness(&["s1:3306", "s2:3306"]).await;
        h.cluster("main", &["s1:3306"]).await;

        let err = h
            .engine
            .create_cluster("main", "s2:3306", CreateClusterOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_seed_already_in_cluster_rejected() {
        let h = harness(&["s1:3306"]).await;
        h.cluster("main", &["s1:3306"]).await;

        let err = h
            .engine
            .create_cluster("other", "s1:3306", CreateClusterOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_describe_reads_metadata_only() {
        let h = harness(&["s1:3306", "s2:3306"]).await;
        let cluster = h.cluster("main", &["s1:3306", "s2:3306"]).await;
        h.fleet.kill("s2:3306").await.unwrap();

        let description = cluster.describe().await.unwrap();
        assert_eq!(description.name, "main");
        assert_eq!(description.kind, "InnoDBCluster");
        assert_eq!(description.instances.len(), 2);
        assert_eq!(format!("{:?}", cluster), "Cluster { name: \"main\", dissolved: false }");
    }
}

mod add_tests {
    use super::*;

    #[tokio::test]
    async fn test_check_instance_state() {
        let h = harness(&["s1:3306", "s2:3306", "s3:3306"]).await;
        let cluster = h.cluster("main", &["s1:3306"]).await;
        h.fleet.execute_transactions("s1:3306", 3).await.unwrap();
        h.fleet.inject_errant_transactions("s3:3306", 1).await.unwrap();

        let fresh = cluster.check_instance_state("s2:3306").await.unwrap();
        assert_eq!((fresh.state.as_str(), fresh.reason.as_str()), ("warning", "new"));

        let errant = cluster.check_instance_state("s3:3306").await.unwrap();
        assert_eq!((errant.state.as_str(), errant.reason.as_str()), ("error", "diverged"));
    }

    #[tokio::test]
    async fn test_add_with_errant_transactions_rejected() {
        let h = harness(&["s1:3306", "s2:3306"]).await;
        let cluster = h.cluster("main", &["s1:3306"]).await;
        h.fleet.execute_transactions("s1:3306", 3).await.unwrap();
        h.fleet.inject_errant_transactions("s2:3306", 2).await.unwrap();

        let err = cluster
            .add_instance("s2:3306", AddInstanceOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert!(err.to_string().contains("errant transactions"));
        assert!(h.fleet.group_members("s2:3306").await.is_empty());
    }

    #[tokio::test]
    async fn test_add_with_clone_overwrites_errant_transactions() {
        let h = harness(&["s1:3306", "s2:3306"]).await;
        let cluster = h.cluster("main", &["s1:3306"]).await;
        h.fleet.execute_transactions("s1:3306", 3).await.unwrap();
        h.fleet.inject_errant_transactions("s2:3306", 2).await.unwrap();

        cluster
            .add_instance(
                "s2:3306",
                AddInstanceOptions {
                    recovery_method: Some(RecoveryMethod::Clone),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            h.fleet.gtid_executed("s2:3306").await,
            h.fleet.gtid_executed("s1:3306").await
        );
    }

    #[tokio::test]
    async fn test_dry_run_executes_nothing() {
        let h = harness(&["s1:3306", "s2:3306"]).await;
        let cluster = h.cluster("main", &["s1:3306"]).await;
        let position = h.fleet.journal_len().await;

        cluster
            .add_instance(
                "s2:3306",
                AddInstanceOptions {
                    dry_run: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(h.fleet.commands_since(position).await.is_empty());
        let group = h.engine.metadata().read_group("main").await.unwrap();
        assert!(!group.instances.contains_key(&addr("s2:3306")));
    }

    #[tokio::test]
    async fn test_failed_join_is_reverted() {
        let h = harness(&["s1:3306", "s2:3306"]).await;
        let cluster = h.cluster("main", &["s1:3306"]).await;
        h.fleet.fail_command("s2:3306", "join_group", "boom").await.unwrap();

        assert!(cluster.add_instance("s2:3306", AddInstanceOptions::default()).await.is_err());

        let group = h.engine.metadata().read_group("main").await.unwrap();
        assert_eq!(group.instances.len(), 1);
        let account = format!("mysql_innodb_cluster_{}", 2);
        assert!(!h.fleet.has_account(&account).await);
    }

    #[tokio::test]
    async fn test_read_replica_follows_primary() {
        let h = harness(&["s1:3306", "s2:3306", "r1:3306"]).await;
        let cluster = h.cluster("main", &["s1:3306", "s2:3306"]).await;

        cluster
            .add_replica_instance("r1:3306", AddReplicaOptions::default())
            .await
            .unwrap();
        h.fleet.execute_transactions("s1:3306", 4).await.unwrap();
        assert_eq!(h.fleet.gtid_executed("r1:3306").await.unwrap().count(), 4);

        let status = cluster.status().await.unwrap();
        let replica = status.members.iter().find(|m| m.address == addr("r1:3306")).unwrap();
        assert_eq!(replica.role, InstanceRole::ReadReplica);
        assert_eq!(replica.status, InstanceStatus::Online);
        assert_eq!(status.fault_tolerance, 0);
    }
}

mod remove_tests {
    use super::*;

    #[tokio::test]
    async fn test_primary_cannot_be_removed() {
        let h = harness(&["s1:3306", "s2:3306", "s3:3306"]).await;
        let cluster = h.cluster("main", &["s1:3306", "s2:3306", "s3:3306"]).await;

        let err = cluster
            .remove_instance("s1:3306", RemoveInstanceOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("PRIMARY instance cannot be removed"));
    }

    #[tokio::test]
    async fn test_remove_secondary() {
        let h = harness(&["s1:3306", "s2:3306", "s3:3306"]).await;
        let cluster = h.cluster("main", &["s1:3306", "s2:3306", "s3:3306"]).await;
        h.fleet.execute_transactions("s1:3306", 5).await.unwrap();

        cluster
            .remove_instance("s3:3306", RemoveInstanceOptions::default())
            .await
            .unwrap();

        assert_eq!(h.fleet.group_members("s1:3306").await.len(), 2);
        assert!(h.fleet.group_members("s3:3306").await.is_empty());
        let group = h.engine.metadata().read_group("main").await.unwrap();
        assert!(!group.instances.contains_key(&addr("s3:3306")));
    }

    #[tokio::test]
    async fn test_add_then_remove_restores_membership() {
        let h = harness(&["s1:3306", "s2:3306", "s3:3306", "s4:3306"]).await;
        let cluster = h.cluster("main", &["s1:3306", "s2:3306", "s3:3306"]).await;
        h.fleet.execute_transactions("s1:3306", 2).await.unwrap();

        let members = |status: &topology_core::topology::ClusterStatus| {
            let mut addresses: Vec<InstanceAddress> = status.members.iter().map(|m| m.address.clone()).collect();
            addresses.sort();
            addresses
        };
        let before = cluster.status().await.unwrap();
        let view_before = h.fleet.group_members("s1:3306").await.len();

        cluster.add_instance("s4:3306", AddInstanceOptions::default()).await.unwrap();
        assert_eq!(h.fleet.group_members("s1:3306").await.len(), view_before + 1);
        cluster
            .remove_instance("s4:3306", RemoveInstanceOptions::default())
            .await
            .unwrap();

        let after = cluster.status().await.unwrap();
        assert_eq!(members(&after), members(&before));
        assert_eq!(after.status, before.status);
        assert_eq!(after.fault_tolerance, before.fault_tolerance);
        assert_eq!(h.fleet.group_members("s1:3306").await.len(), view_before);
        let group = h.engine.metadata().read_group("main").await.unwrap();
        assert_eq!(group.instances.values().filter(|i| i.is_voter()).count(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_member_needs_force() {
        let h = harness(&["s1:3306", "s2:3306", "s3:3306"]).await;
        let cluster = h.cluster("main", &["s1:3306", "s2:3306", "s3:3306"]).await;
        h.fleet.kill("s3:3306").await.unwrap();

        let err = cluster
            .remove_instance("s3:3306", RemoveInstanceOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);

        cluster
            .remove_instance(
                "s3:3306",
                RemoveInstanceOptions {
                    force: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let group = h.engine.metadata().read_group("main").await.unwrap();
        assert_eq!(group.instances.len(), 2);
        assert_eq!(h.engine.metrics().forced_overrides, 1);
    }

    #[tokio::test]
    async fn test_last_member_cannot_be_removed() {
        let h = harness(&["s1:3306"]).await;
        let cluster = h.cluster("main", &["s1:3306"]).await;

        let err = cluster
            .remove_instance("s1:3306", RemoveInstanceOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}

mod rejoin_tests {
    use super::*;

    #[tokio::test]
    async fn test_rejoin_after_restart() {
        let h = harness(&["s1:3306", "s2:3306", "s3:3306"]).await;
        let cluster = h.cluster("main", &["s1:3306", "s2:3306", "s3:3306"]).await;
        h.fleet.execute_transactions("s1:3306", 2).await.unwrap();

        h.fleet.kill("s3:3306").await.unwrap();
        h.fleet.execute_transactions("s1:3306", 3).await.unwrap();
        let status = cluster.status().await.unwrap();
        assert_eq!(status.status, GroupStatus::OkNoTolerance);

        h.fleet.restart("s3:3306").await.unwrap();
        cluster
            .rejoin_instance("s3:3306", RejoinOptions::default())
            .await
            .unwrap();

        let status = cluster.status().await.unwrap();
        assert_eq!(status.status, GroupStatus::Ok);
        assert_eq!(h.fleet.gtid_executed("s3:3306").await.unwrap().count(), 5);
    }

    #[tokio::test]
    async fn test_rejoin_active_member_rejected() {
        let h = harness(&["s1:3306", "s2:3306"]).await;
        let cluster = h.cluster("main", &["s1:3306", "s2:3306"]).await;

        let err = cluster
            .rejoin_instance("s2:3306", RejoinOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_rejoin_unknown_instance_rejected() {
        let h = harness(&["s1:3306", "s2:3306"]).await;
        let cluster = h.cluster("main", &["s1:3306"]).await;

        let err = cluster
            .rejoin_instance("s2:3306", RejoinOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("add_instance()"));
    }
}

mod rescan_tests {
    use super::*;

    #[tokio::test]
    async fn test_rescan_reports_obsolete_members() {
        let h = harness(&["s1:3306", "s2:3306", "s3:3306"]).await;
        let cluster = h.cluster("main", &["s1:3306", "s2:3306", "s3:3306"]).await;
        h.fleet.kill("s3:3306").await.unwrap();

        let report = cluster.rescan(RescanOptions::default()).await.unwrap();
        assert_eq!(report.obsolete, vec![addr("s3:3306")]);
        assert!(report.removed.is_empty());

        let report = cluster
            .rescan(RescanOptions {
                remove_obsolete: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(report.removed, vec![addr("s3:3306")]);
        let group = h.engine.metadata().read_group("main").await.unwrap();
        assert_eq!(group.instances.len(), 2);
    }
}

mod dissolve_tests {
    use super::*;

    #[tokio::test]
    async fn test_dissolve_invalidates_handle() {
        let h = harness(&["s1:3306", "s2:3306", "s3:3306"]).await;
        let cluster = h.cluster("main", &["s1:3306", "s2:3306", "s3:3306"]).await;

        let report = cluster.dissolve(DissolveOptions::default()).await.unwrap();
        assert_eq!(report.removed.len(), 3);
        assert!(report.failures.is_empty());
        assert!(h.fleet.group_members("s1:3306").await.is_empty());

        let err = cluster.status().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dissolved);
        let err = cluster.dissolve(DissolveOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dissolved);
        assert!(h.engine.get_cluster("main").await.is_err());
    }

    #[tokio::test]
    async fn test_dissolve_with_unreachable_member_needs_force() {
        let h = harness(&["s1:3306", "s2:3306", "s3:3306"]).await;
        let cluster = h.cluster("main", &["s1:3306", "s2:3306", "s3:3306"]).await;
        h.fleet.kill("s3:3306").await.unwrap();

        assert!(cluster.dissolve(DissolveOptions::default()).await.is_err());
        let report = cluster.dissolve(DissolveOptions { force: true }).await.unwrap();
        assert_eq!(report.removed.len(), 2);
    }
}
