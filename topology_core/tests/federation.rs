//! Clustersets: replica clusters, switchover, failover and rejoin

mod common;

use common::{harness, Harness};
use topology_core::connector::CLUSTERSET_CHANNEL;
use topology_core::topology::{CreateReplicaSetOptions, DissolveOptions, RebootOptions};
use topology_core::{
    ClusterSet, CreateReplicaClusterOptions, ErrorKind, FederationRole, FederationStatus, ForcePrimaryClusterOptions,
    RejoinClusterOptions, RemoveClusterOptions, SetPrimaryClusterOptions,
};

/// Primary cluster "alpha" on a1..a3 with 4 transactions and a clusterset "global"
async fn federation(h: &Harness) -> ClusterSet {
    let alpha = h.cluster("alpha", &["a1:3306", "a2:3306", "a3:3306"]).await;
    h.fleet.execute_transactions("a1:3306", 4).await.unwrap();
    alpha.create_cluster_set("global").await.unwrap()
}

async fn replica(h: &Harness, set: &ClusterSet, seed: &str, name: &str) {
    set.create_replica_cluster(seed, name, CreateReplicaClusterOptions::default())
        .await
        .unwrap();
    assert!(h.fleet.channel(seed, CLUSTERSET_CHANNEL).await.unwrap().is_healthy());
}

async fn role(h: &Harness, name: &str) -> Option<FederationRole> {
    h.engine
        .metadata()
        .read_federation("global")
        .await
        .unwrap()
        .role_of(name)
}

mod creation_tests {
    use super::*;

    #[tokio::test]
    async fn test_replica_cluster_replicates_primary() {
        let h = harness(&["a1:3306", "a2:3306", "a3:3306", "b1:3306", "b2:3306"]).await;
        let set = federation(&h).await;
        replica(&h, &set, "b1:3306", "beta").await;

        assert_eq!(h.fleet.gtid_executed("b1:3306").await.unwrap().count(), 4);
        assert_eq!(h.fleet.super_read_only("b1:3306").await, Some(true));
        assert_eq!(
            h.fleet.variable("b1:3306", "group_replication_transaction_size_limit").await.as_deref(),
            Some("0")
        );
        assert!(h.fleet.has_account("mysql_innodb_cs_4").await);

        let beta = h.engine.get_cluster("beta").await.unwrap();
        beta.add_instance("b2:3306", Default::default()).await.unwrap();
        h.fleet.execute_transactions("a1:3306", 2).await.unwrap();
        assert_eq!(h.fleet.gtid_executed("b2:3306").await.unwrap().count(), 6);

        let status = set.status().await.unwrap();
        assert_eq!(status.status, FederationStatus::Healthy);
        assert_eq!(status.primary_cluster, "alpha");
        assert_eq!(format!("{:?}", set), "ClusterSet { domain: \"global\" }");
        let beta_status = status.clusters.iter().find(|c| c.name == "beta").unwrap();
        assert_eq!(beta_status.global_status, "OK");
        assert_eq!(beta_status.transaction_lag, Some(0));

        let description = set.describe().await.unwrap();
        assert_eq!(description.clusters.len(), 2);
        assert_eq!(role(&h, "beta").await, Some(FederationRole::Replica));
    }

    #[tokio::test]
    async fn test_clusterset_requires_single_primary_cluster() {
        let h = harness(&["a1:3306", "r1:3306"]).await;
        let alpha = h.cluster("alpha", &["a1:3306"]).await;
        alpha.switch_to_multi_primary_mode().await.unwrap();
        let err = alpha.create_cluster_set("global").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let rs = h
            .engine
            .create_replica_set("rs", "r1:3306", CreateReplicaSetOptions::default())
            .await
            .unwrap();
        let err = rs.create_cluster_set("other").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_cluster_joins_one_clusterset_only() {
        let h = harness(&["a1:3306", "a2:3306", "a3:3306"]).await;
        federation(&h).await;
        let alpha = h.engine.get_cluster("alpha").await.unwrap();

        let err = alpha.create_cluster_set("second").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = alpha.switch_to_multi_primary_mode().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = alpha.dissolve(DissolveOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_replica_cluster_dry_run() {
        let h = harness(&["a1:3306", "a2:3306", "a3:3306", "b1:3306"]).await;
        let set = federation(&h).await;
        let position = h.fleet.journal_len().await;

        set.create_replica_cluster(
            "b1:3306",
            "beta",
            CreateReplicaClusterOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(h.fleet.commands_since(position).await.is_empty());
        assert_eq!(role(&h, "beta").await, None);
        assert!(h.engine.get_cluster("beta").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_replica_cluster_is_reverted() {
        let h = harness(&["a1:3306", "a2:3306", "a3:3306", "b1:3306"]).await;
        let set = federation(&h).await;
        h.fleet.fail_command("b1:3306", "start_channel", "no route").await.unwrap();

        assert!(set
            .create_replica_cluster("b1:3306", "beta", CreateReplicaClusterOptions::default())
            .await
            .is_err());
        assert!(h.fleet.group_members("b1:3306").await.is_empty());
        assert!(h.fleet.channel("b1:3306", CLUSTERSET_CHANNEL).await.is_none());
        assert!(!h.fleet.has_account("mysql_innodb_cs_4").await);
        assert_eq!(role(&h, "beta").await, None);
    }
}

mod switchover_tests {
    use super::*;

    #[tokio::test]
    async fn test_set_primary_cluster() {
        let h = harness(&["a1:3306", "a2:3306", "a3:3306", "b1:3306"]).await;
        let set = federation(&h).await;
        replica(&h, &set, "b1:3306", "beta").await;

        set.set_primary_cluster("beta", SetPrimaryClusterOptions::default())
            .await
            .unwrap();

        assert_eq!(role(&h, "beta").await, Some(FederationRole::Primary));
        assert_eq!(role(&h, "alpha").await, Some(FederationRole::Replica));
        assert_eq!(h.fleet.super_read_only("b1:3306").await, Some(false));
        assert_eq!(h.fleet.super_read_only("a1:3306").await, Some(true));
        assert!(h.fleet.channel("b1:3306", CLUSTERSET_CHANNEL).await.is_none());
        assert!(h.fleet.channel("a1:3306", CLUSTERSET_CHANNEL).await.unwrap().is_healthy());

        h.fleet.execute_transactions("b1:3306", 3).await.unwrap();
        assert_eq!(h.fleet.gtid_executed("a3:3306").await.unwrap().count(), 7);
        assert!(h.fleet.execute_transactions("a1:3306", 1).await.is_err());

        let status = set.status().await.unwrap();
        assert_eq!(status.status, FederationStatus::Healthy);
        assert_eq!(h.engine.metrics().switchovers, 1);
    }

    #[tokio::test]
    async fn test_set_primary_cluster_requires_listing_unreachable_replicas() {
        let h = harness(&["a1:3306", "a2:3306", "a3:3306", "b1:3306", "c1:3306"]).await;
        let set = federation(&h).await;
        replica(&h, &set, "b1:3306", "beta").await;
        replica(&h, &set, "c1:3306", "gamma").await;
        h.fleet.kill("c1:3306").await.unwrap();

        let err = set
            .set_primary_cluster(
                "beta",
                SetPrimaryClusterOptions {
                    dry_run: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("gamma"));

        let err = set
            .set_primary_cluster(
                "beta",
                SetPrimaryClusterOptions {
                    invalidate_replica_clusters: vec!["alpha".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        set.set_primary_cluster(
            "beta",
            SetPrimaryClusterOptions {
                invalidate_replica_clusters: vec!["gamma".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(role(&h, "gamma").await, Some(FederationRole::Invalidated));
        assert_eq!(role(&h, "beta").await, Some(FederationRole::Primary));
    }

    #[tokio::test]
    async fn test_set_primary_cluster_rejects_errant_target() {
        let h = harness(&["a1:3306", "a2:3306", "a3:3306", "b1:3306"]).await;
        let set = federation(&h).await;
        replica(&h, &set, "b1:3306", "beta").await;
        h.fleet.inject_errant_transactions("b1:3306", 1).await.unwrap();

        let err = set
            .set_primary_cluster("beta", SetPrimaryClusterOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert_eq!(h.fleet.super_read_only("a1:3306").await, Some(false));

        let status = set.status().await.unwrap();
        let beta = status.clusters.iter().find(|c| c.name == "beta").unwrap();
        assert_eq!(beta.global_status, "OK_NOT_CONSISTENT");
        assert_eq!(status.status, FederationStatus::Available);
    }

    #[tokio::test]
    async fn test_set_primary_cluster_unfences_on_failure() {
        let h = harness(&["a1:3306", "a2:3306", "a3:3306", "b1:3306"]).await;
        let set = federation(&h).await;
        replica(&h, &set, "b1:3306", "beta").await;
        h.fleet.fail_command("b1:3306", "stop_channel", "stuck").await.unwrap();

        assert!(set
            .set_primary_cluster("beta", SetPrimaryClusterOptions::default())
            .await
            .is_err());
        assert_eq!(role(&h, "alpha").await, Some(FederationRole::Primary));
        assert_eq!(h.fleet.super_read_only("a1:3306").await, Some(false));
        h.fleet.execute_transactions("a1:3306", 1).await.unwrap();
    }
}

mod failover_tests {
    use super::*;

    #[tokio::test]
    async fn test_force_primary_cluster_and_rejoin() {
        let h = harness(&["a1:3306", "a2:3306", "a3:3306", "b1:3306"]).await;
        let set = federation(&h).await;
        replica(&h, &set, "b1:3306", "beta").await;

        let err = set
            .force_primary_cluster("beta", ForcePrimaryClusterOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Quorum);
        assert!(err.to_string().contains("set_primary_cluster()"));

        h.fleet.kill_many(&["a1:3306", "a2:3306", "a3:3306"]).await.unwrap();
        let status = set.status().await.unwrap();
        assert_eq!(status.status, FederationStatus::Unavailable);
        let err = set
            .set_primary_cluster("beta", SetPrimaryClusterOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Quorum);

        set.force_primary_cluster("beta", ForcePrimaryClusterOptions::default())
            .await
            .unwrap();
        assert_eq!(role(&h, "beta").await, Some(FederationRole::Primary));
        assert_eq!(role(&h, "alpha").await, Some(FederationRole::Invalidated));
        assert_eq!(h.engine.metrics().failovers, 1);
        h.fleet.execute_transactions("b1:3306", 3).await.unwrap();

        for member in ["a1:3306", "a2:3306", "a3:3306"] {
            h.fleet.restart(member).await.unwrap();
        }
        h.engine
            .reboot_cluster_from_complete_outage("alpha", RebootOptions::default())
            .await
            .unwrap();
        assert_eq!(h.fleet.super_read_only("a1:3306").await, Some(true));

        set.rejoin_cluster("alpha", RejoinClusterOptions::default())
            .await
            .unwrap();
        assert_eq!(role(&h, "alpha").await, Some(FederationRole::Replica));
        assert_eq!(h.fleet.gtid_executed("a2:3306").await.unwrap().count(), 7);
        assert_eq!(set.status().await.unwrap().status, FederationStatus::Healthy);
    }

    #[tokio::test]
    async fn test_errant_transactions_block_rejoin() {
        let h = harness(&["a1:3306", "a2:3306", "a3:3306", "b1:3306"]).await;
        let set = federation(&h).await;
        replica(&h, &set, "b1:3306", "beta").await;

        h.fleet.kill_many(&["a1:3306", "a2:3306", "a3:3306"]).await.unwrap();
        set.force_primary_cluster("beta", ForcePrimaryClusterOptions::default())
            .await
            .unwrap();
        for member in ["a1:3306", "a2:3306", "a3:3306"] {
            h.fleet.restart(member).await.unwrap();
        }
        h.engine
            .reboot_cluster_from_complete_outage("alpha", RebootOptions::default())
            .await
            .unwrap();
        h.fleet.inject_errant_transactions("a1:3306", 2).await.unwrap();

        let err = set
            .rejoin_cluster("alpha", RejoinClusterOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert!(err.to_string().contains("errant transactions"));
        assert_eq!(role(&h, "alpha").await, Some(FederationRole::Invalidated));
    }

    #[tokio::test]
    async fn test_failed_rejoin_reverts_fence() {
        let h = harness(&["a1:3306", "a2:3306", "a3:3306", "b1:3306"]).await;
        let set = federation(&h).await;
        replica(&h, &set, "b1:3306", "beta").await;

        h.fleet.kill_many(&["a1:3306", "a2:3306", "a3:3306"]).await.unwrap();
        set.force_primary_cluster("beta", ForcePrimaryClusterOptions::default())
            .await
            .unwrap();
        for member in ["a1:3306", "a2:3306", "a3:3306"] {
            h.fleet.restart(member).await.unwrap();
        }
        h.engine
            .reboot_cluster_from_complete_outage("alpha", RebootOptions::default())
            .await
            .unwrap();
        let limit = h.fleet.variable("a1:3306", "group_replication_transaction_size_limit").await;
        h.fleet.fail_command_times("a1:3306", "start_channel", 1).await.unwrap();

        assert!(set.rejoin_cluster("alpha", RejoinClusterOptions::default()).await.is_err());
        assert!(h.fleet.channel("a1:3306", CLUSTERSET_CHANNEL).await.is_none());
        assert_eq!(h.fleet.super_read_only("a1:3306").await, Some(true));
        assert_eq!(
            h.fleet.variable("a1:3306", "group_replication_transaction_size_limit").await,
            limit
        );
        assert_eq!(role(&h, "alpha").await, Some(FederationRole::Invalidated));

        set.rejoin_cluster("alpha", RejoinClusterOptions::default())
            .await
            .unwrap();
        assert_eq!(role(&h, "alpha").await, Some(FederationRole::Replica));
    }

    #[tokio::test]
    async fn test_rejoin_rejects_primary_and_strangers() {
        let h = harness(&["a1:3306", "a2:3306", "a3:3306"]).await;
        let set = federation(&h).await;

        let err = set
            .rejoin_cluster("alpha", RejoinClusterOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = set
            .rejoin_cluster("nope", RejoinClusterOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}

mod removal_tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_replica_cluster() {
        let h = harness(&["a1:3306", "a2:3306", "a3:3306", "b1:3306"]).await;
        let set = federation(&h).await;
        replica(&h, &set, "b1:3306", "beta").await;

        let err = set
            .remove_cluster("alpha", RemoveClusterOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        set.remove_cluster("beta", RemoveClusterOptions::default())
            .await
            .unwrap();

        assert_eq!(role(&h, "beta").await, None);
        assert!(h.fleet.channel("b1:3306", CLUSTERSET_CHANNEL).await.is_none());
        assert_eq!(h.fleet.super_read_only("b1:3306").await, Some(false));
        assert_ne!(
            h.fleet.variable("b1:3306", "group_replication_transaction_size_limit").await.as_deref(),
            Some("0")
        );
        let beta = h.engine.metadata().read_group("beta").await.unwrap();
        assert_eq!(beta.federation, None);
        h.fleet.execute_transactions("b1:3306", 1).await.unwrap();
        assert_eq!(h.fleet.gtid_executed("a1:3306").await.unwrap().count(), 4);
    }

    #[tokio::test]
    async fn test_remove_unreachable_replica_needs_force() {
        let h = harness(&["a1:3306", "a2:3306", "a3:3306", "b1:3306"]).await;
        let set = federation(&h).await;
        replica(&h, &set, "b1:3306", "beta").await;
        h.fleet.kill("b1:3306").await.unwrap();

        let err = set
            .remove_cluster("beta", RemoveClusterOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);

        set.remove_cluster(
            "beta",
            RemoveClusterOptions {
                force: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(role(&h, "beta").await, None);
    }

    #[tokio::test]
    async fn test_removing_last_cluster_drops_clusterset() {
        let h = harness(&["a1:3306", "a2:3306", "a3:3306"]).await;
        let set = federation(&h).await;

        set.remove_cluster("alpha", RemoveClusterOptions::default())
            .await
            .unwrap();
        assert!(h.engine.get_cluster_set("global").await.is_err());
        let alpha = h.engine.metadata().read_group("alpha").await.unwrap();
        assert_eq!(alpha.federation, None);
    }
}
