//! Primary changes, quorum loss and complete outages of a replicated group

mod common;

use common::harness;
use serde_json::json;
use topology_core::topology::{ForcePrimaryOptions, RebootOptions, SetPrimaryOptions};
use topology_core::{ErrorKind, GroupMode, GroupStatus, InstanceAddress, InstanceStatus};

fn addr(text: &str) -> InstanceAddress {
    text.parse().unwrap()
}

const MEMBERS: [&str; 3] = ["s1:3306", "s2:3306", "s3:3306"];

mod switchover_tests {
    use super::*;

    #[tokio::test]
    async fn test_set_primary_instance() {
        let h = harness(&MEMBERS).await;
        let cluster = h.cluster("main", &MEMBERS).await;
        h.fleet.execute_transactions("s1:3306", 5).await.unwrap();

        cluster
            .set_primary_instance("s2:3306", SetPrimaryOptions::default())
            .await
            .unwrap();

        assert_eq!(h.fleet.group_primary("s1:3306").await.as_deref(), Some("s2:3306"));
        assert_eq!(h.fleet.super_read_only("s2:3306").await, Some(false));
        assert_eq!(h.fleet.super_read_only("s1:3306").await, Some(true));
        let group = h.engine.metadata().read_group("main").await.unwrap();
        assert_eq!(group.primary, Some(addr("s2:3306")));
        assert_eq!(h.engine.metrics().switchovers, 1);

        h.fleet.execute_transactions("s2:3306", 1).await.unwrap();
        assert_eq!(h.fleet.gtid_executed("s1:3306").await.unwrap().count(), 6);
    }

    #[tokio::test]
    async fn test_set_primary_dry_run() {
        let h = harness(&MEMBERS).await;
        let cluster = h.cluster("main", &MEMBERS).await;
        let position = h.fleet.journal_len().await;

        cluster
            .set_primary_instance(
                "s3:3306",
                SetPrimaryOptions {
                    dry_run: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(h.fleet.commands_since(position).await.is_empty());
        assert_eq!(h.fleet.group_primary("s1:3306").await.as_deref(), Some("s1:3306"));
    }

    #[tokio::test]
    async fn test_set_primary_rejects_current_primary_and_strangers() {
        let h = harness(&["s1:3306", "s2:3306", "x:3306"]).await;
        let cluster = h.cluster("main", &["s1:3306", "s2:3306"]).await;

        let err = cluster
            .set_primary_instance("s1:3306", SetPrimaryOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already the PRIMARY"));

        let err = cluster
            .set_primary_instance("x:3306", SetPrimaryOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_failed_switchover_restores_primary() {
        let h = harness(&MEMBERS).await;
        let cluster = h.cluster("main", &MEMBERS).await;
        h.fleet.fail_command_times("s2:3306", "set_primary", 1).await.unwrap();

        assert!(cluster
            .set_primary_instance("s2:3306", SetPrimaryOptions::default())
            .await
            .is_err());
        assert_eq!(h.fleet.group_primary("s1:3306").await.as_deref(), Some("s1:3306"));
        let group = h.engine.metadata().read_group("main").await.unwrap();
        assert_eq!(group.primary, Some(addr("s1:3306")));
    }
}

mod quorum_tests {
    use super::*;

    #[tokio::test]
    async fn test_force_quorum_using_partition() {
        let h = harness(&MEMBERS).await;
        let cluster = h.cluster("main", &MEMBERS).await;
        h.fleet.execute_transactions("s1:3306", 3).await.unwrap();

        h.fleet.kill_many(&["s2:3306", "s3:3306"]).await.unwrap();
        let status = cluster.status().await.unwrap();
        assert_eq!(status.status, GroupStatus::NoQuorum);
        assert!(h.fleet.execute_transactions("s1:3306", 1).await.is_err());

        cluster.force_quorum_using_partition_of("s1:3306").await.unwrap();

        let status = cluster.status().await.unwrap();
        assert_eq!(status.status, GroupStatus::OkNoTolerance);
        let online = status.members.iter().filter(|m| m.status == InstanceStatus::Online).count();
        let missing = status.members.iter().filter(|m| m.status == InstanceStatus::Missing).count();
        assert_eq!((online, missing), (1, 2));
        h.fleet.execute_transactions("s1:3306", 1).await.unwrap();
        assert_eq!(h.engine.metrics().forced_overrides, 1);
    }

    #[tokio::test]
    async fn test_force_quorum_on_healthy_cluster_rejected() {
        let h = harness(&MEMBERS).await;
        let cluster = h.cluster("main", &MEMBERS).await;

        let err = cluster.force_quorum_using_partition_of("s1:3306").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Quorum);
    }

    #[tokio::test]
    async fn test_force_primary_with_quorum_rejected() {
        let h = harness(&MEMBERS).await;
        let cluster = h.cluster("main", &MEMBERS).await;

        let err = cluster
            .force_primary_instance(None, ForcePrimaryOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Quorum);
    }

    #[tokio::test]
    async fn test_operations_blocked_without_quorum() {
        let h = harness(&["s1:3306", "s2:3306", "s3:3306", "s4:3306"]).await;
        let cluster = h.cluster("main", &MEMBERS).await;
        h.fleet.kill_many(&["s2:3306", "s3:3306"]).await.unwrap();

        let err = cluster
            .add_instance("s4:3306", Default::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Quorum);
        let err = cluster
            .set_option("expelTimeout", json!(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Quorum);
    }
}

mod outage_tests {
    use super::*;

    async fn full_outage(h: &common::Harness) {
        h.fleet.kill_many(&MEMBERS).await.unwrap();
        for member in MEMBERS {
            h.fleet.restart(member).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_reboot_from_complete_outage() {
        let h = harness(&MEMBERS).await;
        let cluster = h.cluster("main", &MEMBERS).await;
        h.fleet.execute_transactions("s1:3306", 5).await.unwrap();
        full_outage(&h).await;
        assert_eq!(cluster.status().await.unwrap().status, GroupStatus::Unavailable);

        let report = h
            .engine
            .reboot_cluster_from_complete_outage("main", RebootOptions::default())
            .await
            .unwrap();

        assert_eq!(report.rejoined.len(), 2);
        assert!(report.skipped.is_empty());
        let status = cluster.status().await.unwrap();
        assert_eq!(status.status, GroupStatus::Ok);
        assert_eq!(status.primary, Some(report.seed));
    }

    #[tokio::test]
    async fn test_reboot_prefers_most_advanced_member() {
        let h = harness(&MEMBERS).await;
        let cluster = h.cluster("main", &MEMBERS).await;
        h.fleet.execute_transactions("s1:3306", 2).await.unwrap();
        h.fleet.stall("s2:3306", true).await.unwrap();
        h.fleet.execute_transactions("s1:3306", 3).await.unwrap();
        h.fleet.kill_many(&MEMBERS).await.unwrap();
        h.fleet.stall("s2:3306", false).await.unwrap();
        for member in MEMBERS {
            h.fleet.restart(member).await.unwrap();
        }
        assert!(h.fleet.gtid_executed("s2:3306").await.unwrap().count() < 5);

        let report = h
            .engine
            .reboot_cluster_from_complete_outage("main", RebootOptions::default())
            .await
            .unwrap();
        assert_ne!(report.seed, addr("s2:3306"));
        assert_eq!(cluster.status().await.unwrap().status, GroupStatus::Ok);
        assert_eq!(h.fleet.gtid_executed("s2:3306").await.unwrap().count(), 5);
    }

    #[tokio::test]
    async fn test_reboot_refuses_empty_seed() {
        let h = harness(&MEMBERS).await;
        h.cluster("main", &MEMBERS).await;
        full_outage(&h).await;
        let before = h.engine.metadata().read_group("main").await.unwrap();
        let position = h.fleet.journal_len().await;

        let err = h
            .engine
            .reboot_cluster_from_complete_outage("main", RebootOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);
        assert!(err.to_string().contains("empty GTID set"));

        assert!(h.fleet.commands_since(position).await.is_empty());
        assert_eq!(h.engine.metadata().read_group("main").await.unwrap(), before);
        for member in MEMBERS {
            assert!(h.fleet.group_members(member).await.is_empty());
        }

        h.engine
            .reboot_cluster_from_complete_outage(
                "main",
                RebootOptions {
                    force: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reboot_with_unreachable_member() {
        let h = harness(&MEMBERS).await;
        let cluster = h.cluster("main", &MEMBERS).await;
        h.fleet.execute_transactions("s1:3306", 5).await.unwrap();
        h.fleet.kill_many(&MEMBERS).await.unwrap();
        h.fleet.restart("s1:3306").await.unwrap();
        h.fleet.restart("s2:3306").await.unwrap();

        let err = h
            .engine
            .reboot_cluster_from_complete_outage("main", RebootOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);

        let report = h
            .engine
            .reboot_cluster_from_complete_outage(
                "main",
                RebootOptions {
                    force: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(report.unreachable, vec![addr("s3:3306")]);
        assert_eq!(report.rejoined.len(), 1);
        assert_eq!(cluster.status().await.unwrap().status, GroupStatus::OkNoTolerance);
    }

    #[tokio::test]
    async fn test_reboot_of_running_cluster_rejected() {
        let h = harness(&MEMBERS).await;
        h.cluster("main", &MEMBERS).await;

        let err = h
            .engine
            .reboot_cluster_from_complete_outage("main", RebootOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}

mod mode_tests {
    use super::*;

    #[tokio::test]
    async fn test_switch_topology_mode() {
        let h = harness(&MEMBERS).await;
        let cluster = h.cluster("main", &MEMBERS).await;

        cluster.switch_to_multi_primary_mode().await.unwrap();
        let status = cluster.status().await.unwrap();
        assert_eq!(status.mode, Some(GroupMode::MultiPrimary));
        assert!(status.members.iter().all(|m| m.mode == "R/W"));
        h.fleet.execute_transactions("s3:3306", 1).await.unwrap();

        let err = cluster.switch_to_multi_primary_mode().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        cluster.switch_to_single_primary_mode(Some("s2:3306")).await.unwrap();
        let status = cluster.status().await.unwrap();
        assert_eq!(status.mode, Some(GroupMode::SinglePrimary));
        assert_eq!(status.primary, Some(addr("s2:3306")));
        let group = h.engine.metadata().read_group("main").await.unwrap();
        assert_eq!(group.primary, Some(addr("s2:3306")));
    }
}

mod option_tests {
    use super::*;

    #[tokio::test]
    async fn test_group_option_reaches_members() {
        let h = harness(&MEMBERS).await;
        let cluster = h.cluster("main", &MEMBERS).await;

        cluster.set_option("expelTimeout", json!(10)).await.unwrap();
        for member in MEMBERS {
            assert_eq!(
                h.fleet.variable(member, "group_replication_member_expel_timeout").await.as_deref(),
                Some("10")
            );
        }
        assert_eq!(cluster.options().await.unwrap().global.expel_timeout, 10);

        let err = cluster.set_option("bogus", json!(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = cluster.set_option("expelTimeout", json!(4000)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_instance_options_and_tags() {
        let h = harness(&MEMBERS).await;
        let cluster = h.cluster("main", &MEMBERS).await;

        cluster.set_instance_option("s2:3306", "label", json!("east")).await.unwrap();
        cluster.set_instance_option("s2:3306", "priority", json!(90)).await.unwrap();
        cluster.set_option("tag:rack", json!("r1")).await.unwrap();

        let options = cluster.options().await.unwrap();
        let s2 = &options.instances[&addr("s2:3306")];
        assert_eq!(s2.label, "east");
        assert_eq!(s2.priority, 90);
        assert_eq!(options.tags.get("rack"), Some(&json!("r1")));

        let err = cluster
            .set_instance_option("s3:3306", "label", json!("east"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already used"));
        let err = cluster
            .set_instance_option("s3:3306", "priority", json!(101))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        cluster.set_option("tag:rack", json!(null)).await.unwrap();
        assert!(cluster.options().await.unwrap().tags.is_empty());
    }
}
