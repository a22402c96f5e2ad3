#![allow(dead_code)]

use std::sync::Arc;
use topology_core::config::EngineConfig;
use topology_core::metadata::{MemoryBackend, MetadataBackend};
use topology_core::topology::{AddInstanceOptions, CreateClusterOptions};
use topology_core::{Cluster, InstanceConnector, SimulatedFleet, TopologyEngine};

/// Short waits so failing scenarios finish quickly
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.timeouts.probe_timeout_ms = 200;
    config.timeouts.sync_timeout_secs = 1;
    config.timeouts.member_online_timeout_secs = 1;
    config.timeouts.poll_interval_ms = 10;
    config.locks.lease_secs = 5;
    config.locks.acquire_timeout_ms = 0;
    config.locks.retry_interval_ms = 10;
    config.metadata.retry_backoff_ms = 5;
    config
}

pub struct Harness {
    pub fleet: Arc<SimulatedFleet>,
    pub backend: Arc<MemoryBackend>,
    pub engine: TopologyEngine,
}

/// Deploy `addresses` and build an engine with installed metadata
pub async fn harness(addresses: &[&str]) -> Harness {
    let fleet = Arc::new(SimulatedFleet::new());
    for address in addresses {
        fleet.deploy(address).await.unwrap();
    }
    let backend = Arc::new(MemoryBackend::new());
    let connector: Arc<dyn InstanceConnector> = fleet.clone();
    let metadata: Arc<dyn MetadataBackend> = backend.clone();
    let engine = TopologyEngine::new(test_config(), connector, metadata);
    engine.install_metadata().await.unwrap();
    Harness { fleet, backend, engine }
}

impl Harness {
    /// Single-primary cluster on `members`, the first one being the primary
    pub async fn cluster(&self, name: &str, members: &[&str]) -> Cluster {
        let cluster = self
            .engine
            .create_cluster(name, members[0], CreateClusterOptions::default())
            .await
            .unwrap();
        for member in &members[1..] {
            cluster
                .add_instance(member, AddInstanceOptions::default())
                .await
                .unwrap();
        }
        cluster
    }
}
