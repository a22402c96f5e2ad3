//! Topology orchestration for replicated database groups, async replica sets
//! and federations of groups ("clustersets").
//!
//! All state lives in a versioned metadata document; instances are driven
//! through the [`connector::InstanceConnector`] collaborator.

pub mod address;
pub mod config;
pub mod config_manager;
pub mod connector;
pub mod error;
pub mod federation;
pub mod gtid;
pub mod locks;
pub mod log;
pub mod membership;
pub mod metadata;
pub mod metrics;
pub mod routers;
pub mod sim;
pub mod topology;
pub mod trace;
pub mod wait;

pub use address::InstanceAddress;
pub use config::EngineConfig;
pub use config_manager::{ConfigManager, ConfigValidator};
pub use connector::{
    ChannelStatus, ConnectorError, GroupMode, InstanceConnector, InstanceProbe, MemberRole, MemberState,
    ReplicationCommand,
};
pub use error::{ErrorKind, MemberFailure, MetadataError, Result, TopologyError};
pub use federation::{
    ClusterSet, ClusterSetDescription, ClusterSetStatus, CreateReplicaClusterOptions, FederationStatus,
    ForcePrimaryClusterOptions, RejoinClusterOptions, RemoveClusterOptions, SetPrimaryClusterOptions,
};
pub use gtid::{GtidAssessment, GtidSet, RecoveryMethod};
pub use locks::{LockManager, LockMode, LockRequest, LockScope};
pub use membership::{GroupStatus, InstanceStatus, TopologyView};
pub use metadata::{FederationRole, InstanceRole, MetadataStore, ReplicationSources, RouterRecord};
pub use routers::{RouterFilter, RouterRegistration, RoutingOptions};
pub use sim::SimulatedFleet;
pub use topology::{Cluster, TopologyEngine};
