//! Router registrations and routing options
//!
//! Routers are passive records: the engine stores what they report and the
//! options they should apply, it never reasons about them operationally.

use crate::error::{Result, TopologyError};
use crate::federation::ClusterSet;
use crate::locks::{LockRequest, LockScope};
use crate::metadata::{MetadataDocument, RouterRecord, RouterScope, TopologyScope};
use crate::topology::{Cluster, EngineInner};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;

/// What a router reports when it registers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterRegistration {
    pub version: String,
    /// Endpoint name (`rw`, `ro`, `rw_split`, ...) to port
    pub endpoints: BTreeMap<String, u16>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouterFilter {
    pub hostname: Option<String>,
    /// Only routers that have not checked in for this long (or never)
    pub stale_after: Option<Duration>,
}

impl RouterFilter {
    fn matches(&self, router: &RouterRecord) -> bool {
        if let Some(hostname) = &self.hostname {
            if &router.hostname != hostname {
                return false;
            }
        }
        match (self.stale_after, router.last_check_in) {
            (None, _) => true,
            (Some(_), None) => true,
            (Some(limit), Some(seen)) => Utc::now() - seen > limit,
        }
    }
}

/// Effective routing options: target-wide values plus per-router overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoutingOptions {
    pub global: BTreeMap<String, Value>,
    pub routers: BTreeMap<String, BTreeMap<String, Value>>,
}

/// The group or federation a router serves
#[derive(Debug, Clone, Copy)]
pub(crate) struct RouterTarget<'a> {
    scope: RouterScope,
    name: &'a str,
}

impl<'a> RouterTarget<'a> {
    fn topology_scope(&self) -> TopologyScope {
        match self.scope {
            RouterScope::Group => TopologyScope::Group(self.name.to_string()),
            RouterScope::Federation => TopologyScope::Federation(self.name.to_string()),
        }
    }

    fn describe(&self) -> String {
        match self.scope {
            RouterScope::Group => format!("cluster '{}'", self.name),
            RouterScope::Federation => format!("clusterset '{}'", self.name),
        }
    }

    fn owns(&self, router: &RouterRecord) -> bool {
        router.scope == self.scope && router.target == self.name
    }

    fn exists_in(&self, document: &MetadataDocument) -> bool {
        match self.scope {
            RouterScope::Group => document.groups.contains_key(self.name),
            RouterScope::Federation => document.federations.contains_key(self.name),
        }
    }

    fn options_in<'d>(&self, document: &'d mut MetadataDocument) -> Option<&'d mut BTreeMap<String, Value>> {
        match self.scope {
            RouterScope::Group => document.groups.get_mut(self.name).map(|g| &mut g.routing_options),
            RouterScope::Federation => document.federations.get_mut(self.name).map(|f| &mut f.routing_options),
        }
    }

    fn not_found(&self) -> TopologyError {
        TopologyError::NotFound(format!("The {} does not exist", self.describe()))
    }
}

pub fn router_id(hostname: &str, name: &str) -> String {
    format!("{}::{}", hostname, name)
}

/// Defaults reported for options that were never set
fn default_options(scope: RouterScope) -> BTreeMap<String, Value> {
    let mut options = BTreeMap::new();
    options.insert("read_only_targets".to_string(), json!("secondaries"));
    options.insert("stats_updates_frequency".to_string(), json!(0));
    options.insert("tags".to_string(), json!({}));
    if scope == RouterScope::Federation {
        options.insert("target_cluster".to_string(), json!("primary"));
        options.insert("invalidated_cluster_policy".to_string(), json!("drop_all"));
        options.insert("use_replica_primary_as_rw".to_string(), json!(false));
    }
    options
}

fn expect_choice(option: &str, value: &Value, choices: &[&str]) -> Result<()> {
    match value.as_str() {
        Some(v) if choices.contains(&v) => Ok(()),
        _ => Err(TopologyError::Validation(format!(
            "Invalid value for routing option '{}', accepted values: {}",
            option,
            choices.join(", ")
        ))),
    }
}

fn validate_routing_option(target: RouterTarget<'_>, document: &MetadataDocument, option: &str, value: &Value) -> Result<()> {
    if value.is_null() {
        return Ok(());
    }
    let federation_only = matches!(
        option,
        "target_cluster" | "invalidated_cluster_policy" | "use_replica_primary_as_rw"
    );
    if federation_only && target.scope != RouterScope::Federation {
        return Err(TopologyError::Validation(format!(
            "The routing option '{}' only applies to clustersets",
            option
        )));
    }
    match option {
        "read_only_targets" => expect_choice(option, value, &["all", "read_replicas", "secondaries"]),
        "invalidated_cluster_policy" => expect_choice(option, value, &["drop_all", "accept_ro"]),
        "stats_updates_frequency" => match value.as_u64() {
            Some(_) => Ok(()),
            None => Err(TopologyError::Validation(
                "Invalid value for routing option 'stats_updates_frequency', value is expected to be a non-negative integer"
                    .to_string(),
            )),
        },
        "use_replica_primary_as_rw" => match value {
            Value::Bool(_) => Ok(()),
            _ => Err(TopologyError::Validation(
                "Invalid value for routing option 'use_replica_primary_as_rw', value is expected to be a boolean"
                    .to_string(),
            )),
        },
        "tags" => match value {
            Value::Object(_) => Ok(()),
            _ => Err(TopologyError::Validation(
                "Invalid value for routing option 'tags', value is expected to be an object".to_string(),
            )),
        },
        "target_cluster" => {
            let valid = match value.as_str() {
                Some("primary") => true,
                Some(cluster) => document
                    .federations
                    .get(target.name)
                    .map(|f| f.members.contains_key(cluster))
                    .unwrap_or(false),
                None => false,
            };
            if valid {
                Ok(())
            } else {
                Err(TopologyError::Validation(format!(
                    "Invalid value for routing option 'target_cluster': expected 'primary' or a cluster of the {}",
                    target.describe()
                )))
            }
        }
        other => Err(TopologyError::Validation(format!("Unsupported routing option '{}'", other))),
    }
}

/// Null removes the option so the default applies again
fn apply_option(options: &mut BTreeMap<String, Value>, option: &str, value: &Value) {
    if value.is_null() {
        options.remove(option);
    } else {
        options.insert(option.to_string(), value.clone());
    }
}

impl EngineInner {
    pub(crate) async fn register_router(
        &self,
        target: RouterTarget<'_>,
        hostname: &str,
        name: &str,
        registration: &RouterRegistration,
    ) -> Result<RouterRecord> {
        if hostname.trim().is_empty() {
            return Err(TopologyError::Validation("Router hostname cannot be empty".to_string()));
        }
        let id = router_id(hostname, name);
        self.store
            .write_topology(TopologyScope::Routers, None, |document| {
                if !target.exists_in(document) {
                    return Err(target.not_found());
                }
                let routing_options = match document.routers.get(&id) {
                    Some(existing) if !target.owns(existing) => {
                        return Err(TopologyError::Validation(format!(
                            "The router '{}' is already registered for another {} '{}'",
                            id,
                            if existing.scope == RouterScope::Group { "cluster" } else { "clusterset" },
                            existing.target
                        )))
                    }
                    Some(existing) => existing.routing_options.clone(),
                    None => BTreeMap::new(),
                };
                let record = RouterRecord {
                    id: id.clone(),
                    hostname: hostname.to_string(),
                    name: name.to_string(),
                    scope: target.scope,
                    target: target.name.to_string(),
                    version: registration.version.clone(),
                    endpoints: registration.endpoints.clone(),
                    last_check_in: Some(Utc::now()),
                    routing_options,
                };
                document.routers.insert(id.clone(), record.clone());
                Ok(record)
            })
            .await
    }

    pub(crate) async fn router_check_in(&self, target: RouterTarget<'_>, id: &str) -> Result<()> {
        self.store
            .write_topology(TopologyScope::Routers, None, |document| {
                let router = document
                    .routers
                    .get_mut(id)
                    .filter(|r| target.owns(r))
                    .ok_or_else(|| TopologyError::NotFound(format!("Router '{}' is not registered in the {}", id, target.describe())))?;
                router.last_check_in = Some(Utc::now());
                Ok(())
            })
            .await
    }

    pub(crate) async fn list_routers(
        &self,
        target: RouterTarget<'_>,
        filter: &RouterFilter,
    ) -> Result<BTreeMap<String, RouterRecord>> {
        let document = self.store.read_topology().await?;
        if !target.exists_in(&document) {
            return Err(target.not_found());
        }
        Ok(document
            .routers
            .into_iter()
            .filter(|(_, r)| target.owns(r) && filter.matches(r))
            .collect())
    }

    pub(crate) async fn remove_router(&self, target: RouterTarget<'_>, id: &str) -> Result<()> {
        self.store
            .write_topology(TopologyScope::Routers, None, |document| {
                match document.routers.get(id) {
                    Some(router) if target.owns(router) => {
                        document.routers.remove(id);
                        Ok(())
                    }
                    _ => Err(TopologyError::NotFound(format!(
                        "Invalid router instance '{}' for the {}",
                        id,
                        target.describe()
                    ))),
                }
            })
            .await?;
        tracing::info!("Router '{}' removed from the {}", id, target.describe());
        Ok(())
    }

    /// Set an option for every router of the target, or for one router when `router` is given
    pub(crate) async fn set_routing_option(
        &self,
        target: RouterTarget<'_>,
        router: Option<&str>,
        option: &str,
        value: &Value,
    ) -> Result<()> {
        let scope = match router {
            Some(_) => TopologyScope::Routers,
            None => target.topology_scope(),
        };
        self.store
            .write_topology(scope, None, |document| {
                validate_routing_option(target, document, option, value)?;
                let options = match router {
                    Some(id) => document
                        .routers
                        .get_mut(id)
                        .filter(|r| target.owns(r))
                        .map(|r| &mut r.routing_options)
                        .ok_or_else(|| TopologyError::NotFound(format!("Router '{}' is not registered in the {}", id, target.describe())))?,
                    None => target.options_in(document).ok_or_else(|| target.not_found())?,
                };
                apply_option(options, option, value);
                Ok(())
            })
            .await
    }

    pub(crate) async fn routing_options(&self, target: RouterTarget<'_>) -> Result<RoutingOptions> {
        let document = self.store.read_topology().await?;
        let stored = match target.scope {
            RouterScope::Group => document.groups.get(target.name).map(|g| g.routing_options.clone()),
            RouterScope::Federation => document.federations.get(target.name).map(|f| f.routing_options.clone()),
        }
        .ok_or_else(|| target.not_found())?;

        let mut global = default_options(target.scope);
        global.extend(stored);
        let routers = document
            .routers
            .values()
            .filter(|r| target.owns(r))
            .map(|r| {
                let mut effective = global.clone();
                effective.extend(r.routing_options.clone());
                (r.id.clone(), effective)
            })
            .collect();
        Ok(RoutingOptions { global, routers })
    }
}

impl Cluster {
    fn router_target(&self) -> RouterTarget<'_> {
        RouterTarget {
            scope: RouterScope::Group,
            name: &self.name,
        }
    }

    async fn with_shared_lock<T, Fut>(&self, operation: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let locks = self
            .engine
            .lock(vec![LockRequest::shared(LockScope::Group(self.name.clone()))], operation, false)
            .await?;
        let result = fut.await;
        locks.release().await;
        result
    }

    pub async fn register_router(&self, hostname: &str, name: &str, registration: RouterRegistration) -> Result<RouterRecord> {
        self.run(
            "registerRouter",
            self.with_shared_lock(
                "registerRouter",
                self.engine.register_router(self.router_target(), hostname, name, &registration),
            ),
        )
        .await
    }

    pub async fn router_check_in(&self, id: &str) -> Result<()> {
        self.run("routerCheckIn", self.engine.router_check_in(self.router_target(), id))
            .await
    }

    pub async fn list_routers(&self, filter: RouterFilter) -> Result<BTreeMap<String, RouterRecord>> {
        self.run("listRouters", self.engine.list_routers(self.router_target(), &filter))
            .await
    }

    pub async fn remove_router_metadata(&self, id: &str) -> Result<()> {
        self.run(
            "removeRouterMetadata",
            self.with_shared_lock("removeRouterMetadata", self.engine.remove_router(self.router_target(), id)),
        )
        .await
    }

    pub async fn set_routing_option(&self, router: Option<&str>, option: &str, value: Value) -> Result<()> {
        self.run(
            "setRoutingOption",
            self.with_shared_lock(
                "setRoutingOption",
                self.engine.set_routing_option(self.router_target(), router, option, &value),
            ),
        )
        .await
    }

    pub async fn routing_options(&self) -> Result<RoutingOptions> {
        self.run("routingOptions", self.engine.routing_options(self.router_target()))
            .await
    }
}

impl ClusterSet {
    fn router_target(&self) -> RouterTarget<'_> {
        RouterTarget {
            scope: RouterScope::Federation,
            name: &self.domain,
        }
    }

    /// Shared locks on every member group
    async fn with_shared_lock<T, Fut>(&self, operation: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let federation = self.record().await?;
        let requests = federation
            .members
            .keys()
            .map(|name| LockRequest::shared(LockScope::Group(name.clone())))
            .collect();
        let locks = self.engine.lock(requests, operation, false).await?;
        let result = fut.await;
        locks.release().await;
        result
    }

    pub async fn register_router(&self, hostname: &str, name: &str, registration: RouterRegistration) -> Result<RouterRecord> {
        self.run(
            "registerRouter",
            self.with_shared_lock(
                "registerRouter",
                self.engine.register_router(self.router_target(), hostname, name, &registration),
            ),
        )
        .await
    }

    pub async fn router_check_in(&self, id: &str) -> Result<()> {
        self.run("routerCheckIn", self.engine.router_check_in(self.router_target(), id))
            .await
    }

    pub async fn list_routers(&self, filter: RouterFilter) -> Result<BTreeMap<String, RouterRecord>> {
        self.run("listRouters", self.engine.list_routers(self.router_target(), &filter))
            .await
    }

    pub async fn remove_router_metadata(&self, id: &str) -> Result<()> {
        self.run(
            "removeRouterMetadata",
            self.with_shared_lock("removeRouterMetadata", self.engine.remove_router(self.router_target(), id)),
        )
        .await
    }

    pub async fn set_routing_option(&self, router: Option<&str>, option: &str, value: Value) -> Result<()> {
        self.run(
            "setRoutingOption",
            self.with_shared_lock(
                "setRoutingOption",
                self.engine.set_routing_option(self.router_target(), router, option, &value),
            ),
        )
        .await
    }

    pub async fn routing_options(&self) -> Result<RoutingOptions> {
        self.run("routingOptions", self.engine.routing_options(self.router_target()))
            .await
    }
}
