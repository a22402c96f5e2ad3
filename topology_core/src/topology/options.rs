//! Group-wide and per-instance options

use super::remove::inbound_channel;
use super::{parse_address, Cluster};
use crate::address::InstanceAddress;
use crate::config::{CONSISTENCY_LEVELS, EXIT_STATE_ACTIONS};
use crate::connector::ReplicationCommand;
use crate::error::{MemberFailure, Result, TopologyError};
use crate::metadata::{GroupOptions, GroupRecord, InstanceRole, ReplicationSources};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Attribute holding a replica group's own transaction size limit while it is relaxed
pub(crate) const ORIGINAL_TRANSACTION_SIZE_LIMIT: &str = "original_transaction_size_limit";

const BOOLEAN_TAGS: &[&str] = &["_hidden", "_disconnect_existing_sessions_when_hidden"];
const MAX_EXPEL_TIMEOUT: u32 = 3600;
const MAX_AUTO_REJOIN_TRIES: u32 = 2016;
const MAX_MEMBER_PRIORITY: u32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceOptions {
    pub label: String,
    pub priority: u32,
    pub role: InstanceRole,
    pub replication_sources: Option<ReplicationSources>,
    pub tags: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterOptions {
    pub global: GroupOptions,
    pub tags: BTreeMap<String, Value>,
    pub instances: BTreeMap<InstanceAddress, InstanceOptions>,
}

pub(crate) fn validate_group_options(options: &GroupOptions) -> Result<()> {
    if !EXIT_STATE_ACTIONS.contains(&options.exit_state_action.as_str()) {
        return Err(TopologyError::Validation(format!(
            "Invalid value for exitStateAction '{}', accepted values: {}",
            options.exit_state_action,
            EXIT_STATE_ACTIONS.join(", ")
        )));
    }
    if !CONSISTENCY_LEVELS.contains(&options.consistency.as_str()) {
        return Err(TopologyError::Validation(format!(
            "Invalid value for consistency '{}', accepted values: {}",
            options.consistency,
            CONSISTENCY_LEVELS.join(", ")
        )));
    }
    if options.expel_timeout > MAX_EXPEL_TIMEOUT {
        return Err(TopologyError::Validation(format!(
            "Invalid value for expelTimeout, integer value must be in the range [0, {}]",
            MAX_EXPEL_TIMEOUT
        )));
    }
    if options.auto_rejoin_tries > MAX_AUTO_REJOIN_TRIES {
        return Err(TopologyError::Validation(format!(
            "Invalid value for autoRejoinTries, integer value must be in the range [0, {}]",
            MAX_AUTO_REJOIN_TRIES
        )));
    }
    if options.replication_allowed_host.is_empty() {
        return Err(TopologyError::Validation(
            "Invalid value for replicationAllowedHost, string value cannot be empty".to_string(),
        ));
    }
    Ok(())
}

fn as_string(option: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| TopologyError::Validation(format!("Invalid value for {}, expected a string", option)))
}

fn as_u64(option: &str, value: &Value) -> Result<u64> {
    value
        .as_u64()
        .ok_or_else(|| TopologyError::Validation(format!("Invalid value for {}, expected a non-negative integer", option)))
}

fn as_u32(option: &str, value: &Value) -> Result<u32> {
    u32::try_from(as_u64(option, value)?)
        .map_err(|_| TopologyError::Validation(format!("Invalid value for {}, integer value is too large", option)))
}

fn as_bool(option: &str, value: &Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| TopologyError::Validation(format!("Invalid value for {}, expected a boolean", option)))
}

/// Validate a tag assignment; `None` deletes the tag
fn tag_value(tag: &str, value: Value) -> Result<Option<Value>> {
    let mut chars = tag.chars();
    let valid_start = chars.next().map(|c| c.is_ascii_alphabetic() || c == '_').unwrap_or(false);
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(TopologyError::Validation(format!(
            "'{}' is not a valid tag identifier",
            tag
        )));
    }
    if tag.starts_with('_') && !BOOLEAN_TAGS.contains(&tag) {
        return Err(TopologyError::Validation(format!(
            "'{}' is not a valid built-in tag; tags starting with '_' are reserved",
            tag
        )));
    }
    if value.is_null() {
        return Ok(None);
    }
    if BOOLEAN_TAGS.contains(&tag) {
        return Ok(Some(Value::Bool(as_bool(&format!("tag:{}", tag), &value)?)));
    }
    Ok(Some(value))
}

fn apply_tag(tags: &mut BTreeMap<String, Value>, tag: &str, value: Option<Value>) {
    match value {
        Some(v) => {
            tags.insert(tag.to_string(), v);
        }
        None => {
            tags.remove(tag);
        }
    }
}

/// A validated group option change
enum GroupChange {
    Tag(String, Option<Value>),
    /// Persisted option plus the server variable it maps to, if any
    Option {
        apply: Box<dyn Fn(&mut GroupOptions) + Send + Sync>,
        variable: Option<(&'static str, String)>,
    },
    /// Relaxed while the group replicates from a federation primary
    ReplicaTransactionSizeLimit(u64),
}

impl Cluster {
    fn group_change(&self, group: &GroupRecord, option: &str, value: Value) -> Result<GroupChange> {
        if let Some(tag) = option.strip_prefix("tag:") {
            return Ok(GroupChange::Tag(tag.to_string(), tag_value(tag, value)?));
        }
        if group.is_replica_set() && option != "replicationAllowedHost" {
            return Err(TopologyError::Validation(format!(
                "Option '{}' is not supported on replicasets",
                option
            )));
        }

        let mut candidate = group.options.clone();
        let change = match option {
            "transactionSizeLimit" => {
                let limit = as_u64(option, &value)?;
                if group.attributes.contains_key(ORIGINAL_TRANSACTION_SIZE_LIMIT) {
                    return Ok(GroupChange::ReplicaTransactionSizeLimit(limit));
                }
                candidate.transaction_size_limit = limit;
                GroupChange::Option {
                    apply: Box::new(move |o| o.transaction_size_limit = limit),
                    variable: Some(("group_replication_transaction_size_limit", limit.to_string())),
                }
            }
            "expelTimeout" => {
                let timeout = as_u32(option, &value)?;
                candidate.expel_timeout = timeout;
                GroupChange::Option {
                    apply: Box::new(move |o| o.expel_timeout = timeout),
                    variable: Some(("group_replication_member_expel_timeout", timeout.to_string())),
                }
            }
            "exitStateAction" => {
                let action = as_string(option, &value)?.to_uppercase();
                candidate.exit_state_action = action.clone();
                let stored = action.clone();
                GroupChange::Option {
                    apply: Box::new(move |o| o.exit_state_action = stored.clone()),
                    variable: Some(("group_replication_exit_state_action", action)),
                }
            }
            "consistency" => {
                let level = as_string(option, &value)?.to_uppercase();
                candidate.consistency = level.clone();
                let stored = level.clone();
                GroupChange::Option {
                    apply: Box::new(move |o| o.consistency = stored.clone()),
                    variable: Some(("group_replication_consistency", level)),
                }
            }
            "autoRejoinTries" => {
                let tries = as_u32(option, &value)?;
                candidate.auto_rejoin_tries = tries;
                GroupChange::Option {
                    apply: Box::new(move |o| o.auto_rejoin_tries = tries),
                    variable: Some(("group_replication_autorejoin_tries", tries.to_string())),
                }
            }
            "replicationAllowedHost" => {
                let host = as_string(option, &value)?;
                candidate.replication_allowed_host = host.clone();
                GroupChange::Option {
                    apply: Box::new(move |o| o.replication_allowed_host = host.clone()),
                    variable: None,
                }
            }
            "disableClone" => {
                let disabled = as_bool(option, &value)?;
                candidate.disable_clone = disabled;
                GroupChange::Option {
                    apply: Box::new(move |o| o.disable_clone = disabled),
                    variable: None,
                }
            }
            other => {
                return Err(TopologyError::Validation(format!(
                    "Option '{}' is not supported",
                    other
                )))
            }
        };
        validate_group_options(&candidate)?;
        Ok(change)
    }

    /// Change a group-wide option on every online member and in the metadata
    pub async fn set_option(&self, option: &str, value: Value) -> Result<()> {
        self.run("setOption", async {
            let locks = self.engine.lock(vec![self.group_lock()], "setOption", false).await?;
            let result = self.set_option_locked(option, value).await;
            locks.release().await;
            result
        })
        .await
    }

    async fn set_option_locked(&self, option: &str, value: Value) -> Result<()> {
        let group = self.record().await?;
        let change = self.group_change(&group, option, value)?;

        let view = self.engine.observe(&group).await;
        if !view.has_quorum() {
            return Err(TopologyError::Quorum(format!(
                "There is no quorum to perform the operation on '{}'",
                self.name
            )));
        }

        match change {
            GroupChange::Tag(tag, value) => {
                self.commit(move |group| {
                    apply_tag(&mut group.tags, &tag, value.clone());
                    Ok(())
                })
                .await?;
            }
            GroupChange::ReplicaTransactionSizeLimit(limit) => {
                tracing::info!(
                    "'{}' is a replica cluster; transactionSizeLimit {} takes effect once it is primary or removed",
                    self.name,
                    limit
                );
                self.commit(move |group| {
                    group
                        .attributes
                        .insert(ORIGINAL_TRANSACTION_SIZE_LIMIT.to_string(), limit.to_string());
                    Ok(())
                })
                .await?;
            }
            GroupChange::Option { apply, variable } => {
                if let Some((name, value)) = variable {
                    let mut failures = Vec::new();
                    for address in view.online_voters() {
                        let command = ReplicationCommand::SetVariable {
                            name: name.to_string(),
                            value: value.clone(),
                        };
                        if let Err(e) = self.engine.execute(&address, command).await {
                            failures.push(MemberFailure::new(&address, e));
                        }
                    }
                    if !failures.is_empty() {
                        return Err(TopologyError::PartialFailure {
                            operation: "setOption".to_string(),
                            failures,
                        });
                    }
                }
                self.commit(move |group| {
                    apply(&mut group.options);
                    Ok(())
                })
                .await?;
            }
        }

        tracing::info!("Option '{}' updated on '{}'", option, self.name);
        Ok(())
    }

    /// Change an option of one registered instance
    pub async fn set_instance_option(&self, address: &str, option: &str, value: Value) -> Result<()> {
        let address = parse_address(address)?;
        self.run("setInstanceOption", async {
            let locks = self
                .engine
                .lock(self.member_locks(&address), "setInstanceOption", false)
                .await?;
            let result = self.set_instance_option_locked(&address, option, value).await;
            locks.release().await;
            result
        })
        .await
    }

    async fn set_instance_option_locked(&self, address: &InstanceAddress, option: &str, value: Value) -> Result<()> {
        let group = self.record().await?;
        let record = group.instances.get(address).cloned().ok_or_else(|| {
            TopologyError::Validation(format!("The instance '{}' does not belong to the cluster '{}'.", address, self.name))
        })?;
        let target = address.clone();

        if let Some(tag) = option.strip_prefix("tag:") {
            let tag = tag.to_string();
            let value = tag_value(&tag, value)?;
            return self
                .commit(move |group| {
                    if let Some(instance) = group.instances.get_mut(&target) {
                        apply_tag(&mut instance.tags, &tag, value.clone());
                    }
                    Ok(())
                })
                .await;
        }

        match option {
            "label" => {
                let label = as_string(option, &value)?;
                if label.is_empty() {
                    return Err(TopologyError::Validation("The label cannot be empty".to_string()));
                }
                if let Some(other) = group.instances.values().find(|i| i.label == label && &i.address != address) {
                    return Err(TopologyError::Validation(format!(
                        "The label '{}' is already used by instance '{}'",
                        label, other.address
                    )));
                }
                self.commit(move |group| {
                    if let Some(instance) = group.instances.get_mut(&target) {
                        instance.label = label.clone();
                    }
                    Ok(())
                })
                .await
            }
            "priority" => {
                let priority = as_u32(option, &value)?;
                if priority > MAX_MEMBER_PRIORITY {
                    return Err(TopologyError::Validation(format!(
                        "Invalid value for priority, integer value must be in the range [0, {}]",
                        MAX_MEMBER_PRIORITY
                    )));
                }
                self.commit(move |group| {
                    if let Some(instance) = group.instances.get_mut(&target) {
                        instance.priority = priority;
                    }
                    Ok(())
                })
                .await
            }
            "replicationSources" => {
                if record.is_voter() || group.is_replica_set() {
                    return Err(TopologyError::Validation(format!(
                        "Option 'replicationSources' is only supported on read replicas; '{}' is not one",
                        address
                    )));
                }
                let sources = parse_sources(&value)?;
                let view = self.engine.observe(&group).await;
                let source = self.engine.resolve_source(&group, &view, &sources)?;
                if let Some(channel) = inbound_channel(&group, &record) {
                    self.engine
                        .repoint_channel(address, channel, &source, &record.recovery_account)
                        .await?;
                }
                self.commit(move |group| {
                    if let Some(instance) = group.instances.get_mut(&target) {
                        instance.replication_sources = Some(sources.clone());
                    }
                    Ok(())
                })
                .await
            }
            other => Err(TopologyError::Validation(format!(
                "Option '{}' is not supported for instances",
                other
            ))),
        }
    }

    /// Options of the group and of every registered instance
    pub async fn options(&self) -> Result<ClusterOptions> {
        self.run("options", async {
            let group = self.record().await?;
            let instances = group
                .instances
                .values()
                .map(|i| {
                    (
                        i.address.clone(),
                        InstanceOptions {
                            label: i.label.clone(),
                            priority: i.priority,
                            role: i.role,
                            replication_sources: i.replication_sources.clone(),
                            tags: i.tags.clone(),
                        },
                    )
                })
                .collect();
            Ok(ClusterOptions {
                global: group.options,
                tags: group.tags,
                instances,
            })
        })
        .await
    }
}

/// `"primary"`, `"secondary"` or a list of addresses
fn parse_sources(value: &Value) -> Result<ReplicationSources> {
    match value {
        Value::String(s) if s.eq_ignore_ascii_case("primary") => Ok(ReplicationSources::Primary),
        Value::String(s) if s.eq_ignore_ascii_case("secondary") => Ok(ReplicationSources::Secondary),
        Value::Array(items) if !items.is_empty() => {
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                let text = item.as_str().ok_or_else(|| {
                    TopologyError::Validation("Invalid value for replicationSources, expected addresses".to_string())
                })?;
                list.push(parse_address(text)?);
            }
            Ok(ReplicationSources::Custom(list))
        }
        _ => Err(TopologyError::Validation(
            "Invalid value for replicationSources, expected 'primary', 'secondary' or a non-empty list".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tag_validation() {
        assert_eq!(tag_value("rack", json!("r1")).unwrap(), Some(json!("r1")));
        assert_eq!(tag_value("rack", Value::Null).unwrap(), None);
        assert_eq!(tag_value("_hidden", json!(true)).unwrap(), Some(json!(true)));
        assert!(tag_value("_hidden", json!("yes")).is_err());
        assert!(tag_value("_custom", json!(1)).is_err());
        assert!(tag_value("1rack", json!(1)).is_err());
        assert!(tag_value("ra-ck", json!(1)).is_err());
    }

    #[test]
    fn test_parse_sources() {
        assert_eq!(parse_sources(&json!("PRIMARY")).unwrap(), ReplicationSources::Primary);
        assert_eq!(parse_sources(&json!("secondary")).unwrap(), ReplicationSources::Secondary);
        assert_eq!(
            parse_sources(&json!(["db1:3306", "db2:3306"])).unwrap(),
            ReplicationSources::Custom(vec!["db1:3306".parse().unwrap(), "db2:3306".parse().unwrap()])
        );
        assert!(parse_sources(&json!([])).is_err());
        assert!(parse_sources(&json!(5)).is_err());
    }

    #[test]
    fn test_group_option_bounds() {
        let mut options = GroupOptions::from(&crate::config::GroupDefaults::default());
        assert!(validate_group_options(&options).is_ok());
        options.expel_timeout = 3601;
        assert!(validate_group_options(&options).is_err());
        options.expel_timeout = 5;
        options.consistency = "SOMETIMES".into();
        assert!(validate_group_options(&options).is_err());
    }
}
