//! Distributed lock manager
//!
//! Locks are lease rows in the metadata document, keyed by scope. A scope is
//! either a whole group or a single instance. Within a scope an EXCLUSIVE
//! holder excludes everyone else and SHARED holders only exclude EXCLUSIVE
//! requests.
//!
//! All scopes of one request are taken in a single metadata write, so a
//! request either holds every lock it asked for or none of them. Leases are
//! renewed in the background while a [`LockSet`] is alive; a holder that
//! disappears loses its locks once the lease runs out.

use crate::address::InstanceAddress;
use crate::config::LockConfig;
use crate::error::{Result, TopologyError};
use crate::metadata::{LockHolder, LockRow, MetadataDocument, MetadataStore, TopologyScope};
use crate::trace::lock_span;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn conflicts_with(&self, held: LockMode) -> bool {
        matches!((self, held), (LockMode::Exclusive, _) | (_, LockMode::Exclusive))
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => f.write_str("SHARED"),
            LockMode::Exclusive => f.write_str("EXCLUSIVE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockScope {
    Group(String),
    Instance(InstanceAddress),
}

impl LockScope {
    /// Row key in the lock table
    pub fn key(&self) -> String {
        match self {
            LockScope::Group(name) => format!("group:{}", name),
            LockScope::Instance(address) => format!("instance:{}", address),
        }
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockScope::Group(name) => write!(f, "cluster '{}'", name),
            LockScope::Instance(address) => write!(f, "instance '{}'", address),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub scope: LockScope,
    pub mode: LockMode,
}

impl LockRequest {
    pub fn shared(scope: LockScope) -> Self {
        Self {
            scope,
            mode: LockMode::Shared,
        }
    }

    pub fn exclusive(scope: LockScope) -> Self {
        Self {
            scope,
            mode: LockMode::Exclusive,
        }
    }
}

fn lease_delta(lease: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(lease.as_millis() as i64)
}

fn purge_expired(document: &mut MetadataDocument) {
    let now = Utc::now();
    for row in document.locks.values_mut() {
        row.holders.retain(|h| h.expires_at > now);
    }
    document.locks.retain(|_, row| !row.holders.is_empty());
}

/// Take every requested lock or fail naming the first conflicting holder
fn take_all(
    document: &mut MetadataDocument,
    requests: &[LockRequest],
    owner: &str,
    operation: &str,
    lease: Duration,
) -> Result<()> {
    purge_expired(document);

    for request in requests {
        if let Some(row) = document.locks.get(&request.scope.key()) {
            if let Some(holder) = row
                .holders
                .iter()
                .find(|h| h.owner != owner && request.mode.conflicts_with(h.mode))
            {
                return Err(TopologyError::LockContention {
                    scope: request.scope.to_string(),
                    mode: request.mode.to_string(),
                    holder: holder.operation.clone(),
                });
            }
        }
    }

    let expires_at = Utc::now() + lease_delta(lease);
    for request in requests {
        document
            .locks
            .entry(request.scope.key())
            .or_insert_with(LockRow::default)
            .holders
            .push(LockHolder {
                owner: owner.to_string(),
                operation: operation.to_string(),
                mode: request.mode,
                expires_at,
            });
    }
    Ok(())
}

fn drop_owner(document: &mut MetadataDocument, owner: &str) {
    for row in document.locks.values_mut() {
        row.holders.retain(|h| h.owner != owner);
    }
    document.locks.retain(|_, row| !row.holders.is_empty());
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<MetadataStore>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(store: Arc<MetadataStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    fn lease(&self) -> Duration {
        Duration::from_secs(self.config.lease_secs)
    }

    /// Acquire a single lock
    pub async fn acquire(
        &self,
        scope: LockScope,
        mode: LockMode,
        operation: &str,
        timeout: Duration,
    ) -> Result<LockSet> {
        self.acquire_all(vec![LockRequest { scope, mode }], operation, timeout)
            .await
    }

    /// Acquire all requested locks atomically, retrying contention until `timeout`
    pub async fn acquire_all(&self, mut requests: Vec<LockRequest>, operation: &str, timeout: Duration) -> Result<LockSet> {
        requests.sort_by(|a, b| a.scope.cmp(&b.scope));
        requests.dedup_by(|a, b| {
            if a.scope == b.scope {
                if a.mode == LockMode::Exclusive {
                    b.mode = LockMode::Exclusive;
                }
                true
            } else {
                false
            }
        });

        let scopes: Vec<String> = requests.iter().map(|r| r.scope.key()).collect();
        let span = lock_span(operation, &scopes.join(","));
        self.acquire_sorted(requests, operation, timeout).instrument(span).await
    }

    async fn acquire_sorted(&self, requests: Vec<LockRequest>, operation: &str, timeout: Duration) -> Result<LockSet> {
        let owner = Uuid::new_v4().to_string();
        let lease = self.lease();
        let retry = Duration::from_millis(self.config.retry_interval_ms.max(1));
        let start = Instant::now();

        loop {
            let outcome = self
                .store
                .write_topology(TopologyScope::Locks, None, |doc| {
                    take_all(doc, &requests, &owner, operation, lease)
                })
                .await;

            match outcome {
                Ok(()) => {
                    tracing::debug!("Acquired {} lock(s) for {}", requests.len(), operation);
                    return Ok(LockSet::held(self.clone(), owner, requests));
                }
                Err(e @ TopologyError::LockContention { .. }) => {
                    if start.elapsed() + retry > timeout {
                        tracing::info!("Lock acquisition for {} failed: {}", operation, e);
                        return Err(e);
                    }
                    tokio::time::sleep(retry).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn renew(&self, owner: &str) -> Result<bool> {
        let expires_at = Utc::now() + lease_delta(self.lease());
        self.store
            .write_topology(TopologyScope::Locks, None, |doc| {
                let mut found = false;
                for row in doc.locks.values_mut() {
                    for holder in row.holders.iter_mut().filter(|h| h.owner == owner) {
                        holder.expires_at = expires_at;
                        found = true;
                    }
                }
                Ok(found)
            })
            .await
    }

    async fn release_owner(&self, owner: &str) -> Result<()> {
        self.store
            .write_topology(TopologyScope::Locks, None, |doc| {
                drop_owner(doc, owner);
                Ok(())
            })
            .await
    }

    /// Current holders of a scope, for diagnostics
    pub async fn holders(&self, scope: &LockScope) -> Result<Vec<LockHolder>> {
        let mut document = self.store.read_topology().await?;
        purge_expired(&mut document);
        Ok(document.locks.remove(&scope.key()).map(|row| row.holders).unwrap_or_default())
    }
}

/// Locks held by one operation
pub struct LockSet {
    manager: Option<LockManager>,
    owner: String,
    requests: Vec<LockRequest>,
    renewal: CancellationToken,
    released: bool,
}

impl LockSet {
    fn held(manager: LockManager, owner: String, requests: Vec<LockRequest>) -> Self {
        let renewal = CancellationToken::new();
        let interval = (manager.lease() / 3).max(Duration::from_millis(100));

        let renew_manager = manager.clone();
        let renew_owner = owner.clone();
        let token = renewal.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match renew_manager.renew(&renew_owner).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!("Lock lease of {} expired before renewal", renew_owner);
                        break;
                    }
                    Err(e) => tracing::warn!("Failed to renew lock lease: {}", e),
                }
            }
        });

        Self {
            manager: Some(manager),
            owner,
            requests,
            renewal,
            released: false,
        }
    }

    /// An empty lock set, used by dry runs
    pub fn none() -> Self {
        Self {
            manager: None,
            owner: String::new(),
            requests: Vec::new(),
            renewal: CancellationToken::new(),
            released: true,
        }
    }

    pub fn scopes(&self) -> impl Iterator<Item = &LockScope> {
        self.requests.iter().map(|r| &r.scope)
    }

    pub async fn release(mut self) {
        self.renewal.cancel();
        self.released = true;
        if let Some(manager) = self.manager.take() {
            if let Err(e) = manager.release_owner(&self.owner).await {
                tracing::warn!("Failed to release locks of {}: {}", self.owner, e);
            }
        }
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        self.renewal.cancel();
        if self.released {
            return;
        }
        if let (Some(manager), Ok(handle)) = (self.manager.take(), tokio::runtime::Handle::try_current()) {
            let owner = std::mem::take(&mut self.owner);
            handle.spawn(async move {
                if let Err(e) = manager.release_owner(&owner).await {
                    tracing::warn!("Failed to release abandoned locks of {}: {}", owner, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MetadataConfig, MetricsConfig};
    use crate::error::ErrorKind;
    use crate::metadata::MemoryBackend;
    use crate::metrics::MetricsCollector;

    async fn manager() -> LockManager {
        let store = Arc::new(MetadataStore::new(
            Arc::new(MemoryBackend::new()),
            MetadataConfig::default(),
            Arc::new(MetricsCollector::new(MetricsConfig::default())),
        ));
        store.ensure_schema().await.unwrap();
        LockManager::new(
            store,
            LockConfig {
                lease_secs: 30,
                acquire_timeout_ms: 0,
                retry_interval_ms: 5,
            },
        )
    }

    fn instance(addr: &str) -> LockScope {
        LockScope::Instance(addr.parse().unwrap())
    }

    #[tokio::test]
    async fn test_shared_locks_coexist() {
        let locks = manager().await;
        let group = LockScope::Group("main".into());

        let a = locks.acquire(group.clone(), LockMode::Shared, "a", Duration::ZERO).await.unwrap();
        let b = locks.acquire(group.clone(), LockMode::Shared, "b", Duration::ZERO).await.unwrap();
        let err = locks
            .acquire(group.clone(), LockMode::Exclusive, "c", Duration::ZERO)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::LockContention);

        a.release().await;
        b.release().await;
        locks.acquire(group, LockMode::Exclusive, "c", Duration::ZERO).await.unwrap().release().await;
    }

    #[tokio::test]
    async fn test_contention_names_scope_and_holder() {
        let locks = manager().await;
        let held = locks
            .acquire(instance("h1:3306"), LockMode::Exclusive, "remove_instance", Duration::ZERO)
            .await
            .unwrap();

        let err = locks
            .acquire(instance("h1:3306"), LockMode::Exclusive, "rejoin_instance", Duration::ZERO)
            .await
            .err()
            .unwrap();
        let message = err.to_string();
        assert!(message.contains("instance 'h1:3306'"));
        assert!(message.contains("remove_instance"));

        locks
            .acquire(instance("h2:3306"), LockMode::Exclusive, "rejoin_instance", Duration::ZERO)
            .await
            .unwrap()
            .release()
            .await;
        held.release().await;
    }

    #[tokio::test]
    async fn test_all_or_nothing() {
        let locks = manager().await;
        let held = locks
            .acquire(instance("h2:3306"), LockMode::Exclusive, "first", Duration::ZERO)
            .await
            .unwrap();

        let requests = vec![
            LockRequest::shared(LockScope::Group("main".into())),
            LockRequest::exclusive(instance("h1:3306")),
            LockRequest::exclusive(instance("h2:3306")),
        ];
        assert!(locks.acquire_all(requests, "second", Duration::ZERO).await.is_err());
        assert!(locks.holders(&instance("h1:3306")).await.unwrap().is_empty());
        held.release().await;
    }

    #[tokio::test]
    async fn test_waits_for_release_within_timeout() {
        let locks = manager().await;
        let held = locks
            .acquire(LockScope::Group("main".into()), LockMode::Exclusive, "first", Duration::ZERO)
            .await
            .unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            held.release().await;
        });

        locks
            .acquire(LockScope::Group("main".into()), LockMode::Exclusive, "second", Duration::from_secs(2))
            .await
            .unwrap()
            .release()
            .await;
    }

    #[tokio::test]
    async fn test_expired_lease_is_purged() {
        let locks = manager().await;
        let scope = LockScope::Group("main".into());
        let key = scope.key();
        locks
            .store
            .write_topology(TopologyScope::Locks, None, |doc| {
                doc.locks.entry(key.clone()).or_default().holders.push(LockHolder {
                    owner: "crashed".into(),
                    operation: "dissolve".into(),
                    mode: LockMode::Exclusive,
                    expires_at: Utc::now() - chrono::Duration::seconds(1),
                });
                Ok(())
            })
            .await
            .unwrap();

        locks
            .acquire(scope, LockMode::Exclusive, "after_crash", Duration::ZERO)
            .await
            .unwrap()
            .release()
            .await;
    }
}
