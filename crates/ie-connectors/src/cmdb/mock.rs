//! Mock CI inventory for testing.

use crate::traits::{
    CiRepositoryConnector, CiSearchQuery, ConfigurationItem, Connector, ConnectorCategory,
    ConnectorError, ConnectorHealth, ConnectorResult,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Lookup strategies exposed by the inventory, used for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupKind {
    Ip,
    Fqdn,
    Name,
}

/// In-memory CI inventory.
pub struct MockCiRepository {
    name: String,
    items: Arc<RwLock<Vec<ConfigurationItem>>>,
    failing: Arc<RwLock<HashSet<LookupKind>>>,
    calls: AtomicUsize,
}

impl MockCiRepository {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            items: Arc::new(RwLock::new(Vec::new())),
            failing: Arc::new(RwLock::new(HashSet::new())),
            calls: AtomicUsize::new(0),
        }
    }

    /// Creates an inventory pre-populated with `items`.
    pub fn with_items(name: &str, items: Vec<ConfigurationItem>) -> Self {
        Self {
            items: Arc::new(RwLock::new(items)),
            ..Self::new(name)
        }
    }

    pub async fn add_item(&self, item: ConfigurationItem) {
        self.items.write().await.push(item);
    }

    /// Makes one lookup strategy fail with a connection error.
    pub async fn fail_lookup(&self, kind: LookupKind) {
        self.failing.write().await.insert(kind);
    }

    /// Total number of lookups served (including failed ones).
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn guard(&self, kind: LookupKind) -> ConnectorResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.read().await.contains(&kind) {
            return Err(ConnectorError::ConnectionFailed(format!(
                "Simulated {:?} lookup failure",
                kind
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for MockCiRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn connector_type(&self) -> &str {
        "cmdb"
    }

    fn category(&self) -> ConnectorCategory {
        ConnectorCategory::Cmdb
    }

    async fn health_check(&self) -> ConnectorResult<ConnectorHealth> {
        Ok(ConnectorHealth::Healthy)
    }

    async fn test_connection(&self) -> ConnectorResult<bool> {
        Ok(true)
    }
}

#[async_trait]
impl CiRepositoryConnector for MockCiRepository {
    async fn find_by_ip(&self, ip: &str) -> ConnectorResult<Vec<ConfigurationItem>> {
        self.guard(LookupKind::Ip).await?;
        Ok(self
            .items
            .read()
            .await
            .iter()
            .filter(|ci| ci.ip_address.as_deref() == Some(ip))
            .cloned()
            .collect())
    }

    async fn find_by_fqdn(&self, host: &str) -> ConnectorResult<Vec<ConfigurationItem>> {
        self.guard(LookupKind::Fqdn).await?;
        Ok(self
            .items
            .read()
            .await
            .iter()
            .filter(|ci| {
                ci.fqdn
                    .as_deref()
                    .is_some_and(|fqdn| fqdn.eq_ignore_ascii_case(host))
            })
            .cloned()
            .collect())
    }

    async fn search(&self, query: &CiSearchQuery) -> ConnectorResult<Vec<ConfigurationItem>> {
        self.guard(LookupKind::Name).await?;
        let needle = query.name.to_lowercase();
        Ok(self
            .items
            .read()
            .await
            .iter()
            .filter(|ci| ci.name.to_lowercase().contains(&needle))
            .take(query.limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_ci;

    fn repo() -> MockCiRepository {
        MockCiRepository::with_items(
            "cmdb",
            vec![
                sample_ci("ci1", "web01", Some("10.0.0.5"), Some("web01.corp.local")),
                sample_ci("ci2", "web02", Some("10.0.0.6"), None),
                sample_ci("ci3", "db01", None, None),
            ],
        )
    }

    #[tokio::test]
    async fn test_lookups() {
        let repo = repo();
        assert_eq!(repo.find_by_ip("10.0.0.5").await.unwrap()[0].id, "ci1");
        assert_eq!(
            repo.find_by_fqdn("WEB01.corp.local").await.unwrap()[0].id,
            "ci1"
        );
        let hits = repo.search(&CiSearchQuery::by_name("WEB", 5)).await.unwrap();
        assert_eq!(hits.len(), 2);
        let limited = repo.search(&CiSearchQuery::by_name("0", 1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(repo.call_count(), 4);
    }

    #[tokio::test]
    async fn test_failure_injection_is_per_strategy() {
        let repo = repo();
        repo.fail_lookup(LookupKind::Ip).await;
        assert!(repo.find_by_ip("10.0.0.5").await.is_err());
        assert!(repo
            .search(&CiSearchQuery::by_name("db", 5))
            .await
            .is_ok());
    }
}
