//! Rule journal
//!
//! [`JournaledDriver`] wraps any [`NetfilterDriver`] and mirrors every
//! successful iptables mutation into an in-process journal of what each
//! daemon-owned chain should contain. After an external flush the installers
//! re-derive their rules anyway; the journal is the diagnostic record that
//! lets the daemon (and its tests) state exactly what was lost and restored.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::driver::{LinkEvent, NetfilterDriver, PolicyRule, RouteSpec};
use crate::error::NetfilterError;

/// One journaled rule: the position it was installed at (0 = appended) and
/// its spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRule {
    pub position: usize,
    pub spec: Vec<String>,
}

type ChainMap = HashMap<String, Vec<CachedRule>>;

/// Driver wrapper that records chain contents
pub struct JournaledDriver {
    inner: Arc<dyn NetfilterDriver>,
    tables: Mutex<HashMap<String, ChainMap>>,
}

impl JournaledDriver {
    pub fn new(inner: Arc<dyn NetfilterDriver>) -> Self {
        Self {
            inner,
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Journaled rules for one chain
    #[must_use]
    pub fn cached_rules(&self, table: &str, chain: &str) -> Vec<CachedRule> {
        self.tables
            .lock()
            .get(table)
            .and_then(|chains| chains.get(chain))
            .cloned()
            .unwrap_or_default()
    }

    fn record_clear(&self, table: &str, chain: &str) {
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .insert(chain.to_string(), Vec::new());
    }

    fn record_drop(&self, table: &str, chain: &str) {
        if let Some(chains) = self.tables.lock().get_mut(table) {
            chains.remove(chain);
        }
    }

    fn record_add(&self, table: &str, chain: &str, position: usize, spec: &[String]) {
        let mut tables = self.tables.lock();
        let rules = tables
            .entry(table.to_string())
            .or_default()
            .entry(chain.to_string())
            .or_default();
        if rules.iter().any(|r| r.spec == spec) {
            return;
        }
        rules.push(CachedRule {
            position,
            spec: spec.to_vec(),
        });
    }

    fn record_del(&self, table: &str, chain: &str, spec: &[String]) {
        if let Some(rules) = self
            .tables
            .lock()
            .get_mut(table)
            .and_then(|chains| chains.get_mut(chain))
        {
            rules.retain(|r| r.spec != spec);
        }
    }
}

#[async_trait]
impl NetfilterDriver for JournaledDriver {
    async fn clear_chain(&self, table: &str, chain: &str) -> Result<(), NetfilterError> {
        self.inner.clear_chain(table, chain).await?;
        self.record_clear(table, chain);
        Ok(())
    }

    async fn clear_and_delete_chain(
        &self,
        table: &str,
        chain: &str,
    ) -> Result<(), NetfilterError> {
        self.inner.clear_and_delete_chain(table, chain).await?;
        self.record_drop(table, chain);
        Ok(())
    }

    async fn append_unique(
        &self,
        table: &str,
        chain: &str,
        spec: &[String],
    ) -> Result<(), NetfilterError> {
        self.inner.append_unique(table, chain, spec).await?;
        self.record_add(table, chain, 0, spec);
        Ok(())
    }

    async fn insert_unique(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        spec: &[String],
    ) -> Result<(), NetfilterError> {
        self.inner.insert_unique(table, chain, position, spec).await?;
        self.record_add(table, chain, position, spec);
        Ok(())
    }

    async fn delete_if_exists(
        &self,
        table: &str,
        chain: &str,
        spec: &[String],
    ) -> Result<(), NetfilterError> {
        self.inner.delete_if_exists(table, chain, spec).await?;
        self.record_del(table, chain, spec);
        Ok(())
    }

    async fn create_set(
        &self,
        name: &str,
        default_timeout_secs: u32,
    ) -> Result<(), NetfilterError> {
        self.inner.create_set(name, default_timeout_secs).await
    }

    async fn destroy_set(&self, name: &str) -> Result<(), NetfilterError> {
        self.inner.destroy_set(name).await
    }

    async fn add_member(
        &self,
        set: &str,
        addr: Ipv4Addr,
        timeout_secs: u32,
    ) -> Result<(), NetfilterError> {
        self.inner.add_member(set, addr, timeout_secs).await
    }

    async fn del_member(&self, set: &str, addr: Ipv4Addr) -> Result<(), NetfilterError> {
        self.inner.del_member(set, addr).await
    }

    async fn list_members(&self, set: &str) -> Result<HashMap<Ipv4Addr, u32>, NetfilterError> {
        self.inner.list_members(set).await
    }

    async fn rule_list(&self) -> Result<Vec<PolicyRule>, NetfilterError> {
        self.inner.rule_list().await
    }

    async fn rule_add(&self, mark: u32, table: u32) -> Result<(), NetfilterError> {
        self.inner.rule_add(mark, table).await
    }

    async fn rule_del(&self, mark: u32, table: u32) -> Result<(), NetfilterError> {
        self.inner.rule_del(mark, table).await
    }

    async fn route_list(&self) -> Result<Vec<RouteSpec>, NetfilterError> {
        self.inner.route_list().await
    }

    async fn route_add(&self, route: &RouteSpec) -> Result<(), NetfilterError> {
        self.inner.route_add(route).await
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), NetfilterError> {
        self.inner.route_del(route).await
    }

    async fn link_index(&self, name: &str) -> Result<Option<u32>, NetfilterError> {
        self.inner.link_index(name).await
    }

    fn subscribe_links(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.subscribe_links()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nf::MemoryDriver;

    fn spec(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_journal_tracks_chain_contents() {
        let driver = JournaledDriver::new(Arc::new(MemoryDriver::new()));

        driver.clear_chain("nat", "TEST").await.unwrap();
        driver
            .append_unique("nat", "TEST", &spec(&["-j", "RETURN"]))
            .await
            .unwrap();
        driver
            .insert_unique("nat", "PREROUTING", 1, &spec(&["-j", "TEST"]))
            .await
            .unwrap();

        assert_eq!(
            driver.cached_rules("nat", "TEST"),
            vec![CachedRule {
                position: 0,
                spec: spec(&["-j", "RETURN"])
            }]
        );
        assert_eq!(driver.cached_rules("nat", "PREROUTING").len(), 1);
    }

    #[tokio::test]
    async fn test_journal_dedupes_and_deletes() {
        let driver = JournaledDriver::new(Arc::new(MemoryDriver::new()));
        let rule = spec(&["-j", "MASQUERADE"]);

        driver.append_unique("nat", "C", &rule).await.unwrap();
        driver.append_unique("nat", "C", &rule).await.unwrap();
        assert_eq!(driver.cached_rules("nat", "C").len(), 1);

        driver.delete_if_exists("nat", "C", &rule).await.unwrap();
        assert!(driver.cached_rules("nat", "C").is_empty());

        driver.clear_and_delete_chain("nat", "C").await.unwrap();
        assert!(driver.cached_rules("nat", "C").is_empty());
    }
}
