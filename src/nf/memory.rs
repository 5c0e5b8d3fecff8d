//! In-memory netfilter driver
//!
//! Models just enough kernel behavior for the rest of the daemon to be
//! exercised without privileges: ordered per-chain rule lists, named
//! `hash:ip` sets with per-entry timeouts, policy rules, routes, and links.
//! Test hooks simulate the outside world mutating that state (an external
//! `iptables -F`, an interface coming up).

use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::driver::{LinkChange, LinkEvent, NetfilterDriver, PolicyRule, RouteSpec};
use crate::error::NetfilterError;

#[derive(Debug, Default)]
struct IpsetState {
    default_timeout: u32,
    members: HashMap<Ipv4Addr, u32>,
}

#[derive(Debug, Default)]
struct KernelState {
    /// (table, chain) → ordered rule specs
    chains: HashMap<(String, String), Vec<Vec<String>>>,
    sets: HashMap<String, IpsetState>,
    rules: Vec<PolicyRule>,
    routes: Vec<RouteSpec>,
    links: HashMap<String, u32>,
}

/// The in-memory driver
#[derive(Debug)]
pub struct MemoryDriver {
    state: Mutex<KernelState>,
    link_tx: broadcast::Sender<LinkEvent>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    #[must_use]
    pub fn new() -> Self {
        let (link_tx, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(KernelState::default()),
            link_tx,
        }
    }

    // --- test hooks -------------------------------------------------------

    /// Register a link without emitting an event
    pub fn add_link(&self, name: &str, index: u32) {
        self.state.lock().links.insert(name.to_string(), index);
    }

    /// Register a link and broadcast its state, as `ip monitor` would
    pub fn set_link_up(&self, name: &str, index: u32, up: bool) {
        self.state.lock().links.insert(name.to_string(), index);
        let _ = self.link_tx.send(LinkEvent {
            name: name.to_string(),
            index,
            change: LinkChange::State,
            up,
        });
    }

    /// Simulate an external flush of every chain in `table`
    pub fn flush_table(&self, table: &str) {
        self.state.lock().chains.retain(|(t, _), _| t != table);
    }

    // --- assertions -------------------------------------------------------

    /// Rules of a chain, if the chain exists
    #[must_use]
    pub fn chain_rules(&self, table: &str, chain: &str) -> Option<Vec<Vec<String>>> {
        self.state
            .lock()
            .chains
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
    }

    /// Names of chains the daemon created in `table`
    #[must_use]
    pub fn chain_names(&self, table: &str) -> Vec<String> {
        self.state
            .lock()
            .chains
            .keys()
            .filter(|(t, _)| t == table)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// All existing set names
    #[must_use]
    pub fn set_names(&self) -> Vec<String> {
        self.state.lock().sets.keys().cloned().collect()
    }

    /// Snapshot of the installed policy rules
    #[must_use]
    pub fn policy_rules(&self) -> Vec<PolicyRule> {
        self.state.lock().rules.clone()
    }

    /// Snapshot of the installed routes
    #[must_use]
    pub fn routes(&self) -> Vec<RouteSpec> {
        self.state.lock().routes.clone()
    }
}

#[async_trait]
impl NetfilterDriver for MemoryDriver {
    async fn clear_chain(&self, table: &str, chain: &str) -> Result<(), NetfilterError> {
        self.state
            .lock()
            .chains
            .insert((table.to_string(), chain.to_string()), Vec::new());
        Ok(())
    }

    async fn clear_and_delete_chain(
        &self,
        table: &str,
        chain: &str,
    ) -> Result<(), NetfilterError> {
        self.state
            .lock()
            .chains
            .remove(&(table.to_string(), chain.to_string()));
        Ok(())
    }

    async fn append_unique(
        &self,
        table: &str,
        chain: &str,
        spec: &[String],
    ) -> Result<(), NetfilterError> {
        let mut state = self.state.lock();
        let rules = state
            .chains
            .entry((table.to_string(), chain.to_string()))
            .or_default();
        if !rules.iter().any(|r| r == spec) {
            rules.push(spec.to_vec());
        }
        Ok(())
    }

    async fn insert_unique(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        spec: &[String],
    ) -> Result<(), NetfilterError> {
        let mut state = self.state.lock();
        let rules = state
            .chains
            .entry((table.to_string(), chain.to_string()))
            .or_default();
        if !rules.iter().any(|r| r == spec) {
            let at = position.saturating_sub(1).min(rules.len());
            rules.insert(at, spec.to_vec());
        }
        Ok(())
    }

    async fn delete_if_exists(
        &self,
        table: &str,
        chain: &str,
        spec: &[String],
    ) -> Result<(), NetfilterError> {
        let mut state = self.state.lock();
        if let Some(rules) = state
            .chains
            .get_mut(&(table.to_string(), chain.to_string()))
        {
            rules.retain(|r| r != spec);
        }
        Ok(())
    }

    async fn create_set(
        &self,
        name: &str,
        default_timeout_secs: u32,
    ) -> Result<(), NetfilterError> {
        self.state
            .lock()
            .sets
            .entry(name.to_string())
            .or_insert_with(|| IpsetState {
                default_timeout: default_timeout_secs,
                members: HashMap::new(),
            });
        Ok(())
    }

    async fn destroy_set(&self, name: &str) -> Result<(), NetfilterError> {
        self.state.lock().sets.remove(name);
        Ok(())
    }

    async fn add_member(
        &self,
        set: &str,
        addr: Ipv4Addr,
        timeout_secs: u32,
    ) -> Result<(), NetfilterError> {
        let mut state = self.state.lock();
        let set_state = state
            .sets
            .get_mut(set)
            .ok_or_else(|| NetfilterError::NotFound(format!("ipset {set}")))?;
        set_state.members.insert(addr, timeout_secs);
        Ok(())
    }

    async fn del_member(&self, set: &str, addr: Ipv4Addr) -> Result<(), NetfilterError> {
        let mut state = self.state.lock();
        let set_state = state
            .sets
            .get_mut(set)
            .ok_or_else(|| NetfilterError::NotFound(format!("ipset {set}")))?;
        set_state.members.remove(&addr);
        Ok(())
    }

    async fn list_members(&self, set: &str) -> Result<HashMap<Ipv4Addr, u32>, NetfilterError> {
        let state = self.state.lock();
        let set_state = state
            .sets
            .get(set)
            .ok_or_else(|| NetfilterError::NotFound(format!("ipset {set}")))?;
        Ok(set_state.members.clone())
    }

    async fn rule_list(&self) -> Result<Vec<PolicyRule>, NetfilterError> {
        Ok(self.state.lock().rules.clone())
    }

    async fn rule_add(&self, mark: u32, table: u32) -> Result<(), NetfilterError> {
        let mut state = self.state.lock();
        let rule = PolicyRule { mark, table };
        if state.rules.contains(&rule) {
            return Err(NetfilterError::AlreadyExists(format!(
                "rule fwmark {mark} table {table}"
            )));
        }
        state.rules.push(rule);
        Ok(())
    }

    async fn rule_del(&self, mark: u32, table: u32) -> Result<(), NetfilterError> {
        let rule = PolicyRule { mark, table };
        self.state.lock().rules.retain(|r| *r != rule);
        Ok(())
    }

    async fn route_list(&self) -> Result<Vec<RouteSpec>, NetfilterError> {
        Ok(self.state.lock().routes.clone())
    }

    async fn route_add(&self, route: &RouteSpec) -> Result<(), NetfilterError> {
        let mut state = self.state.lock();
        if !state.routes.contains(route) {
            state.routes.push(*route);
        }
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), NetfilterError> {
        self.state.lock().routes.retain(|r| r != route);
        Ok(())
    }

    async fn link_index(&self, name: &str) -> Result<Option<u32>, NetfilterError> {
        Ok(self.state.lock().links.get(name).copied())
    }

    fn subscribe_links(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_append_unique_dedupes() {
        let driver = MemoryDriver::new();
        let rule = spec(&["-j", "RETURN"]);
        driver.append_unique("mangle", "TEST", &rule).await.unwrap();
        driver.append_unique("mangle", "TEST", &rule).await.unwrap();
        assert_eq!(driver.chain_rules("mangle", "TEST").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_unique_position() {
        let driver = MemoryDriver::new();
        driver
            .append_unique("nat", "PREROUTING", &spec(&["-j", "OTHER"]))
            .await
            .unwrap();
        driver
            .insert_unique("nat", "PREROUTING", 1, &spec(&["-j", "FIRST"]))
            .await
            .unwrap();
        let rules = driver.chain_rules("nat", "PREROUTING").unwrap();
        assert_eq!(rules[0], spec(&["-j", "FIRST"]));
    }

    #[tokio::test]
    async fn test_delete_of_absent_is_ok() {
        let driver = MemoryDriver::new();
        driver
            .delete_if_exists("nat", "NOPE", &spec(&["-j", "X"]))
            .await
            .unwrap();
        driver.clear_and_delete_chain("nat", "NOPE").await.unwrap();
        driver.destroy_set("nope").await.unwrap();
        driver.rule_del(9, 9).await.unwrap();
    }

    #[tokio::test]
    async fn test_rule_add_detects_duplicate() {
        let driver = MemoryDriver::new();
        driver.rule_add(1, 100).await.unwrap();
        let err = driver.rule_add(1, 100).await.unwrap_err();
        assert!(matches!(err, NetfilterError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_set_membership() {
        let driver = MemoryDriver::new();
        driver.create_set("s", 300).await.unwrap();
        driver
            .add_member("s", Ipv4Addr::new(1, 2, 3, 4), 60)
            .await
            .unwrap();
        // replace semantics: same member, new timeout
        driver
            .add_member("s", Ipv4Addr::new(1, 2, 3, 4), 90)
            .await
            .unwrap();
        let members = driver.list_members("s").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[&Ipv4Addr::new(1, 2, 3, 4)], 90);
    }

    #[tokio::test]
    async fn test_add_member_to_missing_set_fails() {
        let driver = MemoryDriver::new();
        let err = driver
            .add_member("missing", Ipv4Addr::new(1, 1, 1, 1), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, NetfilterError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_flush_table_hook() {
        let driver = MemoryDriver::new();
        driver.clear_chain("nat", "A").await.unwrap();
        driver.clear_chain("mangle", "B").await.unwrap();
        driver.flush_table("nat");
        assert!(driver.chain_rules("nat", "A").is_none());
        assert!(driver.chain_rules("mangle", "B").is_some());
    }

    #[tokio::test]
    async fn test_link_events() {
        let driver = MemoryDriver::new();
        let mut rx = driver.subscribe_links();
        driver.set_link_up("wg0", 7, true);
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.name, "wg0");
        assert!(ev.up);
        assert_eq!(driver.link_index("wg0").await.unwrap(), Some(7));
    }
}
