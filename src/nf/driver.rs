//! The netfilter driver trait
//!
//! Consumers (port-remap, group controller, allocator, orchestrator) are
//! written against this trait only. Two implementations exist: the
//! production [`CommandDriver`](super::CommandDriver) and the in-memory
//! [`MemoryDriver`](super::MemoryDriver) used by tests and dry runs; the
//! [`JournaledDriver`](super::JournaledDriver) wrapper composes with either.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio::sync::broadcast;

use crate::error::NetfilterError;

/// A policy-routing rule: `fwmark == mark → lookup table`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyRule {
    pub mark: u32,
    pub table: u32,
}

/// A route owned by the daemon: destination via a link into a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSpec {
    pub link_index: u32,
    pub table: u32,
    pub dst: Ipv4Net,
}

impl RouteSpec {
    /// The default route (`0.0.0.0/0`) through `link_index` in `table`
    #[must_use]
    pub fn default_via(link_index: u32, table: u32) -> Self {
        Self {
            link_index,
            table,
            // 0.0.0.0/0 is always a valid prefix
            dst: Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).expect("valid default prefix"),
        }
    }
}

/// What a link event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkChange {
    /// Operational state changed
    State,
    /// Interface appeared
    Added,
    /// Interface disappeared
    Removed,
}

/// A netlink LINK-group event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub name: String,
    pub index: u32,
    pub change: LinkChange,
    /// Operational state is anything but DOWN
    pub up: bool,
}

/// Idempotent kernel capability set
///
/// `rule_add` is the one deliberate exception to blanket idempotency: adding
/// an identical rule surfaces [`NetfilterError::AlreadyExists`] so the
/// mark/table allocator can detect a lost race and retry with the next
/// candidate.
#[async_trait]
pub trait NetfilterDriver: Send + Sync {
    // --- iptables ---

    /// Create the chain if missing, then flush it
    async fn clear_chain(&self, table: &str, chain: &str) -> Result<(), NetfilterError>;

    /// Flush and delete the chain; absent chain is success
    async fn clear_and_delete_chain(&self, table: &str, chain: &str)
        -> Result<(), NetfilterError>;

    /// Append a rule unless an identical one is already present
    async fn append_unique(
        &self,
        table: &str,
        chain: &str,
        spec: &[String],
    ) -> Result<(), NetfilterError>;

    /// Insert a rule at `position` (1-based) unless already present
    async fn insert_unique(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        spec: &[String],
    ) -> Result<(), NetfilterError>;

    /// Delete a rule; absent rule is success
    async fn delete_if_exists(
        &self,
        table: &str,
        chain: &str,
        spec: &[String],
    ) -> Result<(), NetfilterError>;

    // --- ipset ---

    /// Create a `hash:ip` set with a default entry timeout; existing set is
    /// success
    async fn create_set(&self, name: &str, default_timeout_secs: u32)
        -> Result<(), NetfilterError>;

    /// Destroy a set; absent set is success
    async fn destroy_set(&self, name: &str) -> Result<(), NetfilterError>;

    /// Add (or refresh, replace semantics) a member with an entry timeout
    async fn add_member(
        &self,
        set: &str,
        addr: Ipv4Addr,
        timeout_secs: u32,
    ) -> Result<(), NetfilterError>;

    /// Remove a member; absent member is success
    async fn del_member(&self, set: &str, addr: Ipv4Addr) -> Result<(), NetfilterError>;

    /// Current members with their remaining timeouts in seconds
    async fn list_members(&self, set: &str) -> Result<HashMap<Ipv4Addr, u32>, NetfilterError>;

    // --- policy rules ---

    /// All IPv4 policy rules currently installed
    async fn rule_list(&self) -> Result<Vec<PolicyRule>, NetfilterError>;

    /// Install `fwmark mark → lookup table`; identical rule present is
    /// `AlreadyExists`
    async fn rule_add(&self, mark: u32, table: u32) -> Result<(), NetfilterError>;

    /// Remove the rule; absent rule is success
    async fn rule_del(&self, mark: u32, table: u32) -> Result<(), NetfilterError>;

    // --- routes ---

    /// All IPv4 routes, across all tables
    async fn route_list(&self) -> Result<Vec<RouteSpec>, NetfilterError>;

    /// Install (or replace) a route
    async fn route_add(&self, route: &RouteSpec) -> Result<(), NetfilterError>;

    /// Remove a route; absent route is success
    async fn route_del(&self, route: &RouteSpec) -> Result<(), NetfilterError>;

    // --- links ---

    /// Resolve an interface name to its index; `None` when it does not exist
    async fn link_index(&self, name: &str) -> Result<Option<u32>, NetfilterError>;

    /// Subscribe to link events
    fn subscribe_links(&self) -> broadcast::Receiver<LinkEvent>;
}
