//! Record-to-group reconciliation
//!
//! Every A- and CNAME-record the proxy observes flows through here. An
//! A-record is matched against each group using the full alias closure of
//! its owner name (the name itself plus everything reachable over CNAME
//! edges in both directions), so a rule written for `www.example.com`
//! catches an address answered under `edge.example.net`. A CNAME replays
//! the A-records already cached under its forward closure, so groups catch
//! up when the alias arrives after its addresses.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{error, trace};

use crate::codec::{DnsMessage, RecordData, ResourceRecord};
use crate::group::{Group, GroupRegistry};
use crate::proxy::MessageHandler;
use crate::store::{AliasDirection, RecordStore};

/// Reconciles observed DNS records with group IP-set membership
pub struct Reconciler {
    store: Arc<RecordStore>,
    groups: Arc<RwLock<GroupRegistry>>,
    minimal_ttl: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<RecordStore>,
        groups: Arc<RwLock<GroupRegistry>>,
        minimal_ttl: Duration,
    ) -> Self {
        Self {
            store,
            groups,
            minimal_ttl,
        }
    }

    /// Apply the configured TTL floor
    fn clamp_ttl(&self, ttl_secs: u32) -> Duration {
        self.minimal_ttl.max(Duration::from_secs(u64::from(ttl_secs)))
    }

    /// Groups that are currently enabled, snapshot taken under the lock
    fn enabled_groups(&self) -> Vec<Arc<Group>> {
        self.groups
            .read()
            .all()
            .into_iter()
            .filter(|g| g.is_enabled())
            .collect()
    }

    /// Handle one observed A-record
    pub async fn observe_a(&self, name: &str, addr: Ipv4Addr, ttl_secs: u32) {
        let ttl = self.clamp_ttl(ttl_secs);
        trace!(name, address = %addr, ttl_secs = ttl.as_secs(), "observed A record");

        self.store.put_a(name, addr, ttl);
        self.apply_address(name, addr, ttl).await;
    }

    /// Handle one observed CNAME record
    pub async fn observe_cname(&self, name: &str, target: &str, ttl_secs: u32) {
        let ttl = self.clamp_ttl(ttl_secs);
        trace!(name, target, ttl_secs = ttl.as_secs(), "observed CNAME record");

        self.store.put_cname(name, target, ttl);

        // Replay cached addresses reachable forward from the alias so that
        // CNAME-before-A answer ordering still fills the groups.
        let now = Instant::now();
        let mut owners = vec![RecordStore::normalize(name)];
        owners.extend(self.store.get_alias_closure(name, AliasDirection::Forward));

        for owner in owners {
            for entry in self.store.get_a_entries(&owner) {
                self.apply_address(&owner, entry.addr, entry.remaining(now))
                    .await;
            }
        }
    }

    /// Match `name`'s alias closure against every enabled group and add the
    /// address where a rule hits
    async fn apply_address(&self, name: &str, addr: Ipv4Addr, ttl: Duration) {
        let mut closure = vec![RecordStore::normalize(name)];
        closure.extend(self.store.get_alias_closure(name, AliasDirection::Both));

        for group in self.enabled_groups() {
            if !group.matches_any(&closure) {
                continue;
            }
            match group.add_ipv4(addr, ttl).await {
                Ok(()) => {
                    trace!(group = group.id(), address = %addr, name, "address routed");
                }
                Err(e) => {
                    error!(group = group.id(), address = %addr, error = %e, "failed to add address");
                }
            }
        }
    }

    /// Rebuild one group's IP-set from the record store
    ///
    /// Run when a group is added at runtime: addresses implied by known
    /// names are added (keeping the longest remaining TTL per address),
    /// members no rule accounts for any more are removed.
    pub async fn sync_group(&self, group: &Group) {
        let current = match group.list_ipv4().await {
            Ok(members) => members,
            Err(e) => {
                error!(group = group.id(), error = %e, "failed to list group addresses");
                return;
            }
        };

        let now = Instant::now();
        let mut wanted: std::collections::HashMap<Ipv4Addr, Duration> =
            std::collections::HashMap::new();

        for name in self.store.known_names() {
            let single = std::slice::from_ref(&name);
            if !group.matches_any(single) {
                continue;
            }

            let mut owners = vec![name.clone()];
            owners.extend(self.store.get_alias_closure(&name, AliasDirection::Forward));
            for owner in owners {
                for entry in self.store.get_a_entries(&owner) {
                    let remaining = entry.remaining(now);
                    wanted
                        .entry(entry.addr)
                        .and_modify(|ttl| *ttl = (*ttl).max(remaining))
                        .or_insert(remaining);
                }
            }
        }

        for (addr, ttl) in &wanted {
            if current.contains_key(addr) {
                continue;
            }
            if let Err(e) = group.add_ipv4(*addr, *ttl).await {
                error!(group = group.id(), address = %addr, error = %e, "failed to add address");
            }
        }

        for addr in current.keys() {
            if wanted.contains_key(addr) {
                continue;
            }
            if let Err(e) = group.del_ipv4(*addr).await {
                error!(group = group.id(), address = %addr, error = %e, "failed to delete address");
            }
        }
    }

    async fn handle_record(&self, rr: &ResourceRecord) {
        match &rr.data {
            RecordData::A(addr) => {
                self.observe_a(&rr.header.name.normalized(), *addr, rr.header.ttl)
                    .await;
            }
            RecordData::Cname(target) => {
                self.observe_cname(
                    &rr.header.name.normalized(),
                    &target.normalized(),
                    rr.header.ttl,
                )
                .await;
            }
            // NS, SOA and unknown types are observed but not routed on.
            _ => {}
        }
    }
}

#[async_trait]
impl MessageHandler for Reconciler {
    async fn handle_message(&self, msg: &DnsMessage) {
        for rr in msg.records() {
            self.handle_record(rr).await;
        }
    }
}
