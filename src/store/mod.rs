//! TTL-indexed record store
//!
//! Holds the A- and CNAME-records observed by the DNS proxy, keyed by
//! normalized owner name. The store exists for routing, not for answering
//! clients: entries carry absolute monotonic deadlines and are skipped (and
//! lazily removed) once expired.
//!
//! Alias traversal is an explicit BFS with a visited set, so CNAME cycles
//! (self-loops included) always terminate. The reverse direction scans the
//! whole table per frontier; acceptable at current scale.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::trace;

/// A cached A-record: address plus absolute expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ARecordEntry {
    pub addr: Ipv4Addr,
    pub deadline: Instant,
}

impl ARecordEntry {
    /// Time left before expiry, zero if already past
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }
}

/// A cached CNAME edge: normalized target plus absolute expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CnameEntry {
    pub target: String,
    pub deadline: Instant,
}

/// Which CNAME edges a closure traversal follows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasDirection {
    /// Follow alias → target edges
    Forward,
    /// Find names aliased to the frontier
    Reverse,
    /// Both of the above
    Both,
}

impl AliasDirection {
    fn forward(self) -> bool {
        matches!(self, Self::Forward | Self::Both)
    }

    fn reverse(self) -> bool {
        matches!(self, Self::Reverse | Self::Both)
    }
}

/// Everything known about one owner name
///
/// A-entries and CNAME-entries may coexist; the store never rewrites one
/// kind with the other.
#[derive(Debug, Default)]
struct NameEntry {
    a: Vec<ARecordEntry>,
    cnames: Vec<CnameEntry>,
}

impl NameEntry {
    /// Drop expired entries; true when nothing is left
    fn prune(&mut self, now: Instant) -> bool {
        self.a.retain(|e| e.deadline > now);
        self.cnames.retain(|e| e.deadline > now);
        self.a.is_empty() && self.cnames.is_empty()
    }
}

/// Process-wide record store
///
/// All operations are safe under concurrent callers. Read paths evict
/// expired entries in place, so every operation takes the exclusive side of
/// the lock; contention is bounded by the DNS answer rate.
#[derive(Debug, Default)]
pub struct RecordStore {
    entries: RwLock<HashMap<String, NameEntry>>,
}

impl RecordStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize a name for use as a store key
    #[must_use]
    pub fn normalize(name: &str) -> String {
        name.trim_end_matches('.').to_ascii_lowercase()
    }

    /// Insert or refresh an A-record for `name`
    ///
    /// A put with an address already present only refreshes that entry's
    /// deadline; otherwise the entry is appended.
    pub fn put_a(&self, name: &str, addr: Ipv4Addr, ttl: Duration) {
        let key = Self::normalize(name);
        let now = Instant::now();
        let deadline = now + ttl;

        let mut entries = self.entries.write();
        let entry = entries.entry(key).or_default();
        entry.prune(now);

        if let Some(existing) = entry.a.iter_mut().find(|e| e.addr == addr) {
            existing.deadline = deadline;
            return;
        }
        entry.a.push(ARecordEntry { addr, deadline });
    }

    /// Insert or refresh a CNAME edge `name → target`
    ///
    /// Self-aliases are refused: an edge from a name to itself carries no
    /// information and would only seed trivial cycles.
    pub fn put_cname(&self, name: &str, target: &str, ttl: Duration) {
        let key = Self::normalize(name);
        let target = Self::normalize(target);
        if key == target {
            trace!(name = %key, "ignoring self-alias");
            return;
        }

        let now = Instant::now();
        let deadline = now + ttl;

        let mut entries = self.entries.write();
        let entry = entries.entry(key).or_default();
        entry.prune(now);

        if let Some(existing) = entry.cnames.iter_mut().find(|e| e.target == target) {
            existing.deadline = deadline;
            return;
        }
        entry.cnames.push(CnameEntry { target, deadline });
    }

    /// Live A-record entries for `name` only (non-recursive)
    #[must_use]
    pub fn get_a_entries(&self, name: &str) -> Vec<ARecordEntry> {
        let key = Self::normalize(name);
        let now = Instant::now();

        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(&key) else {
            return Vec::new();
        };
        if entry.prune(now) {
            entries.remove(&key);
            return Vec::new();
        }
        entry.a.clone()
    }

    /// Live A-record addresses for `name` only (non-recursive)
    #[must_use]
    pub fn get_a(&self, name: &str) -> Vec<Ipv4Addr> {
        self.get_a_entries(name).iter().map(|e| e.addr).collect()
    }

    /// Names reachable from `name` over live CNAME edges
    ///
    /// BFS with a visited set; the origin itself is not part of the result.
    /// `Reverse` and `Both` scan every stored name per frontier — O(N·F).
    #[must_use]
    pub fn get_alias_closure(&self, name: &str, direction: AliasDirection) -> Vec<String> {
        let origin = Self::normalize(name);
        let now = Instant::now();

        let mut entries = self.entries.write();
        entries.retain(|_, entry| !entry.prune(now));

        let mut visited: HashSet<String> = HashSet::from([origin.clone()]);
        let mut queue: VecDeque<String> = VecDeque::from([origin]);
        let mut closure = Vec::new();

        while let Some(current) = queue.pop_front() {
            let mut found: Vec<String> = Vec::new();

            if direction.forward() {
                if let Some(entry) = entries.get(&current) {
                    found.extend(entry.cnames.iter().map(|c| c.target.clone()));
                }
            }

            if direction.reverse() {
                for (owner, entry) in entries.iter() {
                    if entry.cnames.iter().any(|c| c.target == current) {
                        found.push(owner.clone());
                    }
                }
            }

            for next in found {
                if visited.insert(next.clone()) {
                    closure.push(next.clone());
                    queue.push_back(next);
                }
            }
        }

        closure
    }

    /// All names that currently have any live entry
    #[must_use]
    pub fn known_names(&self) -> Vec<String> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        entries.retain(|_, entry| !entry.prune(now));
        entries.keys().cloned().collect()
    }

    /// Proactively evict every expired entry
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.entries.write().retain(|_, entry| !entry.prune(now));
    }

    /// Number of names with live entries (diagnostics)
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when no live entries exist
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_put_get_a() {
        let store = RecordStore::new();
        store.put_a("Example.COM", Ipv4Addr::new(1, 2, 3, 4), TTL);

        assert_eq!(store.get_a("example.com"), vec![Ipv4Addr::new(1, 2, 3, 4)]);
        assert_eq!(store.get_a("example.com."), vec![Ipv4Addr::new(1, 2, 3, 4)]);
        assert!(store.get_a("other.com").is_empty());
    }

    #[test]
    fn test_a_expires() {
        let store = RecordStore::new();
        store.put_a("example.com", Ipv4Addr::new(1, 2, 3, 4), Duration::from_millis(100));
        assert_eq!(store.get_a("example.com").len(), 1);

        sleep(Duration::from_millis(150));
        assert!(store.get_a("example.com").is_empty());
        assert!(store.is_empty(), "expired name should be evicted on read");
    }

    #[test]
    fn test_put_a_idempotent_refreshes_deadline() {
        let store = RecordStore::new();
        let addr = Ipv4Addr::new(1, 2, 3, 4);
        store.put_a("example.com", addr, Duration::from_millis(100));
        store.put_a("example.com", addr, Duration::from_secs(60));

        sleep(Duration::from_millis(150));
        assert_eq!(store.get_a("example.com"), vec![addr]);
    }

    #[test]
    fn test_a_and_cname_coexist() {
        let store = RecordStore::new();
        store.put_a("example.com", Ipv4Addr::new(1, 2, 3, 4), TTL);
        store.put_cname("example.com", "edge.example.net", TTL);

        assert_eq!(store.get_a("example.com").len(), 1);
        assert_eq!(
            store.get_alias_closure("example.com", AliasDirection::Forward),
            vec!["edge.example.net".to_string()]
        );
    }

    #[test]
    fn test_self_alias_refused() {
        let store = RecordStore::new();
        store.put_cname("example.com", "EXAMPLE.com.", TTL);
        assert!(store.is_empty());
    }

    #[test]
    fn test_forward_closure_chain() {
        let store = RecordStore::new();
        store.put_cname("a.example", "b.example", TTL);
        store.put_cname("b.example", "c.example", TTL);

        let closure = store.get_alias_closure("a.example", AliasDirection::Forward);
        assert_eq!(closure.len(), 2);
        assert!(closure.contains(&"b.example".to_string()));
        assert!(closure.contains(&"c.example".to_string()));
    }

    #[test]
    fn test_cycle_terminates() {
        let store = RecordStore::new();
        store.put_cname("a.example", "b.example", TTL);
        store.put_cname("b.example", "a.example", TTL);

        let closure = store.get_alias_closure("a.example", AliasDirection::Forward);
        assert!(closure.contains(&"b.example".to_string()));
        assert!(closure.len() <= 2);
    }

    #[test]
    fn test_reverse_closure() {
        let store = RecordStore::new();
        store.put_cname("www.example.com", "edge.example.net", TTL);
        store.put_cname("m.example.com", "edge.example.net", TTL);

        let closure = store.get_alias_closure("edge.example.net", AliasDirection::Reverse);
        assert_eq!(closure.len(), 2);
        assert!(closure.contains(&"www.example.com".to_string()));
        assert!(closure.contains(&"m.example.com".to_string()));
    }

    #[test]
    fn test_both_directions() {
        // www -> edge, and edge -> origin; closure of edge in Both covers all
        let store = RecordStore::new();
        store.put_cname("www.example.com", "edge.example.net", TTL);
        store.put_cname("edge.example.net", "origin.example.net", TTL);

        let closure = store.get_alias_closure("edge.example.net", AliasDirection::Both);
        assert!(closure.contains(&"www.example.com".to_string()));
        assert!(closure.contains(&"origin.example.net".to_string()));
    }

    #[test]
    fn test_expired_edge_leaves_closure() {
        let store = RecordStore::new();
        store.put_cname("a.example", "b.example", Duration::from_millis(100));
        sleep(Duration::from_millis(150));
        assert!(store
            .get_alias_closure("a.example", AliasDirection::Forward)
            .is_empty());
    }

    #[test]
    fn test_known_names_and_cleanup() {
        let store = RecordStore::new();
        store.put_a("keep.example", Ipv4Addr::new(1, 1, 1, 1), TTL);
        store.put_a("drop.example", Ipv4Addr::new(2, 2, 2, 2), Duration::from_millis(50));

        sleep(Duration::from_millis(100));
        store.cleanup();

        assert_eq!(store.known_names(), vec!["keep.example".to_string()]);
    }
}
