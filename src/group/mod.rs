//! Per-group routing lifecycle
//!
//! A [`Group`] owns one linked tuple of kernel artifacts: a fwmark value and
//! routing table, the policy rule tying them together, a default route
//! through the group's interface, a timed `hash:ip` IP-set, and the
//! mangle/nat chains that mark and masquerade traffic matching the set.
//! The invariant is all-or-nothing: while enabled the tuple is fully
//! present; a failed enable unwinds every step already taken.
//!
//! Two mangle layouts exist. The default uses CONNMARK so established
//! connections keep their mark without re-matching; `use_software_routing`
//! swaps in a single unconditional set-mark chain for kernels whose
//! conntrack marking is broken.

pub mod allocator;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GroupSpec;
use crate::error::GroupError;
use crate::nf::{NetfilterDriver, RouteSpec};
use crate::rules::DomainRule;

/// Default entry timeout of a freshly created group IP-set, in seconds
pub const DEFAULT_SET_TIMEOUT_SECS: u32 = 300;

/// Kernel-side state of an enabled group
#[derive(Debug, Default)]
struct GroupState {
    mark: Option<u32>,
    table: Option<u32>,
    route: Option<RouteSpec>,
}

/// One routing group and its kernel lifecycle
pub struct Group {
    spec: GroupSpec,
    rules: Vec<DomainRule>,
    driver: Arc<dyn NetfilterDriver>,
    ipset_name: String,
    chain_name: String,
    software_routing: bool,
    enabled: AtomicBool,
    state: Mutex<GroupState>,
}

impl Group {
    /// Build a group from its configuration
    ///
    /// `chain_prefix`/`ipset_prefix` are the daemon-owned namespaces; the
    /// group claims `<chain_prefix>R_<id>` and `<ipset_prefix><id>`.
    pub fn new(
        spec: GroupSpec,
        driver: Arc<dyn NetfilterDriver>,
        chain_prefix: &str,
        ipset_prefix: &str,
        software_routing: bool,
    ) -> Self {
        let rules = spec
            .rules
            .iter()
            .map(|r| DomainRule::new(r.id, r.kind, &r.pattern, r.enabled))
            .collect();

        Self {
            ipset_name: format!("{ipset_prefix}{}", spec.id),
            chain_name: format!("{chain_prefix}R_{}", spec.id),
            rules,
            driver,
            software_routing,
            enabled: AtomicBool::new(false),
            state: Mutex::new(GroupState::default()),
            spec,
        }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.spec.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    #[must_use]
    pub fn interface(&self) -> &str {
        &self.spec.interface
    }

    #[must_use]
    pub fn spec(&self) -> &GroupSpec {
        &self.spec
    }

    /// Compiled domain rules of this group
    #[must_use]
    pub fn rules(&self) -> &[DomainRule] {
        &self.rules
    }

    /// Name of the group's IP-set
    #[must_use]
    pub fn ipset_name(&self) -> &str {
        &self.ipset_name
    }

    /// Whether the kernel tuple is currently installed
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// True when any enabled rule of this group matches any of `names`
    #[must_use]
    pub fn matches_any(&self, names: &[String]) -> bool {
        self.rules
            .iter()
            .filter(|r| r.is_enabled())
            .any(|r| names.iter().any(|n| r.matches(n)))
    }

    /// Install the full kernel tuple
    ///
    /// Steps run in a strict order (allocate pair → policy rule → route →
    /// IP-set → mangle → nat). Any failure unwinds what was already
    /// installed; `enabled` flips only after the last step.
    pub async fn enable(&self) -> Result<(), GroupError> {
        let mut state = self.state.lock().await;
        if self.is_enabled() {
            return Ok(());
        }

        if let Err(e) = self.bring_up(&mut state).await {
            warn!(group = self.spec.id, error = %e, "enable failed, unwinding");
            for unwind_err in self.tear_down(&mut state).await {
                warn!(group = self.spec.id, error = %unwind_err, "unwind error");
            }
            return Err(e);
        }

        self.enabled.store(true, Ordering::SeqCst);
        info!(
            group = self.spec.id,
            name = %self.spec.name,
            interface = %self.spec.interface,
            ipset = %self.ipset_name,
            "group enabled"
        );
        Ok(())
    }

    async fn bring_up(&self, state: &mut GroupState) -> Result<(), GroupError> {
        let (mark, table) = allocator::claim(self.driver.as_ref()).await?;
        state.mark = Some(mark);
        state.table = Some(table);

        // Missing interface is not fatal; the route follows on link-up.
        self.bind_route(state).await?;

        self.driver.destroy_set(&self.ipset_name).await?;
        self.driver
            .create_set(&self.ipset_name, DEFAULT_SET_TIMEOUT_SECS)
            .await?;

        self.install_for_table("all", mark).await?;
        Ok(())
    }

    /// Remove the kernel tuple, accumulating errors
    pub async fn disable(&self) -> Vec<GroupError> {
        let mut state = self.state.lock().await;
        let errors = self.tear_down(&mut state).await;
        self.enabled.store(false, Ordering::SeqCst);
        if errors.is_empty() {
            info!(group = self.spec.id, "group disabled");
        }
        errors
    }

    async fn tear_down(&self, state: &mut GroupState) -> Vec<GroupError> {
        let mut errors: Vec<GroupError> = Vec::new();
        let mut check = |res: Result<(), crate::error::NetfilterError>| {
            if let Err(e) = res {
                errors.push(e.into());
            }
        };

        if self.software_routing {
            let prr = format!("{}_PRR", self.chain_name);
            check(
                self.driver
                    .delete_if_exists("mangle", "PREROUTING", &jump(&prr))
                    .await,
            );
            check(self.driver.clear_and_delete_chain("mangle", &prr).await);
        } else {
            let hook = self.set_match_jump();
            check(
                self.driver
                    .delete_if_exists("mangle", "PREROUTING", &hook)
                    .await,
            );
            check(self.driver.delete_if_exists("mangle", "OUTPUT", &hook).await);
            check(
                self.driver
                    .clear_and_delete_chain("mangle", &self.chain_name)
                    .await,
            );
        }

        let por = format!("{}_POR", self.chain_name);
        check(
            self.driver
                .delete_if_exists("nat", "POSTROUTING", &jump(&por))
                .await,
        );
        check(self.driver.clear_and_delete_chain("nat", &por).await);

        if let (Some(mark), Some(table)) = (state.mark.take(), state.table.take()) {
            check(self.driver.rule_del(mark, table).await);
        }
        if let Some(route) = state.route.take() {
            check(self.driver.route_del(&route).await);
        }
        check(self.driver.destroy_set(&self.ipset_name).await);

        errors
    }

    /// Point the group's table at its interface
    ///
    /// Re-run by the orchestrator whenever the interface comes up; replaces
    /// any previously recorded route.
    pub async fn handle_interface_up(&self) -> Result<(), GroupError> {
        let mut state = self.state.lock().await;
        if state.table.is_none() {
            return Ok(());
        }
        self.bind_route(&mut state).await
    }

    async fn bind_route(&self, state: &mut GroupState) -> Result<(), GroupError> {
        let Some(table) = state.table else {
            return Ok(());
        };

        let Some(link_index) = self.driver.link_index(&self.spec.interface).await? else {
            warn!(
                group = self.spec.id,
                interface = %self.spec.interface,
                "interface not found, default route deferred until link-up"
            );
            return Ok(());
        };

        let route = RouteSpec::default_via(link_index, table);
        if let Some(old) = state.route.take() {
            if let Err(e) = self.driver.route_del(&old).await {
                warn!(group = self.spec.id, error = %e, "stale route removal failed");
            }
        }
        self.driver.route_add(&route).await?;
        state.route = Some(route);
        debug!(group = self.spec.id, link_index, table, "default route bound");
        Ok(())
    }

    /// (Re-)install this group's chains for `table` ∈ {all, mangle, nat}
    ///
    /// Safe to re-run after an external flush: every rule goes in through
    /// append-unique on a freshly cleared chain.
    pub async fn reinstall_for_table(&self, table: &str) -> Result<(), GroupError> {
        let state = self.state.lock().await;
        let Some(mark) = state.mark else {
            return Ok(());
        };
        self.install_for_table(table, mark).await
    }

    async fn install_for_table(&self, table: &str, mark: u32) -> Result<(), GroupError> {
        let mangle = table == "all" || table == "mangle";
        let nat = table == "all" || table == "nat";
        let mark_str = mark.to_string();

        if mangle && !self.software_routing {
            self.driver.clear_chain("mangle", &self.chain_name).await?;

            // Order is significant: the RETURN short-circuits before any
            // CONNMARK work happens for unmatched traffic.
            let chain_rules: [Vec<String>; 5] = [
                strs(&[
                    "-m", "set", "!", "--match-set", &self.ipset_name, "dst", "-j", "RETURN",
                ]),
                strs(&["-j", "CONNMARK", "--restore-mark"]),
                strs(&["-m", "mark", "--mark", &mark_str, "-j", "RETURN"]),
                strs(&[
                    "-m", "conntrack", "--ctstate", "NEW", "-j", "MARK", "--set-mark", &mark_str,
                ]),
                strs(&["-j", "CONNMARK", "--save-mark"]),
            ];
            for rule in &chain_rules {
                self.driver
                    .append_unique("mangle", &self.chain_name, rule)
                    .await?;
            }

            let hook = self.set_match_jump();
            self.driver
                .append_unique("mangle", "PREROUTING", &hook)
                .await?;
            self.driver.append_unique("mangle", "OUTPUT", &hook).await?;
        }

        if mangle && self.software_routing {
            let prr = format!("{}_PRR", self.chain_name);
            self.driver.clear_chain("mangle", &prr).await?;
            self.driver
                .append_unique(
                    "mangle",
                    &prr,
                    &strs(&[
                        "-m",
                        "set",
                        "--match-set",
                        &self.ipset_name,
                        "dst",
                        "-j",
                        "MARK",
                        "--set-mark",
                        &mark_str,
                    ]),
                )
                .await?;
            self.driver
                .append_unique("mangle", "PREROUTING", &jump(&prr))
                .await?;
        }

        if nat {
            let por = format!("{}_POR", self.chain_name);
            self.driver.clear_chain("nat", &por).await?;
            self.driver
                .append_unique(
                    "nat",
                    &por,
                    &strs(&["-o", &self.spec.interface, "-j", "MASQUERADE"]),
                )
                .await?;
            self.driver
                .append_unique("nat", "POSTROUTING", &jump(&por))
                .await?;
        }

        Ok(())
    }

    /// Add an address to the group's IP-set with `ttl` as entry timeout
    ///
    /// A zero timeout would make the kernel entry permanent, so the timeout
    /// floors at one second.
    pub async fn add_ipv4(&self, addr: Ipv4Addr, ttl: Duration) -> Result<(), GroupError> {
        let timeout = ttl.as_secs().max(1).min(u64::from(u32::MAX)) as u32;
        self.driver
            .add_member(&self.ipset_name, addr, timeout)
            .await?;
        debug!(group = self.spec.id, address = %addr, timeout, "address added");
        Ok(())
    }

    /// Remove an address from the group's IP-set
    pub async fn del_ipv4(&self, addr: Ipv4Addr) -> Result<(), GroupError> {
        self.driver.del_member(&self.ipset_name, addr).await?;
        Ok(())
    }

    /// Current IP-set members with their remaining timeouts
    pub async fn list_ipv4(&self) -> Result<HashMap<Ipv4Addr, u32>, GroupError> {
        Ok(self.driver.list_members(&self.ipset_name).await?)
    }

    fn set_match_jump(&self) -> Vec<String> {
        strs(&[
            "-m",
            "set",
            "--match-set",
            &self.ipset_name,
            "dst",
            "-j",
            &self.chain_name,
        ])
    }
}

/// Registered groups, in registration order
///
/// Registration order matters: teardown walks it in reverse.
#[derive(Default)]
pub struct GroupRegistry {
    map: HashMap<u32, Arc<Group>>,
    order: Vec<u32>,
}

impl GroupRegistry {
    /// Register a group; false when the id is already taken
    pub fn insert(&mut self, group: Arc<Group>) -> bool {
        let id = group.id();
        if self.map.contains_key(&id) {
            return false;
        }
        self.order.push(id);
        self.map.insert(id, group);
        true
    }

    /// Look up a group by id
    #[must_use]
    pub fn get(&self, id: u32) -> Option<Arc<Group>> {
        self.map.get(&id).cloned()
    }

    /// All groups in registration order
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Group>> {
        self.order
            .iter()
            .filter_map(|id| self.map.get(id).cloned())
            .collect()
    }

    /// All groups in reverse registration order
    #[must_use]
    pub fn all_reversed(&self) -> Vec<Arc<Group>> {
        let mut groups = self.all();
        groups.reverse();
        groups
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

fn jump(chain: &str) -> Vec<String> {
    vec!["-j".into(), chain.to_string()]
}

fn strs(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleSpec;
    use crate::nf::MemoryDriver;
    use crate::rules::RuleKind;

    fn group_spec(id: u32) -> GroupSpec {
        GroupSpec {
            id,
            name: format!("group-{id}"),
            interface: "wg0".into(),
            fix_protect: false,
            enabled: true,
            rules: vec![RuleSpec {
                id: 1,
                kind: RuleKind::Plaintext,
                pattern: "example.com".into(),
                enabled: true,
            }],
        }
    }

    fn make_group(driver: &Arc<MemoryDriver>, software: bool) -> Group {
        Group::new(
            group_spec(1),
            Arc::clone(driver) as Arc<dyn NetfilterDriver>,
            "RTMK_",
            "rtmk",
            software,
        )
    }

    #[tokio::test]
    async fn test_enable_installs_full_tuple() {
        let driver = Arc::new(MemoryDriver::new());
        driver.add_link("wg0", 3);
        let group = make_group(&driver, false);

        group.enable().await.unwrap();
        assert!(group.is_enabled());

        // policy rule + route
        assert_eq!(driver.policy_rules().len(), 1);
        let routes = driver.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].link_index, 3);

        // ipset
        assert_eq!(driver.set_names(), vec!["rtmk1".to_string()]);

        // mangle chain with the five rules in order
        let rules = driver.chain_rules("mangle", "RTMK_R_1").unwrap();
        assert_eq!(rules.len(), 5);
        assert!(rules[0].contains(&"RETURN".to_string()));
        assert!(rules[1].contains(&"--restore-mark".to_string()));
        assert!(rules[3].contains(&"--ctstate".to_string()));
        assert!(rules[4].contains(&"--save-mark".to_string()));

        // hooks
        assert_eq!(driver.chain_rules("mangle", "PREROUTING").unwrap().len(), 1);
        assert_eq!(driver.chain_rules("mangle", "OUTPUT").unwrap().len(), 1);
        let por = driver.chain_rules("nat", "RTMK_R_1_POR").unwrap();
        assert!(por[0].contains(&"MASQUERADE".to_string()));
        assert_eq!(driver.chain_rules("nat", "POSTROUTING").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_software_routing_layout() {
        let driver = Arc::new(MemoryDriver::new());
        driver.add_link("wg0", 3);
        let group = make_group(&driver, true);

        group.enable().await.unwrap();

        let rules = driver.chain_rules("mangle", "RTMK_R_1_PRR").unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].contains(&"MARK".to_string()));
        assert!(
            !rules[0].contains(&"CONNMARK".to_string()),
            "software mode omits CONNMARK"
        );
        assert!(driver.chain_rules("mangle", "RTMK_R_1").is_none());
        assert!(driver.chain_rules("nat", "RTMK_R_1_POR").is_some());
    }

    #[tokio::test]
    async fn test_enable_without_interface_defers_route() {
        let driver = Arc::new(MemoryDriver::new());
        let group = make_group(&driver, false);

        group.enable().await.unwrap();
        assert!(driver.routes().is_empty());

        driver.add_link("wg0", 9);
        group.handle_interface_up().await.unwrap();
        let routes = driver.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].link_index, 9);
    }

    #[tokio::test]
    async fn test_interface_up_replaces_route() {
        let driver = Arc::new(MemoryDriver::new());
        driver.add_link("wg0", 3);
        let group = make_group(&driver, false);
        group.enable().await.unwrap();

        // interface recreated with a new index
        driver.add_link("wg0", 11);
        group.handle_interface_up().await.unwrap();

        let routes = driver.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].link_index, 11);
    }

    #[tokio::test]
    async fn test_disable_removes_everything() {
        let driver = Arc::new(MemoryDriver::new());
        driver.add_link("wg0", 3);
        let group = make_group(&driver, false);
        group.enable().await.unwrap();

        let errors = group.disable().await;
        assert!(errors.is_empty());
        assert!(!group.is_enabled());
        assert!(driver.policy_rules().is_empty());
        assert!(driver.routes().is_empty());
        assert!(driver.set_names().is_empty());
        assert!(driver.chain_rules("mangle", "RTMK_R_1").is_none());
        assert!(driver.chain_rules("nat", "RTMK_R_1_POR").is_none());
        assert!(driver.chain_rules("mangle", "PREROUTING").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_ipv4_floors_timeout() {
        let driver = Arc::new(MemoryDriver::new());
        driver.add_link("wg0", 3);
        let group = make_group(&driver, false);
        group.enable().await.unwrap();

        group
            .add_ipv4(Ipv4Addr::new(1, 2, 3, 4), Duration::ZERO)
            .await
            .unwrap();
        let members = group.list_ipv4().await.unwrap();
        assert_eq!(members[&Ipv4Addr::new(1, 2, 3, 4)], 1);
    }

    #[tokio::test]
    async fn test_reinstall_for_table_scopes() {
        let driver = Arc::new(MemoryDriver::new());
        driver.add_link("wg0", 3);
        let group = make_group(&driver, false);
        group.enable().await.unwrap();

        driver.flush_table("nat");
        group.reinstall_for_table("nat").await.unwrap();
        assert!(driver.chain_rules("nat", "RTMK_R_1_POR").is_some());

        driver.flush_table("mangle");
        group.reinstall_for_table("mangle").await.unwrap();
        assert_eq!(driver.chain_rules("mangle", "RTMK_R_1").unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_matches_any() {
        let driver = Arc::new(MemoryDriver::new());
        let group = make_group(&driver, false);
        assert!(group.matches_any(&["example.com".to_string()]));
        assert!(!group.matches_any(&["other.org".to_string()]));
    }
}
