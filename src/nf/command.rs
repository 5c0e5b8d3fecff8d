//! Production netfilter driver
//!
//! Drives the kernel through the stock `iptables`, `ipset` and `ip`
//! binaries. Shelling out keeps the daemon portable across the embedded
//! router firmwares this targets, where the binaries are guaranteed but
//! netlink library support is not.
//!
//! Link events come from a long-lived `ip -o monitor link` child whose
//! stdout lines are parsed and fanned out over a broadcast channel.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use super::driver::{LinkChange, LinkEvent, NetfilterDriver, PolicyRule, RouteSpec};
use crate::error::NetfilterError;

const IPTABLES: &str = "iptables";
const IPSET: &str = "ipset";
const IP: &str = "ip";

/// Shell-out driver over iptables/ipset/ip
pub struct CommandDriver {
    link_tx: broadcast::Sender<LinkEvent>,
    monitor_started: AtomicBool,
    /// index → name, filled as links are resolved; `ip route` takes device
    /// names while the driver API speaks indexes
    link_names: Mutex<HashMap<u32, String>>,
}

impl Default for CommandDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandDriver {
    #[must_use]
    pub fn new() -> Self {
        let (link_tx, _) = broadcast::channel(64);
        Self {
            link_tx,
            monitor_started: AtomicBool::new(false),
            link_names: Mutex::new(HashMap::new()),
        }
    }

    /// Run a command, returning stdout on exit 0 and a classified error
    /// otherwise
    async fn run(program: &str, args: &[String]) -> Result<String, NetfilterError> {
        debug!(program, args = %args.join(" "), "exec");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| NetfilterError::Spawn {
                program: program.to_string(),
                source: e,
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_eexist(&stderr) {
            return Err(NetfilterError::AlreadyExists(stderr));
        }
        if is_enoent(&stderr) {
            return Err(NetfilterError::NotFound(stderr));
        }
        Err(NetfilterError::command(program, args, stderr))
    }

    /// Run a command where "object missing" counts as success
    async fn run_ignore_missing(program: &str, args: &[String]) -> Result<(), NetfilterError> {
        match Self::run(program, args).await {
            Ok(_) | Err(NetfilterError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// True when an iptables rule matching `spec` exists in the chain
    async fn rule_exists(table: &str, chain: &str, spec: &[String]) -> bool {
        let mut args = strings(&["-t", table, "-C", chain]);
        args.extend_from_slice(spec);
        Self::run(IPTABLES, &args).await.is_ok()
    }

    async fn link_name_for(&self, index: u32) -> Result<String, NetfilterError> {
        if let Some(name) = self.link_names.lock().get(&index) {
            return Ok(name.clone());
        }
        let out = Self::run(IP, &strings(&["-o", "link", "show"])).await?;
        for line in out.lines() {
            if let Some((idx, name)) = parse_link_line(line) {
                self.link_names.lock().insert(idx, name);
            }
        }
        self.link_names
            .lock()
            .get(&index)
            .cloned()
            .ok_or_else(|| NetfilterError::NotFound(format!("link index {index}")))
    }

    fn spawn_monitor(&self) {
        if self.monitor_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let tx = self.link_tx.clone();
        tokio::spawn(async move {
            let child = Command::new(IP)
                .args(["-o", "monitor", "link"])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn();

            let mut child = match child {
                Ok(child) => child,
                Err(e) => {
                    error!(error = %e, "failed to spawn ip monitor, link events disabled");
                    return;
                }
            };

            let Some(stdout) = child.stdout.take() else {
                error!("ip monitor has no stdout, link events disabled");
                return;
            };

            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_monitor_line(&line) {
                            let _ = tx.send(event);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "ip monitor read error");
                        break;
                    }
                }
            }
            warn!("ip monitor exited, link events stopped");
        });
    }
}

#[async_trait]
impl NetfilterDriver for CommandDriver {
    async fn clear_chain(&self, table: &str, chain: &str) -> Result<(), NetfilterError> {
        // -N fails on an existing chain, which is fine: the flush follows
        match Self::run(IPTABLES, &strings(&["-t", table, "-N", chain])).await {
            Ok(_) | Err(NetfilterError::AlreadyExists(_)) => {}
            Err(NetfilterError::CommandFailed { stderr, .. })
                if stderr.contains("Chain already exists") => {}
            Err(e) => return Err(e),
        }
        Self::run(IPTABLES, &strings(&["-t", table, "-F", chain])).await?;
        Ok(())
    }

    async fn clear_and_delete_chain(
        &self,
        table: &str,
        chain: &str,
    ) -> Result<(), NetfilterError> {
        Self::run_ignore_missing(IPTABLES, &strings(&["-t", table, "-F", chain])).await?;
        Self::run_ignore_missing(IPTABLES, &strings(&["-t", table, "-X", chain])).await
    }

    async fn append_unique(
        &self,
        table: &str,
        chain: &str,
        spec: &[String],
    ) -> Result<(), NetfilterError> {
        if Self::rule_exists(table, chain, spec).await {
            return Ok(());
        }
        let mut args = strings(&["-t", table, "-A", chain]);
        args.extend_from_slice(spec);
        Self::run(IPTABLES, &args).await.map(drop)
    }

    async fn insert_unique(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        spec: &[String],
    ) -> Result<(), NetfilterError> {
        if Self::rule_exists(table, chain, spec).await {
            return Ok(());
        }
        let mut args = strings(&["-t", table, "-I", chain]);
        args.push(position.to_string());
        args.extend_from_slice(spec);
        Self::run(IPTABLES, &args).await.map(drop)
    }

    async fn delete_if_exists(
        &self,
        table: &str,
        chain: &str,
        spec: &[String],
    ) -> Result<(), NetfilterError> {
        if !Self::rule_exists(table, chain, spec).await {
            return Ok(());
        }
        let mut args = strings(&["-t", table, "-D", chain]);
        args.extend_from_slice(spec);
        Self::run(IPTABLES, &args).await.map(drop)
    }

    async fn create_set(
        &self,
        name: &str,
        default_timeout_secs: u32,
    ) -> Result<(), NetfilterError> {
        let args = strings(&[
            "create",
            name,
            "hash:ip",
            "timeout",
            &default_timeout_secs.to_string(),
            "-exist",
        ]);
        Self::run(IPSET, &args).await.map(drop)
    }

    async fn destroy_set(&self, name: &str) -> Result<(), NetfilterError> {
        match Self::run(IPSET, &strings(&["destroy", name])).await {
            Ok(_) | Err(NetfilterError::NotFound(_)) => Ok(()),
            Err(NetfilterError::CommandFailed { stderr, .. })
                if stderr.contains("does not exist") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn add_member(
        &self,
        set: &str,
        addr: Ipv4Addr,
        timeout_secs: u32,
    ) -> Result<(), NetfilterError> {
        let args = strings(&[
            "add",
            set,
            &addr.to_string(),
            "timeout",
            &timeout_secs.to_string(),
            "-exist",
        ]);
        Self::run(IPSET, &args).await.map(drop)
    }

    async fn del_member(&self, set: &str, addr: Ipv4Addr) -> Result<(), NetfilterError> {
        let args = strings(&["del", set, &addr.to_string(), "-exist"]);
        Self::run(IPSET, &args).await.map(drop)
    }

    async fn list_members(&self, set: &str) -> Result<HashMap<Ipv4Addr, u32>, NetfilterError> {
        let out = Self::run(IPSET, &strings(&["list", set])).await?;
        Ok(parse_ipset_list(&out))
    }

    async fn rule_list(&self) -> Result<Vec<PolicyRule>, NetfilterError> {
        let out = Self::run(IP, &strings(&["-4", "rule", "show"])).await?;
        Ok(out.lines().filter_map(parse_rule_line).collect())
    }

    async fn rule_add(&self, mark: u32, table: u32) -> Result<(), NetfilterError> {
        let args = strings(&[
            "-4",
            "rule",
            "add",
            "fwmark",
            &mark.to_string(),
            "table",
            &table.to_string(),
        ]);
        Self::run(IP, &args).await.map(drop)
    }

    async fn rule_del(&self, mark: u32, table: u32) -> Result<(), NetfilterError> {
        let args = strings(&[
            "-4",
            "rule",
            "del",
            "fwmark",
            &mark.to_string(),
            "table",
            &table.to_string(),
        ]);
        Self::run_ignore_missing(IP, &args).await
    }

    async fn route_list(&self) -> Result<Vec<RouteSpec>, NetfilterError> {
        let out = Self::run(IP, &strings(&["-4", "route", "show", "table", "all"])).await?;
        Ok(out.lines().filter_map(parse_route_line).collect())
    }

    async fn route_add(&self, route: &RouteSpec) -> Result<(), NetfilterError> {
        let dev = self.link_name_for(route.link_index).await?;
        // `replace` makes re-adding after an interface flap idempotent
        let args = strings(&[
            "-4",
            "route",
            "replace",
            &dst_arg(route.dst),
            "dev",
            &dev,
            "table",
            &route.table.to_string(),
        ]);
        Self::run(IP, &args).await.map(drop)
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), NetfilterError> {
        let dev = match self.link_name_for(route.link_index).await {
            Ok(dev) => dev,
            // The interface is gone; so is the route.
            Err(NetfilterError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let args = strings(&[
            "-4",
            "route",
            "del",
            &dst_arg(route.dst),
            "dev",
            &dev,
            "table",
            &route.table.to_string(),
        ]);
        Self::run_ignore_missing(IP, &args).await
    }

    async fn link_index(&self, name: &str) -> Result<Option<u32>, NetfilterError> {
        let args = strings(&["-o", "link", "show", name]);
        match Self::run(IP, &args).await {
            Ok(out) => {
                if let Some((index, parsed)) = out.lines().next().and_then(parse_link_line) {
                    self.link_names.lock().insert(index, parsed);
                    return Ok(Some(index));
                }
                Err(NetfilterError::Parse {
                    what: "ip link",
                    line: out.lines().next().unwrap_or("").to_string(),
                })
            }
            Err(NetfilterError::NotFound(_)) => Ok(None),
            Err(NetfilterError::CommandFailed { stderr, .. })
                if stderr.contains("does not exist") =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn subscribe_links(&self) -> broadcast::Receiver<LinkEvent> {
        self.spawn_monitor();
        self.link_tx.subscribe()
    }
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

fn dst_arg(dst: Ipv4Net) -> String {
    if dst.prefix_len() == 0 {
        "default".to_string()
    } else {
        dst.to_string()
    }
}

fn is_eexist(stderr: &str) -> bool {
    stderr.contains("File exists")
}

fn is_enoent(stderr: &str) -> bool {
    stderr.contains("No such file or directory")
        || stderr.contains("No such process")
        || stderr.contains("No chain/target/match by that name")
}

/// Map the named tables `ip` prints back to their numbers
fn table_number(token: &str) -> Option<u32> {
    match token {
        "local" => Some(255),
        "main" => Some(254),
        "default" => Some(253),
        other => other.parse().ok(),
    }
}

/// Parse one `ip -4 rule show` line, keeping only fwmark rules
///
/// Example: `32765:  from all fwmark 0x11 lookup 101`
fn parse_rule_line(line: &str) -> Option<PolicyRule> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mark_pos = tokens.iter().position(|t| *t == "fwmark")?;
    let lookup_pos = tokens.iter().position(|t| *t == "lookup" || *t == "table")?;

    let mark_token = tokens.get(mark_pos + 1)?;
    let mark = if let Some(hex) = mark_token.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()?
    } else {
        mark_token.parse().ok()?
    };
    let table = table_number(tokens.get(lookup_pos + 1)?)?;
    Some(PolicyRule { mark, table })
}

/// Parse one `ip -4 route show table all` line
///
/// Only the table number matters to the allocator; routes in the main table
/// carry no `table` token and are reported as table 254.
fn parse_route_line(line: &str) -> Option<RouteSpec> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let dst_token = tokens.first()?;
    if *dst_token == "broadcast" || *dst_token == "local" || *dst_token == "unreachable" {
        return None;
    }
    let dst = if *dst_token == "default" {
        Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).ok()?
    } else if dst_token.contains('/') {
        dst_token.parse().ok()?
    } else {
        Ipv4Net::new(dst_token.parse().ok()?, 32).ok()?
    };

    let table = tokens
        .iter()
        .position(|t| *t == "table")
        .and_then(|pos| tokens.get(pos + 1))
        .and_then(|t| table_number(t))
        .unwrap_or(254);

    Some(RouteSpec {
        link_index: 0,
        table,
        dst,
    })
}

/// Parse one `ip -o link show` line: `3: wg0: <POINTOPOINT,UP> ...`
fn parse_link_line(line: &str) -> Option<(u32, String)> {
    let mut parts = line.splitn(3, ':');
    let index = parts.next()?.trim().parse().ok()?;
    let name = parts.next()?.trim();
    let name = name.split('@').next().unwrap_or(name);
    if name.is_empty() {
        return None;
    }
    Some((index, name.to_string()))
}

/// Parse one `ip -o monitor link` line into a link event
fn parse_monitor_line(line: &str) -> Option<LinkEvent> {
    let (change, rest) = if let Some(rest) = line.strip_prefix("Deleted ") {
        (LinkChange::Removed, rest)
    } else {
        (LinkChange::State, line)
    };

    let (index, name) = parse_link_line(rest)?;
    let up = !rest.contains("state DOWN");
    Some(LinkEvent {
        name,
        index,
        change,
        up,
    })
}

/// Parse `ipset list <name>` output into member → remaining timeout
fn parse_ipset_list(out: &str) -> HashMap<Ipv4Addr, u32> {
    let mut members = HashMap::new();
    let mut in_members = false;
    for line in out.lines() {
        if line.starts_with("Members:") {
            in_members = true;
            continue;
        }
        if !in_members {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let Some(addr) = tokens.next().and_then(|t| t.parse::<Ipv4Addr>().ok()) else {
            continue;
        };
        let timeout = match (tokens.next(), tokens.next()) {
            (Some("timeout"), Some(value)) => value.parse().unwrap_or(0),
            _ => 0,
        };
        members.insert(addr, timeout);
    }
    members
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rule_line() {
        let rule = parse_rule_line("32765:\tfrom all fwmark 0x11 lookup 101").unwrap();
        assert_eq!(rule, PolicyRule { mark: 0x11, table: 101 });

        let rule = parse_rule_line("100: from all fwmark 5 table main").unwrap();
        assert_eq!(rule, PolicyRule { mark: 5, table: 254 });

        assert!(parse_rule_line("0:\tfrom all lookup local").is_none());
    }

    #[test]
    fn test_parse_route_line() {
        let route = parse_route_line("default via 10.0.0.1 dev wg0 table 101").unwrap();
        assert_eq!(route.table, 101);
        assert_eq!(route.dst.prefix_len(), 0);

        let route = parse_route_line("10.0.0.0/24 dev eth0 proto kernel scope link").unwrap();
        assert_eq!(route.table, 254);

        assert!(parse_route_line("broadcast 10.0.0.255 dev eth0 table local").is_none());
    }

    #[test]
    fn test_parse_link_line() {
        let (index, name) =
            parse_link_line("3: wg0: <POINTOPOINT,NOARP,UP,LOWER_UP> mtu 1420").unwrap();
        assert_eq!(index, 3);
        assert_eq!(name, "wg0");

        // VLAN-style names carry an @parent suffix
        let (_, name) = parse_link_line("4: eth0.10@eth0: <BROADCAST> mtu 1500").unwrap();
        assert_eq!(name, "eth0.10");
    }

    #[test]
    fn test_parse_monitor_line() {
        let ev = parse_monitor_line(
            "3: wg0: <POINTOPOINT,UP,LOWER_UP> mtu 1420 state UNKNOWN ",
        )
        .unwrap();
        assert_eq!(ev.name, "wg0");
        assert!(ev.up);
        assert_eq!(ev.change, LinkChange::State);

        let ev = parse_monitor_line("5: eth1: <BROADCAST> mtu 1500 state DOWN ").unwrap();
        assert!(!ev.up);

        let ev = parse_monitor_line("Deleted 7: tun0: <POINTOPOINT> mtu 1400").unwrap();
        assert_eq!(ev.change, LinkChange::Removed);
    }

    #[test]
    fn test_parse_ipset_list() {
        let out = "Name: rtmk1\n\
                   Type: hash:ip\n\
                   Header: family inet hashsize 1024 maxelem 65536 timeout 300\n\
                   Members:\n\
                   93.184.216.34 timeout 3599\n\
                   1.2.3.4 timeout 42\n";
        let members = parse_ipset_list(out);
        assert_eq!(members.len(), 2);
        assert_eq!(members[&Ipv4Addr::new(93, 184, 216, 34)], 3599);
        assert_eq!(members[&Ipv4Addr::new(1, 2, 3, 4)], 42);
    }
}
