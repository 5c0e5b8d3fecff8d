//! routemark: DNS-driven policy routing
//!
//! routemark diverts outbound traffic to configured network interfaces based
//! on DNS names. It transparently proxies local clients' DNS traffic to an
//! upstream resolver, watches the answers, and whenever a resolved name
//! matches an operator rule it installs the IPv4 address into a timed kernel
//! IP-set wired into netfilter and routing-policy rules, so packets to that
//! address egress through the rule group's interface.
//!
//! # Architecture
//!
//! ```text
//! client → UDP:53 ─(nat REDIRECT)→ proxy → upstream resolver
//!                                    │
//!                              parsed answers
//!                                    │
//!                   record store ← reconciler → group IP-sets
//!                                                   │
//!                            fwmark → policy rule → per-group table → iface
//! ```
//!
//! # Modules
//!
//! - [`codec`]: DNS wire codec with a compression-safe parser
//! - [`store`]: TTL-aware A/CNAME record cache with alias traversal
//! - [`rules`]: plaintext / wildcard / regex domain rules
//! - [`proxy`]: transparent UDP DNS proxy
//! - [`nf`]: idempotent netfilter driver layer (iptables / ipset / routes)
//! - [`group`]: per-group kernel lifecycle (mark, table, rule, route, chains)
//! - [`reconciler`]: maps observed records to group IP-set membership
//! - [`daemon`]: orchestration, link events, flush notifications, teardown
//! - [`config`]: configuration types and loading
//! - [`error`]: error types

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod codec;
pub mod config;
pub mod daemon;
pub mod error;
pub mod group;
pub mod nf;
pub mod proxy;
pub mod reconciler;
pub mod rules;
pub mod store;

pub use codec::{decode, DecodeError, DnsMessage, DnsName, Flags, RecordData, ResourceRecord};
pub use config::{load_config, load_config_with_env, Config, GroupSpec, RuleSpec};
pub use daemon::{Daemon, FlushNotice};
pub use error::{
    ConfigError, DaemonError, GroupError, NetfilterError, ProxyError, Result, RoutemarkError,
};
pub use group::{Group, GroupRegistry};
pub use nf::{CommandDriver, JournaledDriver, MemoryDriver, NetfilterDriver, PortRemap};
pub use proxy::{DnsProxy, MessageHandler};
pub use reconciler::Reconciler;
pub use rules::{DomainRule, RuleKind};
pub use store::{AliasDirection, RecordStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
