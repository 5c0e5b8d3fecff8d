//! Configuration types for routemark
//!
//! Loaded from JSON and validated at startup. Group and rule definitions are
//! plain data here; they are compiled into runtime objects when the daemon
//! registers the groups.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::rules::RuleKind;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Floor applied to every observed record's TTL, in seconds
    #[serde(default = "default_minimal_ttl_secs")]
    pub minimal_ttl_secs: u64,

    /// Prefix of every iptables chain the daemon creates
    #[serde(default = "default_chain_prefix")]
    pub chain_prefix: String,

    /// Prefix of every IP-set the daemon creates
    #[serde(default = "default_ipset_prefix")]
    pub ipset_prefix: String,

    /// Upstream resolver, host:port
    #[serde(default = "default_upstream")]
    pub target_dns_server_address: String,

    /// Local UDP port the proxy listens on (0 = ephemeral)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Use the simplified mangle layout without CONNMARK
    #[serde(default)]
    pub use_software_routing: bool,

    /// Unix socket receiving `netfilter.d:<event>:<table>` notifications
    #[serde(default = "default_notify_socket")]
    pub notify_socket_path: PathBuf,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Routing groups
    #[serde(default)]
    pub groups: Vec<GroupSpec>,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chain_prefix.is_empty() {
            return Err(ConfigError::validation("chain_prefix must not be empty"));
        }
        if self.ipset_prefix.is_empty() {
            return Err(ConfigError::validation("ipset_prefix must not be empty"));
        }
        if self
            .target_dns_server_address
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(ConfigError::validation(format!(
                "target_dns_server_address {:?} is not host:port",
                self.target_dns_server_address
            )));
        }

        let mut group_ids = std::collections::HashSet::new();
        for group in &self.groups {
            group.validate()?;
            if !group_ids.insert(group.id) {
                return Err(ConfigError::validation(format!(
                    "duplicate group id: {}",
                    group.id
                )));
            }
        }

        Ok(())
    }

    /// The TTL floor as a Duration
    #[must_use]
    pub const fn minimal_ttl(&self) -> Duration {
        Duration::from_secs(self.minimal_ttl_secs)
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            minimal_ttl_secs: default_minimal_ttl_secs(),
            chain_prefix: default_chain_prefix(),
            ipset_prefix: default_ipset_prefix(),
            target_dns_server_address: default_upstream(),
            listen_port: default_listen_port(),
            use_software_routing: false,
            notify_socket_path: default_notify_socket(),
            log: LogConfig::default(),
            groups: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// One routing group as configured
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupSpec {
    /// Unique group id; names the group's IP-set and chains
    pub id: u32,

    /// Human-readable name
    pub name: String,

    /// Egress interface traffic of this group leaves through
    pub interface: String,

    /// Reserved for router-specific protection rules
    #[serde(default)]
    pub fix_protect: bool,

    /// Whether the group's kernel tuple is installed at startup
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Domain rules deciding membership
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

impl GroupSpec {
    /// Validate one group definition
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::validation(format!(
                "group {} has an empty name",
                self.id
            )));
        }
        if self.interface.is_empty() {
            return Err(ConfigError::validation(format!(
                "group {} has an empty interface",
                self.id
            )));
        }

        let mut rule_ids = std::collections::HashSet::new();
        for rule in &self.rules {
            if !rule_ids.insert(rule.id) {
                return Err(ConfigError::validation(format!(
                    "group {} has duplicate rule id {}",
                    self.id, rule.id
                )));
            }
            if rule.pattern.is_empty() {
                return Err(ConfigError::validation(format!(
                    "group {} rule {} has an empty pattern",
                    self.id, rule.id
                )));
            }
        }

        Ok(())
    }
}

/// One domain rule as configured
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleSpec {
    pub id: u32,
    pub kind: RuleKind,
    pub pattern: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_minimal_ttl_secs() -> u64 {
    3600
}

fn default_chain_prefix() -> String {
    "RTMK_".into()
}

fn default_ipset_prefix() -> String {
    "rtmk".into()
}

fn default_upstream() -> String {
    "127.0.0.1:53".into()
}

fn default_listen_port() -> u16 {
    7548
}

fn default_notify_socket() -> PathBuf {
    PathBuf::from("/var/run/routemark.sock")
}

fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default_config();
        config.validate().unwrap();
        assert_eq!(config.minimal_ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn test_rejects_bad_upstream() {
        let mut config = Config::default_config();
        config.target_dns_server_address = "not-an-address".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_group_ids() {
        let mut config = Config::default_config();
        let group = GroupSpec {
            id: 1,
            name: "a".into(),
            interface: "wg0".into(),
            fix_protect: false,
            enabled: true,
            rules: Vec::new(),
        };
        config.groups.push(group.clone());
        config.groups.push(group);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rule_kind_serde_names() {
        let json = r#"{"id":1,"kind":"wildcard","pattern":"*.example.com"}"#;
        let rule: RuleSpec = serde_json::from_str(json).unwrap();
        assert_eq!(rule.kind, RuleKind::Wildcard);
        assert!(rule.enabled, "enabled defaults to true");
    }
}
