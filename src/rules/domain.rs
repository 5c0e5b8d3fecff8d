//! Domain rule matching
//!
//! A [`DomainRule`] tests a resolved name against one operator pattern.
//! Three kinds are supported:
//!
//! - **plaintext** — byte equality after ASCII case-folding both sides
//! - **wildcard** — glob semantics: `*` matches any run of characters
//!   (including empty), `?` matches exactly one; no escaping
//! - **regex** — the operator's pattern verbatim; anchoring is up to the
//!   operator
//!
//! Patterns are compiled exactly once at load time. A regex that fails to
//! compile is reported there and the rule simply never matches afterwards;
//! a broken rule must not take the group down.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// The kind of a domain rule pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Plaintext,
    Wildcard,
    Regex,
}

/// Compiled matcher behind a rule
#[derive(Debug, Clone)]
enum Matcher {
    /// Lowercased literal
    Plain(String),
    /// Wildcard or regex pattern compiled to a regex
    Pattern(Regex),
    /// Pattern failed to compile; never matches
    Broken,
}

/// One operator-configured domain rule
#[derive(Debug, Clone)]
pub struct DomainRule {
    id: u32,
    kind: RuleKind,
    pattern: String,
    enabled: bool,
    matcher: Matcher,
}

impl DomainRule {
    /// Compile a rule from its raw configuration
    pub fn new(id: u32, kind: RuleKind, pattern: &str, enabled: bool) -> Self {
        let matcher = match kind {
            RuleKind::Plaintext => Matcher::Plain(pattern.to_ascii_lowercase()),
            RuleKind::Wildcard => match Regex::new(&wildcard_to_regex(pattern)) {
                Ok(re) => Matcher::Pattern(re),
                Err(e) => {
                    warn!(rule = id, pattern, error = %e, "wildcard rule failed to compile");
                    Matcher::Broken
                }
            },
            RuleKind::Regex => match Regex::new(pattern) {
                Ok(re) => Matcher::Pattern(re),
                Err(e) => {
                    warn!(rule = id, pattern, error = %e, "regex rule failed to compile");
                    Matcher::Broken
                }
            },
        };

        Self {
            id,
            kind,
            pattern: pattern.to_string(),
            enabled,
            matcher,
        }
    }

    /// Rule id as configured
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Rule kind
    #[must_use]
    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    /// Raw pattern as configured
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether the operator enabled this rule
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Test a domain name against this rule
    ///
    /// The input is case-folded before matching; enabled-ness is the
    /// caller's concern.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        match &self.matcher {
            Matcher::Plain(literal) => name == *literal,
            Matcher::Pattern(re) => re.is_match(&name),
            Matcher::Broken => false,
        }
    }
}

/// Translate a `*`/`?` glob into an anchored regex
///
/// The pattern is lowercased to pair with the case-folded input; every
/// non-wildcard character is escaped literally.
fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.to_ascii_lowercase().chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plaintext() {
        let rule = DomainRule::new(1, RuleKind::Plaintext, "example.com", true);
        assert!(rule.matches("example.com"));
        assert!(rule.matches("EXAMPLE.COM"));
        assert!(!rule.matches("noexample.com"));
        assert!(!rule.matches("www.example.com"));
    }

    #[test]
    fn test_wildcard() {
        let rule = DomainRule::new(2, RuleKind::Wildcard, "ex*le.com", true);
        assert!(rule.matches("example.com"));
        assert!(rule.matches("exle.com"));
        assert!(!rule.matches("noexample.com"));

        let rule = DomainRule::new(3, RuleKind::Wildcard, "*.example.com", true);
        assert!(rule.matches("www.example.com"));
        assert!(!rule.matches("example.com"));

        let rule = DomainRule::new(4, RuleKind::Wildcard, "e?ample.com", true);
        assert!(rule.matches("example.com"));
        assert!(!rule.matches("exxample.com"));
    }

    #[test]
    fn test_wildcard_escapes_dots() {
        let rule = DomainRule::new(5, RuleKind::Wildcard, "example.com", true);
        assert!(!rule.matches("exampleXcom"), "dot must match literally");
    }

    #[test]
    fn test_regex() {
        let rule = DomainRule::new(6, RuleKind::Regex, "^ex[apm]{3}le.com$", true);
        assert!(rule.matches("example.com"));
        assert!(!rule.matches("noexample.com"));
    }

    #[test]
    fn test_broken_regex_never_matches() {
        let rule = DomainRule::new(7, RuleKind::Regex, "([unclosed", true);
        assert!(!rule.matches("example.com"));
        assert!(!rule.matches("([unclosed"));
    }

    #[test]
    fn test_disabled_flag_is_exposed() {
        let rule = DomainRule::new(8, RuleKind::Plaintext, "example.com", false);
        assert!(!rule.is_enabled());
        // matches() stays pure; callers filter on is_enabled()
        assert!(rule.matches("example.com"));
    }
}
